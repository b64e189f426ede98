//! The Basic stack
//!
//! Control structures and procedure calls push tagged frames here. The
//! stack is accounted for in the workspace: it notionally grows down from
//! `HIMEM`, and pushing a frame that would take `stacktop` below `vartop`
//! fails with `StackFull`.

use crate::error::{ErrorKind, Result};
use crate::evaluator::LValue;
use crate::memory::Workspace;
use crate::variables::{Value, Variable};

/// A place in the program: code address plus the line it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub pc: usize,
    /// `None` for immediate-mode lines
    pub line: Option<u16>,
}

/// An installed `ON ERROR` handler
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorHandler {
    /// Where the handler statements start
    pub resume: Position,
    /// Installed with `ON ERROR LOCAL`
    pub local: bool,
    /// Stack depth when the handler was installed
    pub depth: usize,
    /// Function nesting level the handler belongs to
    pub fn_level: usize,
}

/// Where the next `READ` takes its data from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataPointer {
    /// Line header address to start searching for `DATA` from
    pub search_from: Option<usize>,
    /// Address of the next item inside the current `DATA` statement
    pub item: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Proc,
    Fn,
}

/// A PROC or FN activation
#[derive(Debug, Clone, PartialEq)]
pub struct CallFrame {
    pub kind: CallKind,
    /// Name including the `PROC`/`FN` prefix
    pub name: String,
    pub return_to: Position,
    /// `RETURN` parameters: formal name and the caller's variable
    pub returns: Vec<(String, LValue)>,
    /// Library the called definition lives in
    pub library: Option<String>,
}

/// A `FOR` loop
#[derive(Debug, Clone, PartialEq)]
pub struct ForFrame {
    /// Control variable name
    pub var: String,
    pub limit: Value,
    pub step: Value,
    /// First statement of the loop body
    pub body: Position,
}

/// Frames on the Basic stack
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    For(ForFrame),
    Repeat { body: Position },
    While { condition: Position },
    Gosub { return_to: Position },
    Call(CallFrame),
    /// Saved value of a `LOCAL` variable or parameter
    Local { name: String, saved: Option<Variable> },
    /// Saved value of a variable shadowed by `PRIVATE`
    Private { owner: String, name: String, saved: Option<Variable> },
    /// Handler saved by `LOCAL ERROR` or `ON ERROR LOCAL`
    Error(Option<ErrorHandler>),
    /// Data pointer saved by `LOCAL DATA`
    Data(DataPointer),
}

impl Frame {
    /// Bytes the frame occupies on the stack
    pub fn size(&self) -> usize {
        match self {
            Frame::For(_) => 48,
            Frame::Repeat { .. } | Frame::While { .. } | Frame::Gosub { .. } => 16,
            Frame::Call(call) => 32 + call.name.len() + call.returns.len() * 16,
            Frame::Local { name, saved } | Frame::Private { name, saved, .. } => {
                let payload = match saved {
                    Some(Variable::String(s)) => s.len(),
                    _ => 8,
                };
                16 + name.len() + payload
            }
            Frame::Error(_) => 24,
            Frame::Data(_) => 16,
        }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self, Frame::For(_) | Frame::Repeat { .. } | Frame::While { .. })
    }
}

/// One line of a traceback
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub name: String,
    pub called_from: Option<u16>,
    pub library: Option<String>,
}

/// The Basic stack
#[derive(Debug, Clone, Default)]
pub struct BasicStack {
    frames: Vec<Frame>,
    bytes: usize,
    calls: usize,
}

impl BasicStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of active PROC/FN calls
    pub fn call_depth(&self) -> usize {
        self.calls
    }

    /// Bytes in use
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Push a frame, failing if the stack would run into the heap
    pub fn push(&mut self, frame: Frame, mem: &mut Workspace) -> Result<()> {
        let bytes = self.bytes + frame.size();
        mem.set_stack_usage(bytes)?;
        if matches!(frame, Frame::Call(_)) {
            self.calls += 1;
        }
        self.bytes = bytes;
        self.frames.push(frame);
        Ok(())
    }

    /// Pop the top frame
    pub fn pop(&mut self, mem: &mut Workspace) -> Option<Frame> {
        let frame = self.frames.pop()?;
        self.release(&frame, mem);
        Some(frame)
    }

    fn release(&mut self, frame: &Frame, mem: &mut Workspace) {
        if matches!(frame, Frame::Call(_)) {
            self.calls -= 1;
        }
        self.bytes -= frame.size();
        // Shrinking can never collide with the heap
        let _ = mem.set_stack_usage(self.bytes);
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Frame at `index` counted from the bottom
    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    /// Index of the topmost frame matching `pred`, not looking past a
    /// PROC/FN boundary when `stop_at_call` is set
    pub fn find(&self, stop_at_call: bool, pred: impl Fn(&Frame) -> bool) -> Option<usize> {
        for (index, frame) in self.frames.iter().enumerate().rev() {
            if pred(frame) {
                return Some(index);
            }
            if stop_at_call && matches!(frame, Frame::Call(_) | Frame::Gosub { .. }) {
                return None;
            }
        }
        None
    }

    /// Pop frames down to `depth`, returning them top first
    pub fn truncate(&mut self, depth: usize, mem: &mut Workspace) -> Vec<Frame> {
        let mut popped = Vec::new();
        while self.frames.len() > depth {
            if let Some(frame) = self.pop(mem) {
                popped.push(frame);
            }
        }
        popped
    }

    /// Drop every frame without restoring anything
    pub fn clear(&mut self, mem: &mut Workspace) {
        self.frames.clear();
        self.bytes = 0;
        self.calls = 0;
        let _ = mem.set_stack_usage(0);
    }

    /// Innermost PROC/FN frame
    pub fn innermost_call(&self) -> Option<&CallFrame> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Call(call) => Some(call),
            _ => None,
        })
    }

    /// Up to `limit` active calls, innermost first
    pub fn traceback(&self, limit: usize) -> Vec<TraceEntry> {
        self.frames
            .iter()
            .rev()
            .filter_map(|f| match f {
                Frame::Call(call) => Some(TraceEntry {
                    name: call.name.clone(),
                    called_from: call.return_to.line,
                    library: call.library.clone(),
                }),
                _ => None,
            })
            .take(limit)
            .collect()
    }

    /// Check a frame limit before a call
    pub fn check_depth(&self, max_recursion: usize) -> Result<()> {
        if self.calls >= max_recursion {
            return Err(ErrorKind::TooDeep.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> Workspace {
        Workspace::new(32 * 1024).unwrap()
    }

    fn here() -> Position {
        Position { pc: 0x8000, line: Some(10) }
    }

    #[test]
    fn test_push_pop_accounting() {
        let mut mem = mem();
        let mut stack = BasicStack::new();
        stack.push(Frame::Repeat { body: here() }, &mut mem).unwrap();
        stack.push(Frame::Gosub { return_to: here() }, &mut mem).unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(mem.stacktop(), mem.himem() - 32);
        stack.pop(&mut mem);
        stack.pop(&mut mem);
        assert_eq!(mem.stacktop(), mem.himem());
        assert!(stack.pop(&mut mem).is_none());
    }

    #[test]
    fn test_stack_full() {
        let mut mem = mem();
        let mut stack = BasicStack::new();
        let free = mem.free_space();
        let mut result = Ok(());
        for _ in 0..free / 16 + 1 {
            result = stack.push(Frame::Repeat { body: here() }, &mut mem);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result.unwrap_err().kind, ErrorKind::StackFull);
        assert!(mem.stacktop() >= mem.vartop());
    }

    #[test]
    fn test_find_stops_at_call() {
        let mut mem = mem();
        let mut stack = BasicStack::new();
        stack.push(Frame::Repeat { body: here() }, &mut mem).unwrap();
        stack
            .push(
                Frame::Call(CallFrame {
                    kind: CallKind::Proc,
                    name: "PROCx".into(),
                    return_to: here(),
                    returns: Vec::new(),
                    library: None,
                }),
                &mut mem,
            )
            .unwrap();
        assert_eq!(stack.call_depth(), 1);
        assert_eq!(stack.find(true, |f| matches!(f, Frame::Repeat { .. })), None);
        assert_eq!(stack.find(false, |f| matches!(f, Frame::Repeat { .. })), Some(0));
        let trace = stack.traceback(10);
        assert_eq!(trace[0].name, "PROCx");
        assert_eq!(trace[0].called_from, Some(10));
        let popped = stack.truncate(0, &mut mem);
        assert_eq!(popped.len(), 2);
        assert_eq!(stack.call_depth(), 0);
    }
}
