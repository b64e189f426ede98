//! Workspace memory for the interpreter
//!
//! BASIC programs see one flat byte-addressed workspace. The bytes below
//! `PAGE` are free for indirection (`?`, `!`, `$`) the way the zero page and
//! OS workspace were on the original machines. From `PAGE` upwards the
//! layout is:
//!
//! ```text
//! page .. top        tokenised program text
//! lomem .. vartop    variable heap (DIM byte blocks, array storage)
//! stacktop .. himem  Basic stack (grows down from himem)
//! ```
//!
//! and `page <= top <= lomem <= vartop <= stacktop <= himem <= end` holds at
//! all times.

use crate::error::{BasicError, ErrorKind, Result};

/// Start of the program text
pub const PAGE: usize = 0x8000;

/// Byte-addressed workspace with the program, heap and stack regions
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Every addressable byte, including the area below `PAGE`
    ram: Vec<u8>,
    page: usize,
    top: usize,
    lomem: usize,
    vartop: usize,
    stacktop: usize,
    himem: usize,
}

impl Workspace {
    /// Create a workspace with `size` bytes above `PAGE`
    pub fn new(size: usize) -> Result<Self> {
        let total = PAGE
            .checked_add(size)
            .ok_or_else(|| BasicError::new(ErrorKind::NoMemory))?;
        let mut ram = Vec::new();
        ram.try_reserve_exact(total)
            .map_err(|_| BasicError::new(ErrorKind::NoMemory))?;
        ram.resize(total, 0);
        let mut workspace = Self {
            ram,
            page: PAGE,
            top: PAGE,
            lomem: PAGE,
            vartop: PAGE,
            stacktop: total,
            himem: total,
        };
        workspace.write_end_marker();
        Ok(workspace)
    }

    /// Total addressable size
    pub fn end(&self) -> usize {
        self.ram.len()
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn lomem(&self) -> usize {
        self.lomem
    }

    pub fn vartop(&self) -> usize {
        self.vartop
    }

    pub fn stacktop(&self) -> usize {
        self.stacktop
    }

    pub fn himem(&self) -> usize {
        self.himem
    }

    /// Write the end-of-program marker at `top` and reset the heap above it
    pub fn write_end_marker(&mut self) {
        let top = self.top;
        self.ram[top..top + 4].copy_from_slice(&[0, 0, 0xFF, 0xFF]);
        self.lomem = top + 4;
        self.vartop = self.lomem;
    }

    /// Move `top` after the program text has changed size
    pub(crate) fn set_top(&mut self, top: usize) -> Result<()> {
        if top + 4 > self.stacktop {
            return Err(ErrorKind::NoRoom.into());
        }
        self.top = top;
        self.write_end_marker();
        Ok(())
    }

    /// Set `LOMEM`. Discards the heap.
    pub fn set_lomem(&mut self, address: usize) -> Result<()> {
        if address < self.top + 4 || address >= self.stacktop {
            return Err(ErrorKind::WarnBadLomem.into());
        }
        self.lomem = address;
        self.vartop = address;
        Ok(())
    }

    /// Set `HIMEM`. Only allowed while the Basic stack is empty.
    pub fn set_himem(&mut self, address: usize) -> Result<()> {
        if address <= self.vartop || address > self.end() || self.stacktop != self.himem {
            return Err(ErrorKind::WarnBadHimem.into());
        }
        self.himem = address;
        self.stacktop = address;
        Ok(())
    }

    /// Set `PAGE`. The program is discarded.
    pub fn set_page(&mut self, address: usize) -> Result<()> {
        if address < 0x100 || address + 0x100 >= self.himem {
            return Err(ErrorKind::WarnBadPage.into());
        }
        self.page = address & !3;
        self.top = self.page;
        self.write_end_marker();
        Ok(())
    }

    /// Discard the variable heap
    pub fn clear_heap(&mut self) {
        self.vartop = self.lomem;
    }

    /// Reserve `size` bytes at the top of the heap, returning the address
    pub fn allocate(&mut self, size: usize) -> Result<usize> {
        let aligned = (size + 3) & !3;
        let start = self.vartop;
        if start + aligned > self.stacktop {
            return Err(ErrorKind::NoRoom.into());
        }
        self.vartop += aligned;
        self.ram[start..start + aligned].fill(0);
        Ok(start)
    }

    /// Account for the Basic stack occupying `bytes` below `himem`
    pub fn set_stack_usage(&mut self, bytes: usize) -> Result<()> {
        let stacktop = self.himem.saturating_sub(bytes);
        if stacktop < self.vartop {
            return Err(ErrorKind::StackFull.into());
        }
        self.stacktop = stacktop;
        Ok(())
    }

    /// Bytes free between the heap and the stack
    pub fn free_space(&self) -> usize {
        self.stacktop - self.vartop
    }

    fn check(&self, address: usize, len: usize) -> Result<usize> {
        match address.checked_add(len) {
            Some(end) if end <= self.ram.len() => Ok(address),
            _ => Err(BasicError::new(ErrorKind::Address).with_int(address as i64)),
        }
    }

    /// Read a byte from memory (`?address`)
    pub fn peek(&self, address: usize) -> Result<u8> {
        let addr = self.check(address, 1)?;
        Ok(self.ram[addr])
    }

    /// Write a byte to memory (`?address=value`)
    pub fn poke(&mut self, address: usize, value: u8) -> Result<()> {
        let addr = self.check(address, 1)?;
        self.ram[addr] = value;
        Ok(())
    }

    /// Read a 16-bit word from memory (little-endian)
    pub fn peek_word(&self, address: usize) -> Result<u16> {
        let addr = self.check(address, 2)?;
        Ok(u16::from_le_bytes([self.ram[addr], self.ram[addr + 1]]))
    }

    /// Write a 16-bit word to memory (little-endian)
    pub fn poke_word(&mut self, address: usize, value: u16) -> Result<()> {
        let addr = self.check(address, 2)?;
        self.ram[addr..addr + 2].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read a 32-bit integer (`!address`)
    pub fn peek_int(&self, address: usize) -> Result<i32> {
        let addr = self.check(address, 4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.ram[addr..addr + 4]);
        Ok(i32::from_le_bytes(bytes))
    }

    pub fn poke_int(&mut self, address: usize, value: i32) -> Result<()> {
        let addr = self.check(address, 4)?;
        self.ram[addr..addr + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read a 64-bit integer (`]address`)
    pub fn peek_int64(&self, address: usize) -> Result<i64> {
        let addr = self.check(address, 8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.ram[addr..addr + 8]);
        Ok(i64::from_le_bytes(bytes))
    }

    pub fn poke_int64(&mut self, address: usize, value: i64) -> Result<()> {
        let addr = self.check(address, 8)?;
        self.ram[addr..addr + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read a float (`|address`)
    pub fn peek_float(&self, address: usize) -> Result<f64> {
        Ok(f64::from_bits(self.peek_int64(address)? as u64))
    }

    pub fn poke_float(&mut self, address: usize, value: f64) -> Result<()> {
        self.poke_int64(address, value.to_bits() as i64)
    }

    /// Read a CR-terminated string (`$address`), at most `max` bytes
    pub fn peek_string(&self, address: usize, max: usize) -> Result<Vec<u8>> {
        self.check(address, 0)?;
        let limit = self.ram.len().min(address.saturating_add(max));
        let slice = &self.ram[address..limit];
        let len = slice.iter().position(|&b| b == b'\r').unwrap_or(slice.len());
        Ok(slice[..len].to_vec())
    }

    /// Write a string followed by CR (`$address=...`)
    pub fn poke_string(&mut self, address: usize, text: &[u8]) -> Result<()> {
        let addr = self.check(address, text.len() + 1)?;
        self.ram[addr..addr + text.len()].copy_from_slice(text);
        self.ram[addr + text.len()] = b'\r';
        Ok(())
    }

    /// Borrow a block of memory
    pub fn slice(&self, address: usize, len: usize) -> Result<&[u8]> {
        let addr = self.check(address, len)?;
        Ok(&self.ram[addr..addr + len])
    }

    pub(crate) fn slice_mut(&mut self, address: usize, len: usize) -> Result<&mut [u8]> {
        let addr = self.check(address, len)?;
        Ok(&mut self.ram[addr..addr + len])
    }

    /// Copy bytes into memory
    pub fn write_bytes(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
        let addr = self.check(address, bytes.len())?;
        self.ram[addr..addr + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Move a block of memory within the workspace, regions may overlap
    pub(crate) fn copy_within(&mut self, from: usize, len: usize, to: usize) -> Result<()> {
        self.check(from, len)?;
        self.check(to, len)?;
        self.ram.copy_within(from..from + len, to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> Workspace {
        Workspace::new(64 * 1024).unwrap()
    }

    #[test]
    fn test_layout_invariants() {
        let mem = workspace();
        assert_eq!(mem.page(), PAGE);
        assert!(mem.page() <= mem.top());
        assert!(mem.top() <= mem.lomem());
        assert!(mem.lomem() <= mem.vartop());
        assert!(mem.vartop() <= mem.stacktop());
        assert!(mem.stacktop() <= mem.himem());
        assert_eq!(mem.himem(), mem.end());
    }

    #[test]
    fn test_peek_poke() {
        let mut mem = workspace();
        mem.poke(0x100, 0x42).unwrap();
        assert_eq!(mem.peek(0x100).unwrap(), 0x42);
        let end = mem.end();
        assert_eq!(mem.peek(end).unwrap_err().kind, ErrorKind::Address);
        assert!(mem.poke(end, 1).is_err());
    }

    #[test]
    fn test_word_operations() {
        let mut mem = workspace();
        mem.poke_word(0x2000, 0x1234).unwrap();
        assert_eq!(mem.peek_word(0x2000).unwrap(), 0x1234);
        assert_eq!(mem.peek(0x2000).unwrap(), 0x34);
        assert_eq!(mem.peek(0x2001).unwrap(), 0x12);
        mem.poke_int(0x3000, -2).unwrap();
        assert_eq!(mem.peek_int(0x3000).unwrap(), -2);
        mem.poke_float(0x3008, 1.5).unwrap();
        assert_eq!(mem.peek_float(0x3008).unwrap(), 1.5);
    }

    #[test]
    fn test_strings() {
        let mut mem = workspace();
        mem.poke_string(0x400, b"HELLO").unwrap();
        assert_eq!(mem.peek(0x405).unwrap(), b'\r');
        assert_eq!(mem.peek_string(0x400, 256).unwrap(), b"HELLO".to_vec());
    }

    #[test]
    fn test_heap_and_stack_collision() {
        let mut mem = workspace();
        let start = mem.vartop();
        let block = mem.allocate(10).unwrap();
        assert_eq!(block, start);
        assert_eq!(mem.vartop(), start + 12);
        let free = mem.free_space();
        assert!(mem.allocate(free + 1).is_err());
        assert_eq!(
            mem.set_stack_usage(free + 100).unwrap_err().kind,
            ErrorKind::StackFull
        );
        mem.set_stack_usage(16).unwrap();
        assert_eq!(mem.stacktop(), mem.himem() - 16);
    }

    #[test]
    fn test_himem_only_with_empty_stack() {
        let mut mem = workspace();
        let himem = mem.himem() - 0x1000;
        mem.set_himem(himem).unwrap();
        assert_eq!(mem.himem(), himem);
        mem.set_stack_usage(8).unwrap();
        assert!(mem.set_himem(himem - 0x100).is_err());
    }
}
