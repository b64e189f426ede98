//! Brandy BBC BASIC
//!
//! An interpreter for BBC BASIC V/VI in the style of RISC OS: a tokenised
//! program store, a VDU driver with graphics and MODE 7 teletext, the `*`
//! command line and a small `SYS` gateway. Video is rendered into an
//! in-memory display refreshed by a background thread.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod filesystem;
pub mod graphics;
pub mod keyboard;
pub mod memory;
pub mod os;
pub mod program;
pub mod sound;
pub mod stack;
pub mod teletext;
pub mod tokenizer;
pub mod variables;
pub mod vdu;
pub mod video;

pub use config::Config;
pub use error::{BasicError, ErrorKind, Result};
pub use executor::Interpreter;
pub use keyboard::{Keyboard, KeySource, ScriptedKeys};
pub use program::ProgramStore;
pub use tokenizer::{tokenize, Token};
pub use variables::Value;
