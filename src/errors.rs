//! Error Handling
//!
//! Error categories and the control-flow signal types used to unwind the
//! executor: break/continue/early-return carry accumulated bubbles the way
//! the teacher's `BreakError`/`ContinueError`/`ExitError` carry accumulated
//! stdout/stderr.

use std::fmt;
use thiserror::Error;

use crate::parser::types::Position;

/// Error categories emitted by the logger (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Command,
    Argument,
    Type,
    IO,
    Variable,
    Macro,
    Flow,
    Async,
    Memory,
    System,
    User,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Parse-time failure: message, 1-based source position, and a context
/// snippet of the surrounding lines.
#[derive(Debug, Clone, Error)]
#[error("parse error at {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: Position,
    pub context: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>, position: Position, context: impl Into<String>) -> Self {
        Self { message: message.into(), position, context: context.into() }
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Command
    }
}

/// Top-level runtime error returned by fallible engine operations that are
/// not themselves one of the control-flow signals (those unwind via
/// `ControlSignal`, see below).
#[derive(Debug, Clone, Error)]
pub enum PawError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unknown token: {0}")]
    UnknownToken(u64),

    #[error("type error: {0}")]
    Type(String),

    #[error("{0}")]
    Other(String),
}

impl PawError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PawError::Parse(_) => ErrorCategory::Command,
            PawError::UndefinedVariable(_) => ErrorCategory::Variable,
            PawError::UnknownCommand(_) => ErrorCategory::Command,
            PawError::UnknownToken(_) => ErrorCategory::Async,
            PawError::Type(_) => ErrorCategory::Type,
            PawError::Other(_) => ErrorCategory::System,
        }
    }
}

/// Shared behavior for the loop-control unwinding signals (`break n`,
/// `continue n`) and early return (`ret`). These are not `PawError`s in the
/// ordinary sense -- they are the defunctionalized control transfer the
/// executor uses to unwind through nested loops and macro bodies.
pub trait ControlSignal: fmt::Debug {
    fn levels(&self) -> u32;
    fn with_levels(&self, levels: u32) -> Self where Self: Sized;
}

/// `break n`
#[derive(Debug, Clone, Copy)]
pub struct BreakSignal {
    pub levels: u32,
}

impl ControlSignal for BreakSignal {
    fn levels(&self) -> u32 { self.levels }
    fn with_levels(&self, levels: u32) -> Self { Self { levels } }
}

/// `continue n`
#[derive(Debug, Clone, Copy)]
pub struct ContinueSignal {
    pub levels: u32,
}

impl ControlSignal for ContinueSignal {
    fn levels(&self) -> u32 { self.levels }
    fn with_levels(&self, levels: u32) -> Self { Self { levels } }
}
