//! Parser Types
//!
//! Shared types produced by the parser: source positions, raw (unresolved)
//! arguments, and parsed commands. Substitution ($ ~ # {}) happens later,
//! in `exec::substitution` -- the parser only separates source text into
//! quoting categories.

use std::fmt;
use indexmap::IndexMap;

/// 1-based source position. Survives concatenation/line offsetting used
/// when executing nested macro bodies (spec.md §4.1 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const fn start() -> Self {
        Self { line: 1, column: 1 }
    }

    /// Offset this position by a macro body's definition line/column, the
    /// way the executor re-bases parse errors raised while executing a
    /// macro's stored commands back onto the macro's definition site.
    pub fn offset(&self, line_offset: usize, column_offset: usize) -> Self {
        if self.line == 1 {
            Position { line: self.line + line_offset, column: self.column + column_offset }
        } else {
            Position { line: self.line + line_offset, column: self.column }
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// An argument's quoting category, preserved verbatim so the substitution
/// engine can apply the right expansion/escaping rules (spec.md §4.1-4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawArg {
    /// Unquoted text; `$`/`~`/`#`/`{}` substitutions apply.
    Bare(String),
    /// `"…"`; substitutions apply, but the result is known to have been
    /// quoted (preserves identity vs. a bare symbol per spec.md §3.1).
    Double(String),
    /// `'…'`; no substitution at all.
    Single(String),
    /// `(…)`; unparsed, possibly-nested parenthesized source text.
    Paren(String),
}

impl RawArg {
    pub fn source_text(&self) -> &str {
        match self {
            RawArg::Bare(s) | RawArg::Double(s) | RawArg::Single(s) | RawArg::Paren(s) => s,
        }
    }
}

/// Separator preceding a `ParsedCommand` in its sequence (the separator
/// that terminated the *previous* command, `None` for the first command).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    Sequence, // ';'
    Then,     // '&'
    Else,     // '|'
    None,
}

impl Separator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Separator::Sequence => ";",
            Separator::Then => "&",
            Separator::Else => "|",
            Separator::None => "",
        }
    }
}

/// One parsed command: name, positional/named arguments, the separator
/// that led into it, and its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub command: String,
    pub args: Vec<RawArg>,
    pub named_args: IndexMap<String, RawArg>,
    pub separator: Separator,
    pub position: Position,
}

pub const MAX_INPUT_SIZE: usize = 1_000_000;
pub const MAX_PARSER_DEPTH: usize = 200;
