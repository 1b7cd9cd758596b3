//! PawScript core runtime.
//!
//! An embeddable command-oriented scripting runtime: a parser, an
//! executor, a reference-counted object store, an asynchronous token
//! system, a cooperative fiber scheduler, a generator/continuation system
//! built on the same token machinery, and a lexically scoped, copy-on-write
//! module environment. See `SPEC_FULL.md` for the full design.

pub mod builtins;
pub mod config;
pub mod errors;
pub mod exec;
pub mod fiber;
pub mod generator;
pub mod host;
pub mod list;
pub mod logger;
pub mod macros;
pub mod module_env;
pub mod parser;
pub mod store;
pub mod token;
pub mod value;
