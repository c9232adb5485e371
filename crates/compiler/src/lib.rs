//! Yan compiler: scanner plus single-pass bytecode compiler
//!
//! [`compile`] turns UTF-8 source into a top-level function object whose
//! chunk the VM executes. Diagnostics are collected across the whole
//! input and returned as one formatted string; no partial bytecode
//! escapes a failed compile.

pub mod compiler;
pub mod scanner;

pub use compiler::compile;
pub use scanner::{Token, TokenKind, tokenize};
