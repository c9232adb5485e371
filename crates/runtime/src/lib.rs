//! Yan runtime: the bytecode virtual machine
//!
//! Key pieces:
//! - [`Vm`]: one owned context value holding stack, frames, globals, open
//!   upvalues, and the heap; `interpret` drives compile → closure → run
//! - Method dispatch unifying instance methods, bound methods, natives,
//!   and the built-in string/list method tables
//! - The core module (系统, 数学) installed on every fresh VM
//! - A chunk disassembler for diagnostics

pub mod debug;
mod list_methods;
mod natives;
mod string_methods;
pub mod vm;

pub use vm::{FRAMES_MAX, InterpretResult, RuntimeError, STACK_MAX, Vm, VmOptions};
