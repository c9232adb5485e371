//! Yan core: values, heap objects, and bytecode chunks
//!
//! Key design principles:
//! - Value: what the language talks about (nil, booleans, numbers, handles)
//! - Heap: owns every object; handles are plain indices, never pointers
//! - Interning: textually equal strings share one handle, so string keys
//!   compare by identity
//!
//! The collector is a precise mark-and-sweep rooted by whoever owns the
//! heap (the VM); the heap itself only knows how to trace object graphs.

pub mod chunk;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, MAX_CONSTANTS, OpCode};
pub use heap::Heap;
pub use object::{
    NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjList,
    ObjNative, ObjString, ObjUpvalue,
};
pub use table::Table;
pub use value::{ObjRef, Value};
