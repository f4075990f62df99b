// Native entry points receive raw pointers from JIT-generated code.
// They are FFI surface, not meant to be called from safe Rust.
#![allow(clippy::not_unsafe_ptr_arg_deref)]

pub mod heap;
pub mod natives;
pub mod value;
