//! Custom resource definitions consumed by the floating IP plugin.

pub mod tapp;

pub use tapp::*;
