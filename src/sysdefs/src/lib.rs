//! Shared platform definitions for the slab memory runtime.
//!
//! This crate carries the constants and error kinds used by the memory
//! manager and by anything embedding it. Keeping them in a separate crate
//! lets host-side components validate arguments with the exact same
//! definitions the manager enforces.

pub mod constants;
