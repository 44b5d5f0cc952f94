//! Error kinds surfaced by the memory manager.
//!
//! The manager reports failures as one of four kinds. Callers that need the
//! human-readable detail read it back from the manager's diagnostic buffer
//! after the failed call.

/// Compile-time verbosity toggle. Builds made with `VMMAP_VERBOSE` set in
/// the environment emit a tracing event for every failure path.
pub const VERBOSE: bool = option_env!("VMMAP_VERBOSE").is_some();

/// Failure kinds for the memory-manager operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemErrno {
    /// A caller-supplied value violates a precondition: bad alignment, zero
    /// size, a disallowed flag, an address outside the managed range, or a
    /// range that does not sit inside a single live region.
    InvalidParameter,
    /// No gap is large enough and the frontiers cannot advance.
    OutOfMemory,
    /// A secondary allocation (a descriptor for a split) could not be
    /// satisfied.
    Failure,
    /// A post-condition sanity check failed. Callers should treat this as a
    /// bug in the manager, not in their own arguments.
    Unexpected,
}

/// Build an error result while optionally tracing it.
///
/// Mirrors the shape used across the runtime: name the operation that
/// failed plus a short human-readable message, get the errno back so call
/// sites can write `return Err(mem_error(..))`.
pub fn mem_error(errno: MemErrno, op: &str, message: &str) -> MemErrno {
    if VERBOSE {
        tracing::debug!(target: "vmmap", %op, %message, ?errno, "operation failed");
    }
    errno
}
