//! Memory-management constants shared by the manager and its embedders.

// ===== Page Geometry =====
pub const PAGESHIFT: usize = 12; // 4KB pages (1 << 12 = 4096)
pub const PAGESIZE: usize = 1 << PAGESHIFT;

// ===== Memory Protection Flags =====
// Source: include/uapi/asm-generic/mman-common.h
pub const PROT_NONE: i32 = 0x0; // Page cannot be accessed
pub const PROT_READ: i32 = 0x1; // Page can be read
pub const PROT_WRITE: i32 = 0x2; // Page can be written
pub const PROT_EXEC: i32 = 0x4; // Page can be executed

// ===== Memory Mapping Flags =====
pub const MAP_SHARED: i32 = 0x01; // Share changes with other contexts
pub const MAP_PRIVATE: i32 = 0x02; // Changes are private to this context
pub const MAP_FIXED: i32 = 0x10; // Interpret addr exactly
pub const MAP_ANONYMOUS: i32 = 0x20; // Not backed by any file

// ===== Remap Flags =====
pub const MREMAP_MAYMOVE: i32 = 0x01; // Region may relocate when growing

// ===== Manager Internals =====
/// Sentinel stored in every live manager instance. A mismatch means the
/// caller handed us something that was never initialized (or was stomped).
pub const VMMAP_MAGIC: u64 = 0xcc8e_1732_ebd8_0b0b;

/// Pattern written over released bytes when scrubbing is enabled. Non-zero
/// so recycled pages are distinguishable from freshly zeroed ones.
pub const SCRUB_BYTE: u8 = 0xDD;

/// Capacity of the per-manager diagnostic string.
pub const MEM_ERR_MAX: usize = 256;
