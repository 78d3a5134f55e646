//! Kernel-wide tunables, collected in one place the way a `config.h`
//! would.

/// Number of harts (hardware threads) the machine exposes. This kernel
/// targets a dual-hart configuration; each hart owns its own process
/// pool and scheduler queues (no migration).
pub const NCPU: usize = 2;

/// Size of each hart's process pool.
pub const NPROC: usize = 32;

/// Page-granular heap cap for the byte-granular allocator (`better_malloc`).
pub const MAX_HEAP_PAGES: usize = 32;

/// Live-allocation cap for the byte-granular allocator's malloc directory.
pub const MAX_MALLOC_IN_HEAP: usize = 100;

/// Global counting-semaphore table capacity.
pub const MAX_SEMAPHORE_NUM: usize = 10;

/// Length of a round-robin time slice, in timer ticks.
pub const TIME_SLICE_LEN: u32 = 2;

/// Upper bound on the physical memory this kernel will manage, regardless
/// of how much the emulated machine reports. Mirrors PKE's
/// `PKE_MAX_ALLOWABLE_RAM`.
pub const PKE_MAX_ALLOWABLE_RAM: usize = 128 * 1024 * 1024;

/// Maximum argv entries accepted by `exec`.
pub const MAXARG: usize = 32;

/// Maximum path length accepted by the VFS collaborator.
pub const MAXPATH: usize = 128;
