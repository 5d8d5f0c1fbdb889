/// Bytes per page frame.
pub const PGSIZE: usize = 4096;

/// Bytes per disk sector. A file-system block equals one sector.
pub const SECTOR_SIZE: usize = 512;

/// Bits per sector, for bitmap sizing.
pub const BITS_PER_SECTOR: u32 = (SECTOR_SIZE * 8) as u32;

/// Open files per system (global file table slots).
pub const NFILE: usize = 32;

/// Open files per task, including the three stdio slots.
pub const NOFILE: usize = 8;

/// Maximum number of tasks alive at once (pid pool size).
pub const NPID: usize = 1024;

/// Maximum length of a task name, including room for the `_fork` suffix.
pub const TASK_NAME_LEN: usize = 16;

/// Maximum file name length. One byte is reserved for the terminating NUL
/// in the on-disk directory entry.
pub const MAX_FILE_NAME_LEN: usize = 15;

/// Maximum path length accepted by the path resolver.
pub const MAX_PATH_LEN: usize = 512;

/// Inodes per partition; also the inode bitmap's bit count.
pub const MAX_FILES_PER_PART: u32 = 4096;

/// Small-object size classes served by the arena heap: 16..=1024 bytes.
pub const DESC_CNT: usize = 7;

/// Ring buffer capacity. One page comfortably holds the queue and its
/// bookkeeping, which is what makes it usable as a pipe's backing store.
pub const IOQ_BUF_SIZE: usize = 2048;

/// Default scheduling priority, doubling as the initial time slice in ticks.
pub const DEFAULT_PRIO: u8 = 31;

/// Timer interrupt frequency.
pub const TICK_HZ: u32 = 100;

/// Total time the ATA driver is willing to poll a busy device before
/// declaring it wedged, and the sleep granularity of each poll. Tests dial
/// the budget down through `IdeChannel::set_wait_budget`.
pub const ATA_WAIT_BUDGET_MS: u32 = 30_000;
pub const ATA_POLL_MS: u32 = 10;

/// Max exec/shell arguments.
pub const MAX_ARG_NR: usize = 16;

/// Shell command line capacity.
pub const CMD_LEN: usize = 128;
