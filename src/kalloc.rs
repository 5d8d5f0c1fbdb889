//! Physical frame pools.
//!
//! Usable memory above the loader's 1 MiB + page-table reservation is split
//! evenly into a kernel pool and a user pool, each governed by a one-bit-
//! per-frame bitmap under its own blocking lock. The bitmaps themselves are
//! carved out of the reserved low-memory window because they must exist
//! before any allocator does.

use crate::bitmap::Bitmap;
use crate::memlayout::{K_HEAP_START, MEM_BITMAP_BASE};
use crate::param::PGSIZE;
use crate::sync::Mutex;
use crate::vm::VirtPool;
use crate::println;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PoolFlag {
    Kernel,
    User,
}

pub struct PhysPool {
    pub bitmap: Bitmap,
    pub phy_addr_start: usize,
    pub pool_size: usize,
}

impl PhysPool {
    const fn empty() -> Self {
        Self {
            bitmap: Bitmap::empty(),
            phy_addr_start: 0,
            pool_size: 0,
        }
    }

    /// Allocates one frame, returning its physical address.
    pub fn palloc(&mut self) -> Option<usize> {
        let bit_idx = self.bitmap.scan(1)?;
        self.bitmap.set(bit_idx, true);
        Some(self.phy_addr_start + bit_idx * PGSIZE)
    }

    /// Returns frame `pa` to the pool.
    pub fn pfree(&mut self, pa: usize) {
        debug_assert!(pa >= self.phy_addr_start);
        let bit_idx = (pa - self.phy_addr_start) / PGSIZE;
        self.bitmap.set(bit_idx, false);
    }

    pub fn contains(&self, pa: usize) -> bool {
        (self.phy_addr_start..self.phy_addr_start + self.pool_size).contains(&pa)
    }
}

static KERNEL_POOL: Mutex<PhysPool> = Mutex::new(PhysPool::empty());
static USER_POOL: Mutex<PhysPool> = Mutex::new(PhysPool::empty());

pub fn pool(pf: PoolFlag) -> &'static Mutex<PhysPool> {
    match pf {
        PoolFlag::Kernel => &KERNEL_POOL,
        PoolFlag::User => &USER_POOL,
    }
}

/// Decides which pool a frame belongs to. The split point is fixed at init.
pub fn pool_of_frame(pa: usize) -> PoolFlag {
    // SAFETY: the start address is written once at boot and read-only after.
    let user_start = unsafe { (*USER_POOL.data_ptr()).phy_addr_start };
    if pa >= user_start {
        PoolFlag::User
    } else {
        PoolFlag::Kernel
    }
}

/// Clears the frame's pool bit without touching any page table. The exit
/// path uses this while tearing down an address space it is still running
/// on.
pub fn free_a_phy_page(pa: usize) {
    let pool = pool(pool_of_frame(pa));
    // SAFETY: callers run with the owning task effectively exclusive (exit
    // path or under the pool lock).
    unsafe { (*pool.data_ptr()).pfree(pa) };
}

/// Carves both physical pools and the kernel virtual pool out of the memory
/// the loader reported.
pub fn mem_pool_init(all_mem: usize, kernel_vaddr: &mut VirtPool) {
    println!("   mem_pool_init start");
    let page_table_size = PGSIZE * 256;
    let used_mem = page_table_size + 0x10_0000;

    let free_mem = all_mem - used_mem;
    let all_free_pages = free_mem / PGSIZE;
    let kernel_free_pages = all_free_pages / 2;
    let user_free_pages = all_free_pages - kernel_free_pages;

    // Remainder bits are dropped: the maps describe slightly less memory
    // than exists, which spares every later bounds check.
    let kbm_len = kernel_free_pages / 8;
    let ubm_len = user_free_pages / 8;

    let kp_start = used_mem;
    let up_start = kp_start + kernel_free_pages * PGSIZE;

    {
        let mut kp = KERNEL_POOL.lock();
        kp.phy_addr_start = kp_start;
        kp.pool_size = kernel_free_pages * PGSIZE;
        // SAFETY: the low-memory window is reserved for exactly these maps.
        kp.bitmap = unsafe { Bitmap::from_raw(MEM_BITMAP_BASE as *mut u8, kbm_len) };
        kp.bitmap.init();
    }
    {
        let mut up = USER_POOL.lock();
        up.phy_addr_start = up_start;
        up.pool_size = user_free_pages * PGSIZE;
        // SAFETY: directly after the kernel pool's map.
        up.bitmap = unsafe { Bitmap::from_raw((MEM_BITMAP_BASE + kbm_len) as *mut u8, ubm_len) };
        up.bitmap.init();
    }

    println!(
        "      kernel pool: phys {:#x}, {} pages; user pool: phys {:#x}, {} pages",
        kp_start, kernel_free_pages, up_start, user_free_pages
    );

    // The kernel's virtual pool mirrors the kernel physical pool in size.
    kernel_vaddr.vaddr_start = K_HEAP_START;
    kernel_vaddr.bitmap =
        // SAFETY: third map in the reserved window.
        unsafe { Bitmap::from_raw((MEM_BITMAP_BASE + kbm_len + ubm_len) as *mut u8, kbm_len) };
    kernel_vaddr.bitmap.init();

    println!("   mem_pool_init done");
}
