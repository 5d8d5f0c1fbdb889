//! Virtual memory: per-owner virtual pools and page-table installation.
//!
//! Page-table memory is reached through the self-map: the last directory
//! entry points at the directory itself, so the tables appear at fixed high
//! virtual addresses and `pde_ptr`/`pte_ptr` are pure address arithmetic.

use crate::bitmap::Bitmap;
use crate::intr::HeldInterrupts;
use crate::kalloc::{self, PoolFlag};
use crate::memlayout::{USER_STACK3_VADDR};
use crate::param::PGSIZE;
use crate::proc;
use crate::utils::Global;

bitflags::bitflags! {
    pub struct PteFlags: usize {
        const P = 1;
        const RW = 2;
        const US = 4;
    }
}

/// A virtual-address pool: a base address plus one bit per page.
/// Bit `i` set means page `vaddr_start + i * PGSIZE` is reserved.
pub struct VirtPool {
    pub vaddr_start: usize,
    pub bitmap: Bitmap,
}

impl VirtPool {
    pub const fn empty() -> Self {
        Self {
            vaddr_start: 0,
            bitmap: Bitmap::empty(),
        }
    }
}

/// The kernel's one global virtual pool; user tasks carry their own in the
/// PCB.
static KERNEL_VADDR: Global<VirtPool> = Global::new(VirtPool::empty());

pub fn kernel_vaddr() -> *mut VirtPool {
    KERNEL_VADDR.get()
}

const fn pde_idx(vaddr: usize) -> usize {
    (vaddr & 0xffc0_0000) >> 22
}

const fn pte_idx(vaddr: usize) -> usize {
    (vaddr & 0x003f_f000) >> 12
}

/// Self-mapped pointer to the PTE covering `vaddr`.
pub fn pte_ptr(vaddr: usize) -> *mut usize {
    (0xffc0_0000 + ((vaddr & 0xffc0_0000) >> 10) + pte_idx(vaddr) * 4) as *mut usize
}

/// Self-mapped pointer to the PDE covering `vaddr`.
pub fn pde_ptr(vaddr: usize) -> *mut usize {
    (0xffff_f000 + pde_idx(vaddr) * 4) as *mut usize
}

/// Physical address backing `vaddr` in the active address space.
///
/// # Safety
///
/// The mapping for `vaddr` must be present.
pub unsafe fn addr_v2p(vaddr: usize) -> usize {
    let pte = unsafe { *pte_ptr(vaddr) };
    debug_assert!(pte & PteFlags::P.bits() != 0);
    (pte & 0xffff_f000) + (vaddr & 0xfff)
}

/// Reserves `pg_cnt` contiguous virtual pages from the pool selected by
/// `pf` and returns the base address.
fn vaddr_get(pf: PoolFlag, pg_cnt: usize) -> Option<usize> {
    match pf {
        PoolFlag::Kernel => {
            // SAFETY: callers hold the kernel pool lock.
            let pool = unsafe { KERNEL_VADDR.as_mut() };
            let bit_idx = pool.bitmap.scan(pg_cnt)?;
            for i in 0..pg_cnt {
                pool.bitmap.set(bit_idx + i, true);
            }
            Some(pool.vaddr_start + bit_idx * PGSIZE)
        }
        PoolFlag::User => {
            let cur = proc::current_task();
            // SAFETY: a task's own pool is task-private.
            let pool = unsafe { &mut (*cur).user_vaddr };
            let bit_idx = pool.bitmap.scan(pg_cnt)?;
            for i in 0..pg_cnt {
                pool.bitmap.set(bit_idx + i, true);
            }
            let vaddr_start = pool.vaddr_start + bit_idx * PGSIZE;
            // The topmost user page is the ring-3 stack, installed at
            // process start; the pool must never hand it out again.
            assert!(vaddr_start < USER_STACK3_VADDR);
            Some(vaddr_start)
        }
    }
}

/// Releases `pg_cnt` virtual pages starting at `vaddr` back to the pool.
fn vaddr_remove(pf: PoolFlag, vaddr: usize, pg_cnt: usize) {
    match pf {
        PoolFlag::Kernel => {
            // SAFETY: callers hold the kernel pool lock.
            let pool = unsafe { KERNEL_VADDR.as_mut() };
            let bit_idx = (vaddr - pool.vaddr_start) / PGSIZE;
            for i in 0..pg_cnt {
                pool.bitmap.set(bit_idx + i, false);
            }
        }
        PoolFlag::User => {
            let cur = proc::current_task();
            // SAFETY: task-private.
            let pool = unsafe { &mut (*cur).user_vaddr };
            let bit_idx = (vaddr - pool.vaddr_start) / PGSIZE;
            for i in 0..pg_cnt {
                pool.bitmap.set(bit_idx + i, false);
            }
        }
    }
}

/// Installs the mapping `vaddr -> page_phyaddr` in the active directory,
/// allocating the covering page table from the kernel pool if absent.
///
/// # Safety
///
/// `page_phyaddr` must be an owned, unshared frame and `vaddr` unmapped.
unsafe fn page_table_add(vaddr: usize, page_phyaddr: usize) {
    let pde = pde_ptr(vaddr);
    let pte = pte_ptr(vaddr);
    let flags = (PteFlags::P | PteFlags::RW | PteFlags::US).bits();

    unsafe {
        if *pde & PteFlags::P.bits() != 0 {
            assert!(*pte & PteFlags::P.bits() == 0, "pte repeat");
            *pte = page_phyaddr | flags;
        } else {
            // Page-table pages always come from the kernel pool.
            // SAFETY: callers hold the lock of the pool they allocate
            // from; the kernel pool bitmap additionally tolerates this
            // cross-pool grab because table pages are never freed while
            // the directory lives.
            let pool = kalloc::pool(PoolFlag::Kernel).data_ptr();
            let pde_phyaddr = (*pool).palloc().expect("page table frame");
            *pde = pde_phyaddr | flags;
            // The new table is reachable through the self-map at the
            // page-aligned base of `pte`; zero it before use.
            core::ptr::write_bytes((pte as usize & 0xffff_f000) as *mut u8, 0, PGSIZE);
            assert!(*pte & PteFlags::P.bits() == 0);
            *pte = page_phyaddr | flags;
        }
    }
}

/// Drops the PTE for `vaddr` and invalidates its TLB entry. The frame is
/// the caller's to free.
unsafe fn page_table_pte_remove(vaddr: usize) {
    unsafe {
        let pte = pte_ptr(vaddr);
        *pte &= !PteFlags::P.bits();
        crate::arch::invlpg(vaddr);
    }
}

/// Allocates `pg_cnt` virtual pages with freshly mapped frames and returns
/// the base virtual address. Frames need not be physically contiguous.
///
/// On mid-way exhaustion every page mapped so far is unwound and the
/// virtual reservation released.
///
/// # Safety
///
/// The caller must hold the lock of the pool selected by `pf`.
pub unsafe fn malloc_page(pf: PoolFlag, pg_cnt: usize) -> Option<usize> {
    assert!(pg_cnt > 0 && pg_cnt < 3840);
    let vaddr_start = vaddr_get(pf, pg_cnt)?;

    let pool = kalloc::pool(pf).data_ptr();
    let mut vaddr = vaddr_start;
    for done in 0..pg_cnt {
        // SAFETY: pool lock held per this function's contract.
        let page_phyaddr = match unsafe { (*pool).palloc() } {
            Some(pa) => pa,
            None => {
                // Unwind the pages already mapped.
                let mut va = vaddr_start;
                for _ in 0..done {
                    unsafe {
                        let pa = addr_v2p(va);
                        page_table_pte_remove(va);
                        (*pool).pfree(pa);
                    }
                    va += PGSIZE;
                }
                vaddr_remove(pf, vaddr_start, pg_cnt);
                return None;
            }
        };
        unsafe { page_table_add(vaddr, page_phyaddr) };
        vaddr += PGSIZE;
    }
    Some(vaddr_start)
}

/// Allocates `pg_cnt` zeroed pages from the kernel pool.
pub fn get_kernel_pages(pg_cnt: usize) -> Option<usize> {
    let _guard = kalloc::pool(PoolFlag::Kernel).lock();
    // SAFETY: kernel pool lock held.
    let vaddr = unsafe { malloc_page(PoolFlag::Kernel, pg_cnt) }?;
    // SAFETY: just mapped, exclusively ours.
    unsafe { core::ptr::write_bytes(vaddr as *mut u8, 0, pg_cnt * PGSIZE) };
    Some(vaddr)
}

/// Allocates `pg_cnt` zeroed pages from the user pool for the current task.
pub fn get_user_pages(pg_cnt: usize) -> Option<usize> {
    let _guard = kalloc::pool(PoolFlag::User).lock();
    // SAFETY: user pool lock held.
    let vaddr = unsafe { malloc_page(PoolFlag::User, pg_cnt) }?;
    // SAFETY: just mapped.
    unsafe { core::ptr::write_bytes(vaddr as *mut u8, 0, pg_cnt * PGSIZE) };
    Some(vaddr)
}

/// Binds the specific virtual page at `vaddr` to a fresh frame from `pf`,
/// marking the owner's virtual bitmap. One page only.
pub fn get_a_page(pf: PoolFlag, vaddr: usize) -> Option<usize> {
    let pool = kalloc::pool(pf);
    let _guard = pool.lock();

    let cur = proc::current_task();
    // SAFETY: single task manipulates its own pool; kernel pool is under
    // the lock just taken.
    unsafe {
        let is_user_task = !cur.is_null() && (*cur).pgdir != 0;
        match pf {
            PoolFlag::User if is_user_task => {
                let upool = &mut (*cur).user_vaddr;
                let bit_idx = (vaddr - upool.vaddr_start) / PGSIZE;
                upool.bitmap.set(bit_idx, true);
            }
            PoolFlag::Kernel if !is_user_task => {
                let kpool = KERNEL_VADDR.as_mut();
                let bit_idx = (vaddr - kpool.vaddr_start) / PGSIZE;
                assert!(bit_idx > 0);
                kpool.bitmap.set(bit_idx, true);
            }
            _ => panic!("get_a_page: pool flag does not match the calling task"),
        }

        let page_phyaddr = (*pool.data_ptr()).palloc()?;
        page_table_add(vaddr, page_phyaddr);
    }
    Some(vaddr)
}

/// `get_a_page` minus the virtual-bitmap store: fork installs pages whose
/// bitmap bits were already deep-copied from the parent.
pub fn get_a_page_without_vbitmap(pf: PoolFlag, vaddr: usize) -> Option<usize> {
    let pool = kalloc::pool(pf);
    let _guard = pool.lock();
    // SAFETY: pool lock held.
    unsafe {
        let page_phyaddr = (*pool.data_ptr()).palloc()?;
        page_table_add(vaddr, page_phyaddr);
    }
    Some(vaddr)
}

/// Releases `pg_cnt` mapped pages starting at virtual `vaddr`: frame bits,
/// PTEs and finally the virtual reservation.
pub fn mfree_page(pf: PoolFlag, vaddr: usize, pg_cnt: usize) {
    assert!(pg_cnt >= 1 && vaddr % PGSIZE == 0);
    let _held = HeldInterrupts::new();

    let mut va = vaddr;
    for _ in 0..pg_cnt {
        // SAFETY: the pages were mapped by malloc_page/get_a_page and are
        // exclusively the caller's; interrupts are off.
        unsafe {
            let pg_phy_addr = addr_v2p(va);
            assert!(pg_phy_addr % PGSIZE == 0 && pg_phy_addr >= 0x10_2000);
            let frame_pool = kalloc::pool(kalloc::pool_of_frame(pg_phy_addr)).data_ptr();
            (*frame_pool).pfree(pg_phy_addr);
            page_table_pte_remove(va);
        }
        va += PGSIZE;
    }
    vaddr_remove(pf, vaddr, pg_cnt);
}
