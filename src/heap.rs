//! Small-object heap on arenas.
//!
//! Seven size classes (16..=1024 bytes, doubling) per owner: one global set
//! for the kernel, one set in every user task's PCB. An arena is a single
//! frame whose header names its descriptor; the rest is split into equal
//! blocks threaded onto the descriptor's free list. Requests over 1024
//! bytes get a run of whole pages with a header-only arena in front.
//!
//! Rust-side kernel allocations (`Box`, `Vec`, ...) are served by the same
//! machinery pinned to the kernel descriptors, so anything the kernel
//! caches (inodes, bitmaps, I/O buffers) is global by construction no
//! matter which task is running.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use array_macro::array;

use crate::elem2entry;
use crate::intr::HeldInterrupts;
use crate::kalloc::{self, PoolFlag};
use crate::list::{List, ListEntry};
use crate::memlayout::KERNBASE;
use crate::param::{DESC_CNT, PGSIZE};
use crate::proc;
use crate::utils::{div_round_up, Global};
use crate::vm;

/// Arena header. `align(16)` keeps every block 16-byte aligned, which is
/// the strongest alignment the heap serves.
#[repr(C, align(16))]
struct Arena {
    /// Owning descriptor; null for large (whole-page) arenas.
    desc: *mut MemBlockDesc,
    /// For a large arena the page count, otherwise the number of free
    /// blocks remaining inside this arena.
    cnt: usize,
    large: bool,
}

const ARENA_HDR: usize = core::mem::size_of::<Arena>();

/// A free block is nothing but its list link.
#[repr(C)]
struct MemBlock {
    free_elem: ListEntry,
}

pub struct MemBlockDesc {
    pub block_size: usize,
    pub blocks_per_arena: usize,
    free_list: List,
}

impl MemBlockDesc {
    pub const fn empty() -> Self {
        Self {
            block_size: 0,
            blocks_per_arena: 0,
            free_list: List::new(),
        }
    }
}

/// (Re)initialises a descriptor set: 16, 32, ... 1024 bytes, empty lists.
/// Fork calls this on the child's copied set so it cannot dangle on the
/// parent's arenas.
pub fn block_desc_init(descs: &mut [MemBlockDesc; DESC_CNT]) {
    let mut block_size = 16;
    for desc in descs.iter_mut() {
        desc.block_size = block_size;
        desc.blocks_per_arena = (PGSIZE - ARENA_HDR) / block_size;
        desc.free_list.init();
        block_size *= 2;
    }
}

static K_BLOCK_DESCS: Global<[MemBlockDesc; DESC_CNT]> =
    Global::new(array![_ => MemBlockDesc::empty(); DESC_CNT]);

pub fn kernel_descs_init() {
    // SAFETY: boot is single threaded.
    block_desc_init(unsafe { K_BLOCK_DESCS.as_mut() });
}

fn arena2block(a: *mut Arena, idx: usize) -> *mut MemBlock {
    // SAFETY of the arithmetic: blocks start right after the header.
    (a as usize + ARENA_HDR + idx * unsafe { (*(*a).desc).block_size }) as *mut MemBlock
}

fn block2arena(b: *mut MemBlock) -> *mut Arena {
    crate::utils::pg_round_down(b as usize) as *mut Arena
}

/// Allocates `size` bytes from the selected owner's heap. Null on failure.
///
/// # Safety
///
/// `descs` must be the descriptor set paired with pool `pf` and outlive the
/// allocation.
unsafe fn malloc_from(pf: PoolFlag, descs: *mut [MemBlockDesc; DESC_CNT], size: usize) -> *mut u8 {
    let pool = kalloc::pool(pf);
    // SAFETY: read-only fields after init.
    let pool_size = unsafe { (*pool.data_ptr()).pool_size };
    if size == 0 || size >= pool_size {
        return ptr::null_mut();
    }

    let _guard = pool.lock();

    if size > 1024 {
        let page_cnt = div_round_up(size + ARENA_HDR, PGSIZE);
        // SAFETY: pool lock held.
        let Some(va) = (unsafe { vm::malloc_page(pf, page_cnt) }) else {
            return ptr::null_mut();
        };
        let a = va as *mut Arena;
        // SAFETY: freshly mapped pages.
        unsafe {
            ptr::write_bytes(va as *mut u8, 0, page_cnt * PGSIZE);
            (*a).desc = ptr::null_mut();
            (*a).large = true;
            (*a).cnt = page_cnt;
            (a as *mut u8).add(ARENA_HDR)
        }
    } else {
        // Smallest class that fits.
        let mut desc_idx = 0;
        // SAFETY: descriptor sets are DESC_CNT long and initialised.
        unsafe {
            while size > (*descs)[desc_idx].block_size {
                desc_idx += 1;
            }
            let desc = &mut (*descs)[desc_idx];

            if desc.free_list.is_empty() {
                // Grow by one arena and thread its blocks.
                let Some(va) = vm::malloc_page(pf, 1) else {
                    return ptr::null_mut();
                };
                let a = va as *mut Arena;
                ptr::write_bytes(va as *mut u8, 0, PGSIZE);
                (*a).desc = desc;
                (*a).large = false;
                (*a).cnt = desc.blocks_per_arena;

                let _held = HeldInterrupts::new();
                for block_idx in 0..desc.blocks_per_arena {
                    let b = arena2block(a, block_idx);
                    debug_assert!(!desc.free_list.contains(&mut (*b).free_elem));
                    desc.free_list.push_back(&mut (*b).free_elem);
                }
            }

            let elem = desc.free_list.pop_front().expect("arena just refilled");
            let b = elem2entry!(MemBlock, free_elem, elem);
            ptr::write_bytes(b as *mut u8, 0, desc.block_size);
            let a = block2arena(b);
            (*a).cnt -= 1;
            b as *mut u8
        }
    }
}

/// Returns `ptr` to the owner's heap; whole-page arenas go back to the page
/// allocator, blocks go back on their free list, and an arena whose blocks
/// are all free is dissolved.
///
/// # Safety
///
/// `ptr` must come from [`malloc_from`] with the matching `pf`.
unsafe fn free_to(pf: PoolFlag, ptr_: *mut u8) {
    assert!(!ptr_.is_null());
    let pool = kalloc::pool(pf);
    let _guard = pool.lock();

    let b = ptr_ as *mut MemBlock;
    let a = block2arena(b);
    // SAFETY: `ptr` came from this heap, so the arena header is live.
    unsafe {
        if (*a).desc.is_null() && (*a).large {
            vm::mfree_page(pf, a as usize, (*a).cnt);
        } else {
            let desc = (*a).desc;
            {
                let _held = HeldInterrupts::new();
                (*b).free_elem.init();
                (*desc).free_list.push_back(&mut (*b).free_elem);
                (*a).cnt += 1;
            }
            if (*a).cnt == (*desc).blocks_per_arena {
                let _held = HeldInterrupts::new();
                for block_idx in 0..(*desc).blocks_per_arena {
                    let blk = arena2block(a, block_idx);
                    debug_assert!((*desc).free_list.contains(&mut (*blk).free_elem));
                    (*blk).free_elem.remove();
                }
                vm::mfree_page(pf, a as usize, 1);
            }
        }
    }
}

/// Heap allocation for the running task: user tasks draw from their own
/// descriptors and the user pool, kernel threads from the kernel set.
pub fn sys_malloc(size: usize) -> *mut u8 {
    let cur = proc::current_task();
    // SAFETY: task-private descriptor set, or the kernel set under its
    // pool lock.
    unsafe {
        if cur.is_null() || (*cur).pgdir == 0 {
            malloc_from(PoolFlag::Kernel, K_BLOCK_DESCS.get(), size)
        } else {
            malloc_from(PoolFlag::User, &mut (*cur).u_block_descs, size)
        }
    }
}

/// Heap release for the running task.
pub fn sys_free(ptr_: *mut u8) {
    if ptr_.is_null() {
        return;
    }
    let pf = if ptr_ as usize >= KERNBASE {
        PoolFlag::Kernel
    } else {
        PoolFlag::User
    };
    // SAFETY: address range decides the owning pool; see `free_to`.
    unsafe { free_to(pf, ptr_) };
}

/// `alloc` plumbing: Rust-side kernel allocations always use the kernel
/// descriptors. Alignment above 16 is not served (nothing in the kernel
/// asks for it).
struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > 16 {
            return ptr::null_mut();
        }
        let size = layout.size().max(layout.align()).max(1);
        // SAFETY: kernel descriptor set with the kernel pool.
        unsafe { malloc_from(PoolFlag::Kernel, K_BLOCK_DESCS.get(), size) }
    }

    unsafe fn dealloc(&self, ptr_: *mut u8, _layout: Layout) {
        // SAFETY: allocated by `alloc` above, hence kernel heap.
        unsafe { free_to(PoolFlag::Kernel, ptr_) };
    }
}

// The hosted test harness links std and uses its allocator instead.
#[cfg(not(test))]
#[global_allocator]
static KERNEL_HEAP: KernelHeap = KernelHeap;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes_double_from_16() {
        let mut descs = array![_ => MemBlockDesc::empty(); DESC_CNT];
        block_desc_init(&mut descs);
        let sizes: alloc::vec::Vec<usize> = descs.iter().map(|d| d.block_size).collect();
        assert_eq!(sizes, [16, 32, 64, 128, 256, 512, 1024]);
        for d in &descs {
            assert_eq!(d.blocks_per_arena, (PGSIZE - ARENA_HDR) / d.block_size);
            assert!(d.blocks_per_arena >= 3);
        }
    }

    #[test]
    fn large_request_page_count_includes_header() {
        // A request of exactly one page must spill into a second page once
        // the header is accounted for.
        assert_eq!(div_round_up(PGSIZE + ARENA_HDR, PGSIZE), 2);
        assert_eq!(div_round_up(1025 + ARENA_HDR, PGSIZE), 1);
    }
}
