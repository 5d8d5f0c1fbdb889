//! Inodes: on-disk layout, the in-memory cache, and block-walking reads
//! and writes.

use alloc::boxed::Box;
use zerocopy::{AsBytes, FromBytes};

use crate::ata::BlockIo;
use crate::elem2entry;
use crate::intr::HeldInterrupts;
use crate::list::ListEntry;
use crate::param::SECTOR_SIZE;
use crate::utils::{read_struct, write_struct};
use crate::println;

use super::{BitmapKind, FileSys};

/// Direct block slots per inode; slot 12 holds the single indirect table.
pub const NDIRECT: usize = 12;
/// LBA entries in one indirect-table sector.
pub const LBA_PER_SEC: usize = SECTOR_SIZE / 4;
/// Total data blocks a file can span.
pub const NBLOCKS: usize = NDIRECT + LBA_PER_SEC;
/// Largest file size.
pub const MAX_FILE_BYTES: usize = NBLOCKS * SECTOR_SIZE;

/// In-memory inode. Lives on the kernel heap, linked into the owning file
/// system's open list while its open count is non-zero.
pub struct Inode {
    pub ino: u32,
    pub size: u32,
    pub open_cnts: u32,
    /// Advisory single-writer flag; set while a write-capable open exists.
    pub write_deny: bool,
    /// Slots 0..12 direct, slot 12 the indirect table's LBA; 0 means
    /// unallocated.
    pub blocks: [u32; 13],
    pub tag: ListEntry,
}

/// On-disk image of an inode. The open count and the list-link pad carry no
/// meaning on disk and are written as zero.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct DiskInode {
    pub ino: u32,
    pub size: u32,
    pub open_cnts: u32,
    pub write_deny: u8,
    pad: [u8; 3],
    pub blocks: [u32; 13],
    tag_pad: [u32; 2],
}

static_assertions::const_assert_eq!(core::mem::size_of::<DiskInode>(), 76);

impl Inode {
    pub fn new(ino: u32) -> Self {
        Self {
            ino,
            size: 0,
            open_cnts: 0,
            write_deny: false,
            blocks: [0; 13],
            tag: ListEntry::new(),
        }
    }

    /// Strips the memory-only state for a disk write.
    pub fn to_disk(&self) -> DiskInode {
        DiskInode {
            ino: self.ino,
            size: self.size,
            open_cnts: 0,
            write_deny: 0,
            pad: [0; 3],
            blocks: self.blocks,
            tag_pad: [0; 2],
        }
    }

    pub fn from_disk(d: &DiskInode) -> Self {
        let mut inode = Self::new(d.ino);
        inode.size = d.size;
        inode.blocks = d.blocks;
        inode
    }
}

/// Where inode `ino` sits in the inode table: its first sector, the byte
/// offset inside it, and whether the structure straddles into the next
/// sector.
pub(super) struct InodePosition {
    pub two_sec: bool,
    pub sec_lba: u32,
    pub off: usize,
}

impl<D: BlockIo> FileSys<D> {
    pub(super) fn inode_locate(&self, ino: u32) -> InodePosition {
        assert!(ino < self.sb.inode_cnt);
        let inode_size = core::mem::size_of::<DiskInode>();
        let off_bytes = ino as usize * inode_size;
        let off_sec = off_bytes / SECTOR_SIZE;
        let off_in_sec = off_bytes % SECTOR_SIZE;
        InodePosition {
            two_sec: SECTOR_SIZE - off_in_sec < inode_size,
            sec_lba: self.sb.inode_table_lba + off_sec as u32,
            off: off_in_sec,
        }
    }

    /// Writes `inode` back to the inode table through `io_buf` (two sectors
    /// worth, for the straddling case).
    pub fn inode_sync(&mut self, inode: &Inode, io_buf: &mut [u8]) {
        let pos = self.inode_locate(inode.ino);
        assert!(pos.sec_lba <= self.start_lba + self.sec_cnt);
        let pure = inode.to_disk();

        let sects = if pos.two_sec { 2 } else { 1 };
        let buf = &mut io_buf[..sects * SECTOR_SIZE];
        self.disk.read(pos.sec_lba, buf);
        write_struct(&mut buf[pos.off..], &pure);
        self.disk.write(pos.sec_lba, buf);
    }

    /// Opens inode `ino`: bumps the cached copy if the open list has one,
    /// otherwise loads it from disk onto the kernel heap and lists it.
    pub fn inode_open(&mut self, ino: u32) -> *mut Inode {
        // SAFETY: list members are live boxed inodes.
        let cached = unsafe {
            self.open_inodes
                .traverse(|elem| (*elem2entry!(Inode, tag, elem)).ino == ino)
        };
        if let Some(elem) = cached {
            let inode = elem2entry!(Inode, tag, elem);
            // SAFETY: as above.
            unsafe { (*inode).open_cnts += 1 };
            return inode;
        }

        let pos = self.inode_locate(ino);
        let sects = if pos.two_sec { 2 } else { 1 };
        let mut buf = alloc::vec![0u8; sects * SECTOR_SIZE];
        self.disk.read(pos.sec_lba, &mut buf);
        let disk_inode: DiskInode = read_struct(&buf[pos.off..]);

        // Boxed, so shared by every task regardless of whose heap is
        // active: the kernel allocator always serves `Box`.
        let inode = Box::into_raw(Box::new(Inode::from_disk(&disk_inode)));
        // SAFETY: freshly leaked box; pushed to the front so the next open
        // finds it quickly.
        unsafe {
            (*inode).ino = ino;
            (*inode).open_cnts = 1;
            (*inode).tag.init();
            self.open_inodes.push_front(&mut (*inode).tag);
        }
        inode
    }

    /// Drops one reference; the last close unlists and frees the inode.
    pub fn inode_close(&mut self, inode: *mut Inode) {
        let _held = HeldInterrupts::new();
        // SAFETY: open inodes are live until their last close, which is
        // this path.
        unsafe {
            (*inode).open_cnts -= 1;
            if (*inode).open_cnts == 0 {
                (*inode).tag.remove();
                drop(Box::from_raw(inode));
            }
        }
    }

    /// Zeroes inode `ino` in the on-disk table. Allocation is governed by
    /// the inode bitmap alone, so this is a debugging aid kept from the
    /// original teardown path.
    pub(super) fn inode_delete(&mut self, ino: u32, io_buf: &mut [u8]) {
        let pos = self.inode_locate(ino);
        assert!(pos.sec_lba <= self.start_lba + self.sec_cnt);

        let sects = if pos.two_sec { 2 } else { 1 };
        let buf = &mut io_buf[..sects * SECTOR_SIZE];
        self.disk.read(pos.sec_lba, buf);
        buf[pos.off..pos.off + core::mem::size_of::<DiskInode>()].fill(0);
        self.disk.write(pos.sec_lba, buf);
    }

    /// Frees every data block of inode `ino` (and the indirect table),
    /// clears its bitmap bit, and syncs. The file's directory entry must
    /// already be gone.
    pub fn inode_release(&mut self, ino: u32) {
        let inode = self.inode_open(ino);
        // SAFETY: just opened.
        unsafe { assert_eq!((*inode).ino, ino) };

        // SAFETY: the inode stays listed until the close below.
        let all_blocks = unsafe { self.collect_blocks(&*inode) };
        // SAFETY: reading fields of the open inode.
        let indirect_lba = unsafe { (*inode).blocks[NDIRECT] };
        if indirect_lba != 0 {
            let bit = indirect_lba - self.sb.data_start_lba;
            assert!(bit > 0);
            self.block_bitmap.set(bit as usize, false);
            self.bitmap_sync(bit, BitmapKind::Block);
        }
        for lba in all_blocks.iter().copied().filter(|&lba| lba != 0) {
            let bit = lba - self.sb.data_start_lba;
            assert!(bit > 0);
            self.block_bitmap.set(bit as usize, false);
            self.bitmap_sync(bit, BitmapKind::Block);
        }

        self.inode_bitmap.set(ino as usize, false);
        self.bitmap_sync(ino, BitmapKind::Inode);

        let mut io_buf = alloc::vec![0u8; 2 * SECTOR_SIZE];
        self.inode_delete(ino, &mut io_buf);
        self.inode_close(inode);
    }

    /// Gathers the inode's full block map: 12 direct slots plus the
    /// indirect table's 128 entries when it exists. Zero entries mean
    /// unallocated.
    pub(super) fn collect_blocks(&self, inode: &Inode) -> [u32; NBLOCKS] {
        let mut all_blocks = [0u32; NBLOCKS];
        all_blocks[..NDIRECT].copy_from_slice(&inode.blocks[..NDIRECT]);
        if inode.blocks[NDIRECT] != 0 {
            let mut buf = [0u8; SECTOR_SIZE];
            self.disk.read(inode.blocks[NDIRECT], &mut buf);
            for (slot, chunk) in all_blocks[NDIRECT..].iter_mut().zip(buf.chunks_exact(4)) {
                *slot = u32::from_le_bytes(chunk.try_into().unwrap());
            }
        }
        all_blocks
    }

    /// Writes the indirect table (entries 12..) back to its sector.
    pub(super) fn sync_indirect_table(&mut self, table_lba: u32, all_blocks: &[u32; NBLOCKS]) {
        let mut buf = [0u8; SECTOR_SIZE];
        for (chunk, lba) in buf.chunks_exact_mut(4).zip(&all_blocks[NDIRECT..]) {
            chunk.copy_from_slice(&lba.to_le_bytes());
        }
        self.disk.write(table_lba, &buf);
    }

    /// Makes sure data block `block_idx` of `inode` exists, allocating it
    /// (and the indirect table, when crossing slot 12) on demand. The
    /// indirect table is rolled back if its first entry cannot be
    /// allocated.
    pub(super) fn ensure_block(
        &mut self,
        inode: &mut Inode,
        all_blocks: &mut [u32; NBLOCKS],
        block_idx: usize,
    ) -> Result<(), ()> {
        if all_blocks[block_idx] != 0 {
            return Ok(());
        }

        if block_idx < NDIRECT {
            let lba = self.block_bitmap_alloc().ok_or(())?;
            inode.blocks[block_idx] = lba;
            all_blocks[block_idx] = lba;
            self.bitmap_sync(lba - self.sb.data_start_lba, BitmapKind::Block);
            return Ok(());
        }

        if inode.blocks[NDIRECT] == 0 {
            // The table itself first, then the data block; a failed second
            // allocation reverts the table.
            let table_lba = self.block_bitmap_alloc().ok_or(())?;
            self.bitmap_sync(table_lba - self.sb.data_start_lba, BitmapKind::Block);
            inode.blocks[NDIRECT] = table_lba;

            let Some(lba) = self.block_bitmap_alloc() else {
                let bit = table_lba - self.sb.data_start_lba;
                self.block_bitmap.set(bit as usize, false);
                self.bitmap_sync(bit, BitmapKind::Block);
                inode.blocks[NDIRECT] = 0;
                println!("ensure_block: block bitmap exhausted");
                return Err(());
            };
            self.bitmap_sync(lba - self.sb.data_start_lba, BitmapKind::Block);
            all_blocks[block_idx] = lba;
        } else {
            let lba = self.block_bitmap_alloc().ok_or(())?;
            self.bitmap_sync(lba - self.sb.data_start_lba, BitmapKind::Block);
            all_blocks[block_idx] = lba;
        }
        self.sync_indirect_table(inode.blocks[NDIRECT], all_blocks);
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at `off`, stopping at end of file.
    /// Returns the byte count, or `Err` when `off` is at or past the end.
    pub fn read_at(&mut self, inode: *mut Inode, off: u32, buf: &mut [u8]) -> Result<usize, ()> {
        // SAFETY: caller holds an open reference.
        let (size, all_blocks) = unsafe { ((*inode).size, self.collect_blocks(&*inode)) };
        if off >= size {
            return Err(());
        }
        let count = buf.len().min((size - off) as usize);

        let mut io_buf = [0u8; SECTOR_SIZE];
        let mut bytes_read = 0;
        while bytes_read < count {
            let pos = off as usize + bytes_read;
            let sec_idx = pos / SECTOR_SIZE;
            let sec_off = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sec_off).min(count - bytes_read);

            let lba = all_blocks[sec_idx];
            assert!(lba != 0, "file block hole");
            self.disk.read(lba, &mut io_buf);
            buf[bytes_read..bytes_read + chunk].copy_from_slice(&io_buf[sec_off..sec_off + chunk]);
            bytes_read += chunk;
        }
        Ok(bytes_read)
    }

    /// Writes `buf` at `off`, allocating data blocks (and the indirect
    /// table) on demand, growing the file size as needed, and syncing the
    /// inode. Returns the bytes written.
    pub fn write_at(&mut self, inode: *mut Inode, off: u32, buf: &[u8]) -> Result<usize, ()> {
        if off as usize + buf.len() > MAX_FILE_BYTES {
            println!("write_at: exceeds the max file size of {} bytes", MAX_FILE_BYTES);
            return Err(());
        }
        // SAFETY: caller holds an open reference; no other task touches
        // this inode mid-call (file-system calls serialise).
        let inode_ref = unsafe { &mut *inode };
        let mut all_blocks = self.collect_blocks(inode_ref);

        let end = off as usize + buf.len();
        let first_block = off as usize / SECTOR_SIZE;
        let last_block = (end - 1) / SECTOR_SIZE;
        for block_idx in first_block..=last_block {
            self.ensure_block(inode_ref, &mut all_blocks, block_idx)?;
        }

        let mut io_buf = [0u8; SECTOR_SIZE];
        let mut bytes_written = 0;
        while bytes_written < buf.len() {
            let pos = off as usize + bytes_written;
            let sec_idx = pos / SECTOR_SIZE;
            let sec_off = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sec_off).min(buf.len() - bytes_written);
            let lba = all_blocks[sec_idx];

            if chunk < SECTOR_SIZE {
                // Partial sector: splice into the existing contents.
                self.disk.read(lba, &mut io_buf);
            }
            io_buf[sec_off..sec_off + chunk]
                .copy_from_slice(&buf[bytes_written..bytes_written + chunk]);
            self.disk.write(lba, &io_buf);
            bytes_written += chunk;
        }

        if end as u32 > inode_ref.size {
            inode_ref.size = end as u32;
        }
        let mut sync_buf = alloc::vec![0u8; 2 * SECTOR_SIZE];
        self.inode_sync(inode_ref, &mut sync_buf);
        Ok(bytes_written)
    }
}
