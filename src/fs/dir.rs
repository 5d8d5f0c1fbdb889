//! Directories: fixed-size entries packed into data blocks, never
//! straddling a sector boundary.

use alloc::boxed::Box;
use zerocopy::{AsBytes, FromBytes};

use crate::ata::BlockIo;
use crate::param::{MAX_FILE_NAME_LEN, SECTOR_SIZE};
use crate::utils::{read_struct, write_struct};
use crate::println;

use super::inode::{Inode, NBLOCKS, NDIRECT};
use super::{BitmapKind, FileSys, FileType};

/// On-disk directory entry: NUL-terminated name, inode number, type, padded
/// so a whole number of entries fits a sector.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct DirEntry {
    pub filename: [u8; MAX_FILE_NAME_LEN + 1],
    pub ino: u32,
    pub ftype: u8,
    pad: [u8; 3],
}

pub const DIR_ENTRY_SIZE: usize = core::mem::size_of::<DirEntry>();
/// Entries per sector; the slack bytes at the sector tail stay unused.
pub const DIR_ENTRIES_PER_SEC: usize = SECTOR_SIZE / DIR_ENTRY_SIZE;

static_assertions::const_assert_eq!(DIR_ENTRY_SIZE, 24);
static_assertions::const_assert!(DIR_ENTRIES_PER_SEC * DIR_ENTRY_SIZE <= SECTOR_SIZE);

impl DirEntry {
    pub fn zero() -> Self {
        Self {
            filename: [0; MAX_FILE_NAME_LEN + 1],
            ino: 0,
            ftype: FileType::Unknown as u8,
            pad: [0; 3],
        }
    }

    /// Builds an entry in place; `name` is truncated to the on-disk limit.
    pub fn new(name: &str, ino: u32, ftype: FileType) -> Self {
        assert!(name.len() <= MAX_FILE_NAME_LEN);
        let mut de = Self::zero();
        de.filename[..name.len()].copy_from_slice(name.as_bytes());
        de.ino = ino;
        de.ftype = ftype as u8;
        de
    }

    pub fn name(&self) -> &str {
        let len = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.filename.len());
        core::str::from_utf8(&self.filename[..len]).unwrap_or("")
    }

    pub fn file_type(&self) -> FileType {
        match self.ftype {
            1 => FileType::Regular,
            2 => FileType::Directory,
            _ => FileType::Unknown,
        }
    }

    pub fn is_unused(&self) -> bool {
        self.ftype == FileType::Unknown as u8
    }
}

/// An open directory: its inode plus a read cursor for `readdir`.
pub struct Dir {
    pub inode: *mut Inode,
    pub pos: u32,
}

impl<D: BlockIo> FileSys<D> {
    /// Opens the directory behind inode `ino`.
    pub fn dir_open(&mut self, ino: u32) -> *mut Dir {
        Box::into_raw(Box::new(Dir {
            inode: self.inode_open(ino),
            pos: 0,
        }))
    }

    pub fn root_dir(&self) -> *mut Dir {
        self.root_dir
    }

    /// Closes `dir`. The root directory stays open for the life of the
    /// mount and is never freed here.
    pub fn dir_close(&mut self, dir: *mut Dir) {
        if dir == self.root_dir {
            return;
        }
        // SAFETY: `dir` came out of dir_open.
        unsafe {
            self.inode_close((*dir).inode);
            drop(Box::from_raw(dir));
        }
    }

    /// Looks `name` up in `dir`.
    pub fn search_dir_entry(&mut self, dir: *mut Dir, name: &str) -> Option<DirEntry> {
        // SAFETY: the Dir holds its inode open.
        let all_blocks = unsafe { self.collect_blocks(&*(*dir).inode) };

        let mut buf = [0u8; SECTOR_SIZE];
        for &lba in all_blocks.iter() {
            if lba == 0 {
                continue;
            }
            self.disk.read(lba, &mut buf);
            for idx in 0..DIR_ENTRIES_PER_SEC {
                let de: DirEntry = read_struct(&buf[idx * DIR_ENTRY_SIZE..]);
                if !de.is_unused() && de.name() == name {
                    return Some(de);
                }
            }
        }
        None
    }

    /// Inserts `de` into `parent`: the first unused slot in an existing
    /// block, or a freshly allocated block (allocating the indirect table
    /// on the way past slot 12, with rollback if its first data block
    /// cannot follow). Grows the directory size by one entry.
    pub fn sync_dir_entry(&mut self, parent: *mut Dir, de: &DirEntry, io_buf: &mut [u8]) -> bool {
        // SAFETY: the Dir holds its inode open; single fs call at a time.
        let dir_inode = unsafe { &mut *(*parent).inode };
        debug_assert!(dir_inode.size as usize % DIR_ENTRY_SIZE == 0);
        let mut all_blocks = self.collect_blocks(dir_inode);

        for block_idx in 0..NBLOCKS {
            if all_blocks[block_idx] == 0 {
                // Allocate here; the new entry becomes the block's first.
                if self.ensure_block(dir_inode, &mut all_blocks, block_idx).is_err() {
                    println!("sync_dir_entry: block allocation failed");
                    return false;
                }
                let io_buf = &mut io_buf[..SECTOR_SIZE];
                io_buf.fill(0);
                write_struct(io_buf, de);
                self.disk.write(all_blocks[block_idx], io_buf);
                dir_inode.size += DIR_ENTRY_SIZE as u32;
                return true;
            }

            let io_buf = &mut io_buf[..SECTOR_SIZE];
            self.disk.read(all_blocks[block_idx], io_buf);
            for entry_idx in 0..DIR_ENTRIES_PER_SEC {
                let slot: DirEntry = read_struct(&io_buf[entry_idx * DIR_ENTRY_SIZE..]);
                if slot.is_unused() {
                    write_struct(&mut io_buf[entry_idx * DIR_ENTRY_SIZE..], de);
                    self.disk.write(all_blocks[block_idx], io_buf);
                    dir_inode.size += DIR_ENTRY_SIZE as u32;
                    return true;
                }
            }
        }
        println!("directory is full!");
        false
    }

    /// Deletes the entry naming inode `ino` from `dir`. A block left with
    /// no live entries (other than the directory's first block, which keeps
    /// `.`/`..`) is reclaimed, and an indirect table emptied by that
    /// reclaim goes with it.
    pub fn delete_dir_entry(&mut self, dir: *mut Dir, ino: u32, io_buf: &mut [u8]) -> bool {
        // SAFETY: as in sync_dir_entry.
        let dir_inode = unsafe { &mut *(*dir).inode };
        let mut all_blocks = self.collect_blocks(dir_inode);

        for block_idx in 0..NBLOCKS {
            if all_blocks[block_idx] == 0 {
                continue;
            }
            let buf = &mut io_buf[..SECTOR_SIZE];
            self.disk.read(all_blocks[block_idx], buf);

            // Tally the block's live entries and find the victim.
            let mut is_dir_first_block = false;
            let mut dir_entry_cnt = 0;
            let mut found_idx = None;
            for entry_idx in 0..DIR_ENTRIES_PER_SEC {
                let de: DirEntry = read_struct(&buf[entry_idx * DIR_ENTRY_SIZE..]);
                if de.is_unused() {
                    continue;
                }
                if de.name() == "." {
                    is_dir_first_block = true;
                } else if de.name() != ".." {
                    dir_entry_cnt += 1;
                    if de.ino == ino {
                        debug_assert!(found_idx.is_none());
                        found_idx = Some(entry_idx);
                    }
                }
            }
            let Some(found_idx) = found_idx else {
                continue;
            };

            debug_assert!(dir_entry_cnt >= 1);
            if dir_entry_cnt == 1 && !is_dir_first_block {
                // The victim is the block's only tenant: reclaim the block.
                let bit = all_blocks[block_idx] - self.sb.data_start_lba;
                self.block_bitmap.set(bit as usize, false);
                self.bitmap_sync(bit, BitmapKind::Block);

                if block_idx < NDIRECT {
                    dir_inode.blocks[block_idx] = 0;
                } else {
                    let indirect_blocks =
                        all_blocks[NDIRECT..].iter().filter(|&&lba| lba != 0).count();
                    debug_assert!(indirect_blocks >= 1);
                    all_blocks[block_idx] = 0;
                    if indirect_blocks > 1 {
                        self.sync_indirect_table(dir_inode.blocks[NDIRECT], &all_blocks);
                    } else {
                        // Last indirect block gone: drop the table too.
                        let table_bit = dir_inode.blocks[NDIRECT] - self.sb.data_start_lba;
                        self.block_bitmap.set(table_bit as usize, false);
                        self.bitmap_sync(table_bit, BitmapKind::Block);
                        dir_inode.blocks[NDIRECT] = 0;
                    }
                }
            } else {
                // Just blank the slot in place.
                buf[found_idx * DIR_ENTRY_SIZE..(found_idx + 1) * DIR_ENTRY_SIZE].fill(0);
                self.disk.write(all_blocks[block_idx], buf);
            }

            debug_assert!(dir_inode.size as usize >= DIR_ENTRY_SIZE);
            dir_inode.size -= DIR_ENTRY_SIZE as u32;
            let mut sync_buf = alloc::vec![0u8; 2 * SECTOR_SIZE];
            self.inode_sync(dir_inode, &mut sync_buf);
            return true;
        }
        false
    }

    /// Returns the next live entry at the directory's cursor, advancing it;
    /// `None` once every live entry has been returned.
    pub fn dir_read(&mut self, dir: *mut Dir) -> Option<DirEntry> {
        // SAFETY: the Dir holds its inode open.
        let (all_blocks, dir_size) =
            unsafe { (self.collect_blocks(&*(*dir).inode), (*(*dir).inode).size) };

        let mut cur_entry_pos = 0u32;
        let mut buf = [0u8; SECTOR_SIZE];
        for &lba in all_blocks.iter() {
            // SAFETY: cursor read.
            if unsafe { (*dir).pos } >= dir_size {
                return None;
            }
            if lba == 0 {
                continue;
            }
            self.disk.read(lba, &mut buf);
            for entry_idx in 0..DIR_ENTRIES_PER_SEC {
                let de: DirEntry = read_struct(&buf[entry_idx * DIR_ENTRY_SIZE..]);
                if de.is_unused() {
                    continue;
                }
                // Skip entries the cursor already returned; deleted slots
                // in between make this a walk, not an index.
                // SAFETY: cursor.
                unsafe {
                    if cur_entry_pos < (*dir).pos {
                        cur_entry_pos += DIR_ENTRY_SIZE as u32;
                        continue;
                    }
                    debug_assert_eq!(cur_entry_pos, (*dir).pos);
                    (*dir).pos += DIR_ENTRY_SIZE as u32;
                }
                return Some(de);
            }
        }
        None
    }

    /// A directory is empty when it holds exactly `.` and `..`.
    pub fn dir_is_empty(&mut self, dir: *mut Dir) -> bool {
        // SAFETY: the Dir holds its inode open.
        unsafe { (*(*dir).inode).size == 2 * DIR_ENTRY_SIZE as u32 }
    }

    /// Removes the empty directory `child` from `parent` and releases its
    /// inode.
    pub fn dir_remove(&mut self, parent: *mut Dir, child: *mut Dir) -> Result<(), ()> {
        // SAFETY: both Dirs hold their inodes open.
        unsafe {
            let child_inode = (*child).inode;
            // Only an empty directory may go: nothing past block 0.
            for block_idx in 1..=NDIRECT {
                assert_eq!((*child_inode).blocks[block_idx], 0);
            }
            let mut io_buf = alloc::vec![0u8; 2 * SECTOR_SIZE];
            self.delete_dir_entry(parent, (*child_inode).ino, &mut io_buf);
            self.inode_release((*child_inode).ino);
        }
        Ok(())
    }

    /// `pos` back to the first entry.
    pub fn dir_rewind(&mut self, dir: *mut Dir) {
        // SAFETY: cursor store.
        unsafe { (*dir).pos = 0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_do_not_straddle_sectors() {
        // 21 entries of 24 bytes leave 8 slack bytes per sector.
        assert_eq!(DIR_ENTRIES_PER_SEC, 21);
        assert_eq!(SECTOR_SIZE - DIR_ENTRIES_PER_SEC * DIR_ENTRY_SIZE, 8);
    }

    #[test]
    fn entry_name_round_trips() {
        let de = DirEntry::new("notes.txt", 7, FileType::Regular);
        assert_eq!(de.name(), "notes.txt");
        assert_eq!(de.ino, 7);
        assert_eq!(de.file_type(), FileType::Regular);
        assert!(!de.is_unused());
        assert!(DirEntry::zero().is_unused());
    }

    #[test]
    fn entry_name_max_length() {
        let name = "a".repeat(MAX_FILE_NAME_LEN);
        let de = DirEntry::new(&name, 1, FileType::Directory);
        assert_eq!(de.name().len(), MAX_FILE_NAME_LEN);
        // The terminating NUL survives at the last byte.
        assert_eq!(de.filename[MAX_FILE_NAME_LEN], 0);
    }
}
