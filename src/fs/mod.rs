//! The on-disk file system.
//!
//! Layout per partition: boot sector, super block, block bitmap, inode
//! bitmap, inode table, data area. A block is one 512-byte sector. The
//! mounted state (super block copy, both bitmaps, the open-inode cache and
//! the root directory) lives in a [`FileSys`], generic over the block
//! device so the whole layer also runs against a memory-backed disk in the
//! tests.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;

use arrayvec::ArrayString;

use crate::ata::{self, BlockIo};
use crate::bitmap::Bitmap;
use crate::list::List;
use crate::param::{MAX_PATH_LEN, SECTOR_SIZE};
use crate::utils::{read_struct, write_struct, Global};
use crate::println;

pub mod dir;
pub mod inode;
pub mod path;
pub mod stat;
mod superblock;

pub use dir::{Dir, DirEntry, DIR_ENTRY_SIZE};
pub use inode::{Inode, MAX_FILE_BYTES};
pub use stat::Stat;
pub use superblock::{SuperBlock, FS_MAGIC};

use dir::DIR_ENTRIES_PER_SEC;
use path::{basename, path_depth, path_parse};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    Regular = 1,
    Directory = 2,
}

/// Which on-disk bitmap a sync targets.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum BitmapKind {
    Inode,
    Block,
}

/// A mounted file system over block device `D`.
pub struct FileSys<D: BlockIo> {
    pub disk: D,
    pub name: ArrayString<8>,
    pub start_lba: u32,
    pub sec_cnt: u32,
    pub sb: SuperBlock,
    pub block_bitmap: Bitmap,
    pub inode_bitmap: Bitmap,
    open_inodes: List,
    root_dir: *mut Dir,
}

/// What a path lookup saw on the way: the deepest directory left open for
/// the caller (creation happens inside it), the kind of the final entry,
/// and the prefix that actually resolved.
pub struct SearchRecord {
    pub parent_dir: *mut Dir,
    pub file_type: FileType,
    pub searched_path: String,
}

impl SearchRecord {
    pub fn new() -> Self {
        Self {
            parent_dir: core::ptr::null_mut(),
            file_type: FileType::Unknown,
            searched_path: String::new(),
        }
    }
}

impl Default for SearchRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a fresh file system onto `sec_cnt` sectors at `start_lba`: super
/// block, both bitmaps (with the tail bits past the true block count forced
/// set so they can never be allocated), the inode table with the root
/// inode, and the root directory holding `.` and `..`.
pub fn format<D: BlockIo>(disk: &D, start_lba: u32, sec_cnt: u32, name: &str) {
    let sb = SuperBlock::compute(start_lba, sec_cnt);
    println!("{} info:", name);
    println!(
        "   magic:{:#x} part_lba_base:{:#x} all_sectors:{:#x} inode_cnt:{:#x}",
        sb.magic, sb.part_lba_base, sb.sec_cnt, sb.inode_cnt
    );
    println!(
        "   block_bitmap_lba:{:#x} inode_bitmap_lba:{:#x} inode_table_lba:{:#x} data_start_lba:{:#x}",
        sb.block_bitmap_lba, sb.inode_bitmap_lba, sb.inode_table_lba, sb.data_start_lba
    );

    // 1. Super block to sector 1 of the partition.
    let mut sec = [0u8; SECTOR_SIZE];
    write_struct(&mut sec, &sb);
    disk.write(start_lba + 1, &sec);

    // The largest metadata area sizes the staging buffer.
    let buf_sects = sb
        .block_bitmap_sects
        .max(sb.inode_bitmap_sects)
        .max(sb.inode_table_sects) as usize;
    let mut buf = vec![0u8; buf_sects * SECTOR_SIZE];

    // 2. Block bitmap: bit 0 is the root directory's data block; every bit
    // past the true block count is forced set to trap bad allocations.
    buf[0] |= 0x01;
    let bit_len = sb.block_bitmap_bit_len() as usize;
    let last_byte = bit_len / 8;
    let last_bit = bit_len % 8;
    let last_size = SECTOR_SIZE - (last_byte % SECTOR_SIZE);
    buf[last_byte..last_byte + last_size].fill(0xff);
    for bit_idx in 0..last_bit {
        buf[last_byte] &= !(1u8 << bit_idx);
    }
    disk.write(
        sb.block_bitmap_lba,
        &buf[..sb.block_bitmap_sects as usize * SECTOR_SIZE],
    );

    // 3. Inode bitmap: inode 0 is the root directory.
    buf.fill(0);
    buf[0] |= 0x01;
    disk.write(
        sb.inode_bitmap_lba,
        &buf[..sb.inode_bitmap_sects as usize * SECTOR_SIZE],
    );

    // 4. Inode table: entry 0 points its first block at the data area and
    // holds the two initial entries' worth of size.
    buf.fill(0);
    let mut root_inode = Inode::new(0);
    root_inode.size = 2 * DIR_ENTRY_SIZE as u32;
    root_inode.blocks[0] = sb.data_start_lba;
    write_struct(&mut buf, &root_inode.to_disk());
    disk.write(
        sb.inode_table_lba,
        &buf[..sb.inode_table_sects as usize * SECTOR_SIZE],
    );

    // 5. Root directory data: `.` and `..`, both inode 0.
    buf.fill(0);
    write_struct(&mut buf, &DirEntry::new(".", 0, FileType::Directory));
    write_struct(
        &mut buf[DIR_ENTRY_SIZE..],
        &DirEntry::new("..", 0, FileType::Directory),
    );
    disk.write(sb.data_start_lba, &buf[..SECTOR_SIZE]);
    println!("   root_dir_lba:{:#x}", sb.data_start_lba);
    println!("{} format done", name);
}

impl<D: BlockIo> FileSys<D> {
    /// Mounts a formatted partition: super block in, bitmaps loaded into
    /// fresh buffers, open-inode cache empty, root directory opened.
    pub fn mount(disk: D, start_lba: u32, sec_cnt: u32, name: &str) -> Self {
        let mut sec = [0u8; SECTOR_SIZE];
        disk.read(start_lba + 1, &mut sec);
        let sb: SuperBlock = read_struct(&sec);
        assert_eq!(sb.magic, FS_MAGIC, "mount: no file system on {}", name);

        let block_bm_bytes = sb.block_bitmap_sects as usize * SECTOR_SIZE;
        let block_bits = Box::leak(vec![0u8; block_bm_bytes].into_boxed_slice());
        disk.read(sb.block_bitmap_lba, block_bits);

        let inode_bm_bytes = sb.inode_bitmap_sects as usize * SECTOR_SIZE;
        let inode_bits = Box::leak(vec![0u8; inode_bm_bytes].into_boxed_slice());
        disk.read(sb.inode_bitmap_lba, inode_bits);

        let mut fs_name = ArrayString::new();
        let _ = fs_name.try_push_str(name);

        let mut fs = Self {
            disk,
            name: fs_name,
            start_lba,
            sec_cnt,
            sb,
            // SAFETY: leaked boxes, unaliased.
            block_bitmap: unsafe { Bitmap::from_raw(block_bits.as_mut_ptr(), block_bm_bytes) },
            inode_bitmap: unsafe { Bitmap::from_raw(inode_bits.as_mut_ptr(), inode_bm_bytes) },
            open_inodes: List::new(),
            root_dir: core::ptr::null_mut(),
        };
        fs.open_inodes.init();
        fs.root_dir = Box::into_raw(Box::new(Dir {
            inode: fs.inode_open(fs.sb.root_inode_no),
            pos: 0,
        }));
        println!("mount {} done!", name);
        fs
    }

    /// Reserves one data block, returning its absolute LBA.
    pub fn block_bitmap_alloc(&mut self) -> Option<u32> {
        let bit_idx = self.block_bitmap.scan(1)?;
        self.block_bitmap.set(bit_idx, true);
        Some(self.sb.data_start_lba + bit_idx as u32)
    }

    /// Reserves one inode number.
    pub fn inode_bitmap_alloc(&mut self) -> Option<u32> {
        let bit_idx = self.inode_bitmap.scan(1)?;
        self.inode_bitmap.set(bit_idx, true);
        Some(bit_idx as u32)
    }

    /// Flushes the bitmap sector containing `bit_idx` back to disk.
    pub fn bitmap_sync(&mut self, bit_idx: u32, kind: BitmapKind) {
        let off_sec = bit_idx as usize / 8 / SECTOR_SIZE;
        let byte_off = off_sec * SECTOR_SIZE;
        let (lba, bitmap) = match kind {
            BitmapKind::Inode => (self.sb.inode_bitmap_lba, &self.inode_bitmap),
            BitmapKind::Block => (self.sb.block_bitmap_lba, &self.block_bitmap),
        };
        let sector = &bitmap.byte_slice()[byte_off..byte_off + SECTOR_SIZE];
        // Borrow dance: the disk is independent of the bitmap storage.
        let mut sec = [0u8; SECTOR_SIZE];
        sec.copy_from_slice(sector);
        self.disk.write(lba + off_sec as u32, &sec);
    }

    /// Resolves `pathname` starting at the root. On a hit returns the inode
    /// number; on a miss returns `None` with the deepest existing directory
    /// left open in `rec` so the caller may create inside it. Either way
    /// `rec.searched_path` holds the prefix that was actually walked.
    pub fn search_file(&mut self, pathname: &str, rec: &mut SearchRecord) -> Option<u32> {
        if pathname == "/" || pathname == "/." || pathname == "/.." {
            rec.parent_dir = self.root_dir();
            rec.file_type = FileType::Directory;
            rec.searched_path.clear();
            return Some(self.sb.root_inode_no);
        }
        let path_len = pathname.len();
        assert!(pathname.starts_with('/') && path_len > 1 && path_len < MAX_PATH_LEN);

        let mut parent_dir = self.root_dir();
        rec.parent_dir = parent_dir;
        rec.file_type = FileType::Unknown;
        rec.searched_path.clear();
        let mut parent_ino = self.sb.root_inode_no;
        let mut last_ino = self.sb.root_inode_no;

        let (mut name, mut sub_path) = path_parse(pathname);
        while !name.is_empty() {
            debug_assert!(rec.searched_path.len() < MAX_PATH_LEN);
            rec.searched_path.push('/');
            rec.searched_path.push_str(name);

            match self.search_dir_entry(parent_dir, name) {
                Some(dir_e) => {
                    let (next_name, next_sub) = path_parse(sub_path);
                    name = next_name;
                    sub_path = next_sub;

                    match dir_e.file_type() {
                        FileType::Directory => {
                            // SAFETY: the Dir holds its inode open.
                            parent_ino = unsafe { (*(*parent_dir).inode).ino };
                            self.dir_close(parent_dir);
                            parent_dir = self.dir_open(dir_e.ino);
                            rec.parent_dir = parent_dir;
                            last_ino = dir_e.ino;
                        }
                        FileType::Regular => {
                            rec.file_type = FileType::Regular;
                            return Some(dir_e.ino);
                        }
                        FileType::Unknown => return None,
                    }
                }
                // Not found: the parent stays open so the caller can
                // create `name` inside it.
                None => return None,
            }
        }

        // The whole path resolved and ends on a directory; hand back its
        // direct parent.
        self.dir_close(rec.parent_dir);
        rec.parent_dir = self.dir_open(parent_ino);
        rec.file_type = FileType::Directory;
        Some(last_ino)
    }

    /// Creates an empty regular file named `name` inside `parent_dir` and
    /// returns its open inode. Any failure unwinds the bits taken so far.
    pub fn create_file_inode(&mut self, parent_dir: *mut Dir, name: &str) -> Result<*mut Inode, ()> {
        let mut io_buf = vec![0u8; 2 * SECTOR_SIZE];

        let Some(ino) = self.inode_bitmap_alloc() else {
            println!("create_file_inode: inode bitmap exhausted");
            return Err(());
        };

        let mut new_inode = Inode::new(ino);
        let de = DirEntry::new(name, ino, FileType::Regular);
        if !self.sync_dir_entry(parent_dir, &de, &mut io_buf) {
            self.inode_bitmap.set(ino as usize, false);
            return Err(());
        }

        // SAFETY: the Dir holds its inode open.
        let parent_inode = unsafe { &*(*parent_dir).inode };
        io_buf.fill(0);
        self.inode_sync(parent_inode, &mut io_buf);
        io_buf.fill(0);
        self.inode_sync(&new_inode, &mut io_buf);
        self.bitmap_sync(ino, BitmapKind::Inode);

        new_inode.open_cnts = 1;
        // List the fresh inode the same way inode_open would.
        let inode = Box::into_raw(Box::new(new_inode));
        // SAFETY: freshly leaked.
        unsafe {
            (*inode).tag.init();
            self.open_inodes.push_front(&mut (*inode).tag);
        }
        Ok(inode)
    }

    /// Creates directory `pathname`. Five steps, each with its own
    /// rollback: existence check, inode number, the `.`/`..` block, the
    /// parent's entry, then the metadata syncs.
    pub fn mkdir(&mut self, pathname: &str) -> Result<(), ()> {
        let mut io_buf = vec![0u8; 2 * SECTOR_SIZE];
        let mut rec = SearchRecord::new();

        // Step 1: nothing of that name, and every intermediate resolves.
        if self.search_file(pathname, &mut rec).is_some() {
            println!("mkdir: file or directory {} exist!", pathname);
            self.dir_close(rec.parent_dir);
            return Err(());
        }
        if path_depth(pathname) != path_depth(&rec.searched_path) {
            println!(
                "mkdir: cannot access {}: subpath {} does not exist",
                pathname, rec.searched_path
            );
            self.dir_close(rec.parent_dir);
            return Err(());
        }

        let parent_dir = rec.parent_dir;
        let dirname = String::from(basename(&rec.searched_path));

        // Step 2: an inode for the new directory.
        let Some(ino) = self.inode_bitmap_alloc() else {
            println!("mkdir: allocate inode failed");
            self.dir_close(parent_dir);
            return Err(());
        };
        let mut new_dir_inode = Inode::new(ino);

        // Step 3: one data block holding `.` and `..`.
        let Some(block_lba) = self.block_bitmap_alloc() else {
            println!("mkdir: block allocation failed");
            self.inode_bitmap.set(ino as usize, false);
            self.dir_close(parent_dir);
            return Err(());
        };
        let block_bit = block_lba - self.sb.data_start_lba;
        debug_assert!(block_bit != 0);
        self.bitmap_sync(block_bit, BitmapKind::Block);
        new_dir_inode.blocks[0] = block_lba;

        io_buf.fill(0);
        write_struct(&mut io_buf, &DirEntry::new(".", ino, FileType::Directory));
        // SAFETY: the Dir holds its inode open.
        let parent_ino = unsafe { (*(*parent_dir).inode).ino };
        write_struct(
            &mut io_buf[DIR_ENTRY_SIZE..],
            &DirEntry::new("..", parent_ino, FileType::Directory),
        );
        self.disk.write(block_lba, &io_buf[..SECTOR_SIZE]);
        new_dir_inode.size = 2 * DIR_ENTRY_SIZE as u32;

        // Step 4: the parent's entry for us.
        let de = DirEntry::new(&dirname, ino, FileType::Directory);
        io_buf.fill(0);
        if !self.sync_dir_entry(parent_dir, &de, &mut io_buf) {
            println!("mkdir: sync_dir_entry failed");
            self.block_bitmap.set(block_bit as usize, false);
            self.bitmap_sync(block_bit, BitmapKind::Block);
            self.inode_bitmap.set(ino as usize, false);
            self.dir_close(parent_dir);
            return Err(());
        }

        // Step 5: push everything out.
        io_buf.fill(0);
        // SAFETY: as above.
        let parent_inode = unsafe { &*(*parent_dir).inode };
        self.inode_sync(parent_inode, &mut io_buf);
        io_buf.fill(0);
        self.inode_sync(&new_dir_inode, &mut io_buf);
        self.bitmap_sync(ino, BitmapKind::Inode);

        self.dir_close(parent_dir);
        Ok(())
    }

    /// Removes the empty directory at `pathname`.
    pub fn rmdir(&mut self, pathname: &str) -> Result<(), ()> {
        let mut rec = SearchRecord::new();
        let ino = self.search_file(pathname, &mut rec);

        let result = match ino {
            None => {
                println!("rmdir: {} not found (subpath {})", pathname, rec.searched_path);
                Err(())
            }
            Some(ino) => {
                assert!(ino != 0, "rmdir of the root directory");
                if rec.file_type == FileType::Regular {
                    println!("rmdir: {} is a regular file!", pathname);
                    Err(())
                } else {
                    let dir = self.dir_open(ino);
                    let outcome = if !self.dir_is_empty(dir) {
                        println!("rmdir: {} is not empty", pathname);
                        Err(())
                    } else {
                        self.dir_remove(rec.parent_dir, dir)
                    };
                    self.dir_close(dir);
                    outcome
                }
            }
        };
        self.dir_close(rec.parent_dir);
        result
    }

    /// Fills `st` for `pathname`.
    pub fn stat(&mut self, pathname: &str, st: &mut Stat) -> Result<(), ()> {
        if pathname == "/" || pathname == "/." || pathname == "/.." {
            st.file_type = FileType::Directory;
            st.ino = self.sb.root_inode_no;
            // SAFETY: the root dir holds its inode open.
            st.size = unsafe { (*(*self.root_dir()).inode).size };
            return Ok(());
        }
        let mut rec = SearchRecord::new();
        let found = self.search_file(pathname, &mut rec);
        let result = match found {
            Some(ino) => {
                let inode = self.inode_open(ino);
                // SAFETY: just opened.
                st.size = unsafe { (*inode).size };
                self.inode_close(inode);
                st.file_type = rec.file_type;
                st.ino = ino;
                Ok(())
            }
            None => {
                println!("stat: {} not found", pathname);
                Err(())
            }
        };
        self.dir_close(rec.parent_dir);
        result
    }

    /// The `..` entry of a directory names its parent; it lives at slot 1
    /// of the directory's first block.
    fn parent_ino_of(&mut self, child_ino: u32) -> u32 {
        let child = self.inode_open(child_ino);
        // SAFETY: just opened.
        let block_lba = unsafe { (*child).blocks[0] };
        debug_assert!(block_lba >= self.sb.data_start_lba);
        self.inode_close(child);

        let mut buf = [0u8; SECTOR_SIZE];
        self.disk.read(block_lba, &mut buf);
        let dotdot: DirEntry = read_struct(&buf[DIR_ENTRY_SIZE..]);
        debug_assert!(dotdot.ino < self.sb.inode_cnt && dotdot.file_type() == FileType::Directory);
        dotdot.ino
    }

    /// Finds the name under which `child_ino` appears in directory
    /// `parent_ino`.
    fn child_name_in(&mut self, parent_ino: u32, child_ino: u32) -> Option<String> {
        let parent = self.inode_open(parent_ino);
        // SAFETY: just opened.
        let all_blocks = unsafe { self.collect_blocks(&*parent) };
        self.inode_close(parent);

        let mut buf = [0u8; SECTOR_SIZE];
        for &lba in all_blocks.iter() {
            if lba == 0 {
                continue;
            }
            self.disk.read(lba, &mut buf);
            for idx in 0..DIR_ENTRIES_PER_SEC {
                let de: DirEntry = read_struct(&buf[idx * DIR_ENTRY_SIZE..]);
                if !de.is_unused() && de.ino == child_ino {
                    return Some(String::from(de.name()));
                }
            }
        }
        None
    }

    /// Rebuilds the absolute path of the directory `cwd_ino` by walking
    /// parent-ward to the root and reversing the names collected on the
    /// way.
    pub fn rebuild_cwd_path(&mut self, mut child_ino: u32) -> Option<String> {
        assert!(child_ino < self.sb.inode_cnt);
        if child_ino == self.sb.root_inode_no {
            return Some(String::from("/"));
        }
        let mut names = alloc::vec::Vec::new();
        while child_ino != self.sb.root_inode_no {
            let parent_ino = self.parent_ino_of(child_ino);
            names.push(self.child_name_in(parent_ino, child_ino)?);
            child_ino = parent_ino;
        }
        let mut full_path = String::new();
        for name in names.iter().rev() {
            full_path.push('/');
            full_path.push_str(name);
        }
        Some(full_path)
    }
}

/// The default mounted partition; every file-system syscall goes through
/// it.
///
/// On-disk state is serialised the uniprocessor way: a single task executes
/// a given sys_* call at a time and never yields inside an unsafe window,
/// so the raw access below mirrors the access discipline rather than adding
/// another lock level.
type DiskRef = &'static ata::Disk;
static CUR_FS: Global<Option<FileSys<DiskRef>>> = Global::new(None);

#[allow(clippy::mut_from_ref)]
pub fn cur_fs() -> &'static mut FileSys<DiskRef> {
    // SAFETY: see the serialisation note above; mounted before first use.
    unsafe { (*CUR_FS.get()).as_mut().expect("file system not mounted") }
}

/// Probes every scanned partition, formats the ones carrying no file
/// system, then mounts the default partition (`sdb1`).
pub fn filesys_init() {
    println!("searching filesystem......");
    let mut sec = [0u8; SECTOR_SIZE];
    // Only the second disk of channel 0 carries data partitions; sda is
    // the raw system image.
    let hd = ata::disk(0, 1);
    for part in hd.prim_parts.iter().chain(hd.logic_parts.iter()) {
        if !part.exists() {
            continue;
        }
        hd.read(part.start_lba + 1, &mut sec);
        let sb: SuperBlock = read_struct(&sec);
        if sb.magic == FS_MAGIC {
            println!("{} has filesystem", part.name);
        } else {
            println!("formatting {}'s partition {}......", hd.name(), part.name);
            format(&hd, part.start_lba, part.sec_cnt, &part.name);
        }
    }

    let default_part = ata::partition_by_name("sdb1").expect("default partition sdb1");
    let fs = FileSys::mount(
        ata::disk(0, 1),
        default_part.start_lba,
        default_part.sec_cnt,
        &default_part.name,
    );
    // SAFETY: single-threaded init.
    unsafe { *CUR_FS.get() = Some(fs) };

    crate::file::file_table_init();
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;
    use core::cell::RefCell;

    use super::inode::NDIRECT;
    use super::*;

    /// Memory-backed block device satisfying the same contract the ATA
    /// disk does.
    struct RamDisk(RefCell<Vec<u8>>);

    impl RamDisk {
        fn new(sectors: usize) -> Self {
            Self(RefCell::new(alloc::vec![0u8; sectors * SECTOR_SIZE]))
        }
    }

    impl BlockIo for RamDisk {
        fn read(&self, lba: u32, buf: &mut [u8]) {
            let off = lba as usize * SECTOR_SIZE;
            buf.copy_from_slice(&self.0.borrow()[off..off + buf.len()]);
        }

        fn write(&self, lba: u32, buf: &[u8]) {
            let off = lba as usize * SECTOR_SIZE;
            self.0.borrow_mut()[off..off + buf.len()].copy_from_slice(buf);
        }
    }

    const PART_START: u32 = 2048;
    const PART_SECS: u32 = 16384;

    fn fresh_fs() -> FileSys<RamDisk> {
        let disk = RamDisk::new((PART_START + PART_SECS) as usize);
        format(&disk, PART_START, PART_SECS, "ram1");
        FileSys::mount(disk, PART_START, PART_SECS, "ram1")
    }

    /// Creates an empty regular file at a root-level path and returns its
    /// open inode.
    fn create_at_root(fs: &mut FileSys<RamDisk>, path: &str) -> *mut Inode {
        let mut rec = SearchRecord::new();
        assert!(fs.search_file(path, &mut rec).is_none());
        let inode = fs
            .create_file_inode(rec.parent_dir, path::basename(path))
            .expect("create");
        fs.dir_close(rec.parent_dir);
        inode
    }

    fn bitmap_counts(fs: &FileSys<RamDisk>) -> (usize, usize) {
        (fs.block_bitmap.count_ones(), fs.inode_bitmap.count_ones())
    }

    #[test]
    fn format_then_mount_yields_root_with_dot_and_dotdot() {
        let mut fs = fresh_fs();
        let root = fs.root_dir();
        // SAFETY: root holds its inode open.
        unsafe {
            assert_eq!((*(*root).inode).ino, 0);
            assert_eq!((*(*root).inode).size, 2 * DIR_ENTRY_SIZE as u32);
        }
        let dot = fs.search_dir_entry(root, ".").expect("dot entry");
        let dotdot = fs.search_dir_entry(root, "..").expect("dotdot entry");
        assert_eq!(dot.ino, 0);
        assert_eq!(dotdot.ino, 0);
        assert_eq!(dot.file_type(), FileType::Directory);
        assert_eq!(dotdot.file_type(), FileType::Directory);

        // Exactly the root's block and inode are taken, plus the forced
        // tail bits beyond the true data area.
        let forced_tail = fs.block_bitmap.bits_len() - fs.sb.block_bitmap_bit_len() as usize;
        assert_eq!(fs.block_bitmap.count_ones(), 1 + forced_tail);
        assert_eq!(fs.inode_bitmap.count_ones(), 1);
    }

    #[test]
    fn write_seek_read_round_trip() {
        let mut fs = fresh_fs();
        let inode = create_at_root(&mut fs, "/a");

        // Crosses the direct/indirect boundary: 12 direct blocks plus
        // three indirect ones and change.
        let n = NDIRECT * SECTOR_SIZE + 3 * SECTOR_SIZE + 37;
        let data: Vec<u8> = (0..n).map(|i| (i * 7 % 251) as u8).collect();
        assert_eq!(fs.write_at(inode, 0, &data), Ok(n));

        let mut back = alloc::vec![0u8; n];
        assert_eq!(fs.read_at(inode, 0, &mut back), Ok(n));
        assert_eq!(back, data);

        // Offset reads see the same bytes.
        let mut tail = alloc::vec![0u8; 100];
        assert_eq!(fs.read_at(inode, (n - 100) as u32, &mut tail), Ok(100));
        assert_eq!(&tail[..], &data[n - 100..]);

        // Reading at the size is end-of-file.
        assert!(fs.read_at(inode, n as u32, &mut tail).is_err());
        fs.inode_close(inode);
    }

    #[test]
    fn thirteenth_block_allocates_the_indirect_table() {
        let mut fs = fresh_fs();
        let inode = create_at_root(&mut fs, "/big");
        let (blocks_before, _) = bitmap_counts(&fs);

        let data = alloc::vec![0xabu8; (NDIRECT + 1) * SECTOR_SIZE];
        assert_eq!(fs.write_at(inode, 0, &data), Ok(data.len()));

        // SAFETY: open inode.
        unsafe {
            assert!((*inode).blocks[NDIRECT] != 0, "indirect table missing");
            assert!((&(*inode).blocks)[..NDIRECT].iter().all(|&lba| lba != 0));
        }
        // 13 data blocks plus the table itself.
        let (blocks_after, _) = bitmap_counts(&fs);
        assert_eq!(blocks_after - blocks_before, NDIRECT + 2);
        fs.inode_close(inode);
    }

    #[test]
    fn mkdir_rmdir_restores_all_metadata() {
        let mut fs = fresh_fs();
        let before = bitmap_counts(&fs);
        // SAFETY: root inode stays open.
        let root_size_before = unsafe { (*(*fs.root_dir()).inode).size };

        assert_eq!(fs.mkdir("/d"), Ok(()));
        let mut rec = SearchRecord::new();
        let ino = fs.search_file("/d", &mut rec).expect("dir exists");
        assert_eq!(rec.file_type, FileType::Directory);
        fs.dir_close(rec.parent_dir);

        // The fresh directory holds exactly `.` and `..` naming itself and
        // its parent.
        let dir = fs.dir_open(ino);
        let dot = fs.search_dir_entry(dir, ".").unwrap();
        let dotdot = fs.search_dir_entry(dir, "..").unwrap();
        assert_eq!(dot.ino, ino);
        assert_eq!(dotdot.ino, 0);
        assert!(fs.dir_is_empty(dir));
        fs.dir_close(dir);

        assert_eq!(fs.rmdir("/d"), Ok(()));
        assert_eq!(bitmap_counts(&fs), before);
        // SAFETY: as above.
        assert_eq!(unsafe { (*(*fs.root_dir()).inode).size }, root_size_before);

        let mut rec = SearchRecord::new();
        assert!(fs.search_file("/d", &mut rec).is_none());
        fs.dir_close(rec.parent_dir);
    }

    #[test]
    fn rmdir_refuses_nonempty_and_nested_paths_resolve() {
        let mut fs = fresh_fs();
        assert_eq!(fs.mkdir("/d"), Ok(()));
        assert_eq!(fs.mkdir("/d/e"), Ok(()));
        // A middle component that does not exist fails cleanly.
        assert!(fs.mkdir("/nope/x").is_err());

        assert!(fs.rmdir("/d").is_err(), "non-empty directory removed");
        assert_eq!(fs.rmdir("/d/e"), Ok(()));
        assert_eq!(fs.rmdir("/d"), Ok(()));
    }

    #[test]
    fn unlink_then_create_reuses_inode_and_block() {
        let mut fs = fresh_fs();
        let inode = create_at_root(&mut fs, "/f");
        assert_eq!(fs.write_at(inode, 0, b"x"), Ok(1));
        // SAFETY: open inode.
        let (ino1, block1) = unsafe { ((*inode).ino, (*inode).blocks[0]) };
        fs.inode_close(inode);

        // fs-level unlink: drop the entry, release the inode.
        let mut rec = SearchRecord::new();
        let ino = fs.search_file("/f", &mut rec).unwrap();
        let mut io_buf = alloc::vec![0u8; 2 * SECTOR_SIZE];
        assert!(fs.delete_dir_entry(rec.parent_dir, ino, &mut io_buf));
        fs.inode_release(ino);
        fs.dir_close(rec.parent_dir);

        let inode = create_at_root(&mut fs, "/f");
        assert_eq!(fs.write_at(inode, 0, b"y"), Ok(1));
        // SAFETY: open inode.
        unsafe {
            assert_eq!((*inode).ino, ino1);
            assert_eq!((*inode).blocks[0], block1);
        }
        fs.inode_close(inode);
    }

    #[test]
    fn straddling_inode_survives_sync_and_reopen() {
        let mut fs = fresh_fs();
        // Inode 6 spans bytes 456..532 of the table: two sectors.
        let pos = fs.inode_locate(6);
        assert!(pos.two_sec);

        for _ in 0..6 {
            let mut rec = SearchRecord::new();
            // Names f1..f6 so inode 6 is the last created.
            let name = alloc::format!("/f{}", fs.inode_bitmap.count_ones());
            assert!(fs.search_file(&name, &mut rec).is_none());
            let inode = fs
                .create_file_inode(rec.parent_dir, path::basename(&name))
                .unwrap();
            fs.dir_close(rec.parent_dir);
            fs.inode_close(inode);
        }

        let inode = fs.inode_open(6);
        assert_eq!(fs.write_at(inode, 0, b"straddle"), Ok(8));
        // SAFETY: open inode.
        let saved_block = unsafe { (*inode).blocks[0] };
        fs.inode_close(inode);

        // Reopen from disk and verify the on-disk image.
        let inode = fs.inode_open(6);
        // SAFETY: open inode.
        unsafe {
            assert_eq!((*inode).size, 8);
            assert_eq!((*inode).blocks[0], saved_block);
            assert_eq!((*inode).open_cnts, 1);
        }
        let mut back = [0u8; 8];
        assert_eq!(fs.read_at(inode, 0, &mut back), Ok(8));
        assert_eq!(&back, b"straddle");
        fs.inode_close(inode);
    }

    #[test]
    fn open_inode_cache_counts_references() {
        let mut fs = fresh_fs();
        let inode = create_at_root(&mut fs, "/shared");
        let again = fs.inode_open(unsafe { (*inode).ino });
        assert_eq!(inode, again, "second open must hit the cache");
        // SAFETY: open inode.
        unsafe { assert_eq!((*inode).open_cnts, 2) };
        fs.inode_close(again);
        // SAFETY: still open once.
        unsafe { assert_eq!((*inode).open_cnts, 1) };
        fs.inode_close(inode);
    }

    #[test]
    fn search_file_leaves_parent_open_on_miss() {
        let mut fs = fresh_fs();
        assert_eq!(fs.mkdir("/d"), Ok(()));

        let mut rec = SearchRecord::new();
        assert!(fs.search_file("/d/newfile", &mut rec).is_none());
        // The record points at /d, where the caller may now create.
        // SAFETY: record's parent is open.
        let parent_ino = unsafe { (*(*rec.parent_dir).inode).ino };
        let mut d_rec = SearchRecord::new();
        let d_ino = fs.search_file("/d", &mut d_rec).unwrap();
        assert_eq!(parent_ino, d_ino);
        assert_eq!(rec.searched_path, "/d/newfile");
        fs.dir_close(d_rec.parent_dir);

        let inode = fs.create_file_inode(rec.parent_dir, "newfile").unwrap();
        fs.dir_close(rec.parent_dir);
        fs.inode_close(inode);
        let mut rec = SearchRecord::new();
        assert!(fs.search_file("/d/newfile", &mut rec).is_some());
        fs.dir_close(rec.parent_dir);
    }

    #[test]
    fn readdir_walks_live_entries_once() {
        let mut fs = fresh_fs();
        assert_eq!(fs.mkdir("/dir"), Ok(()));
        let mut rec = SearchRecord::new();
        let ino = fs.search_file("/dir", &mut rec).unwrap();
        fs.dir_close(rec.parent_dir);

        for name in ["x", "y"] {
            let dir = fs.dir_open(ino);
            let inode = fs.create_file_inode(dir, name).unwrap();
            fs.inode_close(inode);
            fs.dir_close(dir);
        }

        let dir = fs.dir_open(ino);
        let mut names: Vec<alloc::string::String> = Vec::new();
        while let Some(de) = fs.dir_read(dir) {
            names.push(alloc::string::String::from(de.name()));
        }
        assert_eq!(names, [".", "..", "x", "y"]);

        fs.dir_rewind(dir);
        assert_eq!(fs.dir_read(dir).unwrap().name(), ".");
        fs.dir_close(dir);
    }

    #[test]
    fn cwd_path_rebuilds_from_nested_directory() {
        let mut fs = fresh_fs();
        assert_eq!(fs.mkdir("/d"), Ok(()));
        assert_eq!(fs.mkdir("/d/e"), Ok(()));
        let mut rec = SearchRecord::new();
        let ino = fs.search_file("/d/e", &mut rec).unwrap();
        fs.dir_close(rec.parent_dir);

        assert_eq!(fs.rebuild_cwd_path(ino).as_deref(), Some("/d/e"));
        assert_eq!(fs.rebuild_cwd_path(0).as_deref(), Some("/"));
    }

    #[test]
    fn stat_reports_type_ino_and_size() {
        let mut fs = fresh_fs();
        let inode = create_at_root(&mut fs, "/s");
        assert_eq!(fs.write_at(inode, 0, &[0u8; 700]), Ok(700));
        fs.inode_close(inode);

        let mut st = Stat::zero();
        assert_eq!(fs.stat("/s", &mut st), Ok(()));
        assert_eq!(st.size, 700);
        assert_eq!(st.file_type, FileType::Regular);

        assert_eq!(fs.stat("/", &mut st), Ok(()));
        assert_eq!(st.ino, 0);
        assert_eq!(st.file_type, FileType::Directory);
        assert!(fs.stat("/missing", &mut st).is_err());
    }

    #[test]
    fn deleting_the_sole_entry_of_a_spilled_block_reclaims_it() {
        let mut fs = fresh_fs();
        // Fill the root's first block (21 entries incl. `.`/`..`), then one
        // more to spill into a second block.
        let spill = DIR_ENTRIES_PER_SEC - 2 + 1;
        let mut last_ino = 0;
        for i in 0..spill {
            let name = alloc::format!("f{}", i);
            let root = fs.root_dir();
            let inode = fs.create_file_inode(root, &name).unwrap();
            // SAFETY: open inode.
            unsafe { last_ino = (*inode).ino };
            fs.inode_close(inode);
        }
        // SAFETY: root inode open.
        let root_blocks = unsafe { (*(*fs.root_dir()).inode).blocks };
        assert!(root_blocks[1] != 0, "second directory block expected");
        let (blocks_before, _) = bitmap_counts(&fs);

        // The spilled entry is the only one in block 1; deleting it must
        // free the block.
        let root = fs.root_dir();
        let mut io_buf = alloc::vec![0u8; 2 * SECTOR_SIZE];
        assert!(fs.delete_dir_entry(root, last_ino, &mut io_buf));
        fs.inode_release(last_ino);

        let (blocks_after, _) = bitmap_counts(&fs);
        assert_eq!(blocks_before - blocks_after, 1);
        // SAFETY: root inode open.
        unsafe { assert_eq!((*(*fs.root_dir()).inode).blocks[1], 0) };
    }
}
