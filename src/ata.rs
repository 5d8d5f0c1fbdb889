//! ATA PIO driver and partition-table scan.
//!
//! Two channels, two devices each. Every transfer takes the channel mutex,
//! programs the device/LBA registers, issues the command and then parks on
//! the channel's completion semaphore; the IRQ handler ups it. Transfers
//! are chunked at 256 sectors because the sector-count register encodes 256
//! as 0.

use core::cell::Cell;
use core::fmt::Write as _;

use arrayvec::ArrayString;
use zerocopy::FromBytes;

use crate::list::{List, ListEntry};
use crate::param::{ATA_POLL_MS, ATA_WAIT_BUDGET_MS, SECTOR_SIZE};
use crate::sync::{Mutex, Semaphore};
use crate::utils::{div_round_up, read_struct, Global};
use crate::{elem2entry, println, timer};

const CMD_IDENTIFY: u8 = 0xec;
const CMD_READ_SECTOR: u8 = 0x20;
const CMD_WRITE_SECTOR: u8 = 0x30;

bitflags::bitflags! {
    /// Status register bits.
    struct AtaStatus: u8 {
        const BSY = 0x80;
        const DRDY = 0x40;
        const DRQ = 0x08;
    }
}

/// Device register bits: the two mandatory-one bits, LBA addressing and the
/// master/slave select.
const BIT_DEV_MBS: u8 = 0xa0;
const BIT_DEV_LBA: u8 = 0x40;
const BIT_DEV_DEV: u8 = 0x10;

/// Extended-container partition type in an MBR/EBR entry.
const EXTENDED_PART_TYPE: u8 = 0x5;

/// Block-device contract the file system is written against. The ATA disk
/// is the real implementation; the tests use a memory-backed one.
/// Addresses are absolute LBAs; buffers are whole sectors.
pub trait BlockIo {
    fn read(&self, lba: u32, buf: &mut [u8]);
    fn write(&self, lba: u32, buf: &[u8]);
}

impl<T: BlockIo + ?Sized> BlockIo for &T {
    fn read(&self, lba: u32, buf: &mut [u8]) {
        (**self).read(lba, buf)
    }

    fn write(&self, lba: u32, buf: &[u8]) {
        (**self).write(lba, buf)
    }
}

pub struct IdeChannel {
    name: ArrayString<8>,
    port_base: u16,
    irq_no: u8,
    lock: Mutex<()>,
    /// Set right before a command goes out; the IRQ handler only honours
    /// interrupts it was told to expect.
    expecting_intr: Cell<bool>,
    disk_done: Semaphore,
    wait_budget_ms: Cell<u32>,
    pub devices: [Disk; 2],
}

pub struct Disk {
    name: ArrayString<8>,
    channel: *mut IdeChannel,
    dev_no: u8,
    /// User-addressable sector count from IDENTIFY.
    sectors: Cell<u32>,
    pub prim_parts: [Partition; 4],
    pub logic_parts: [Partition; 8],
}

pub struct Partition {
    pub start_lba: u32,
    pub sec_cnt: u32,
    pub disk: *mut Disk,
    pub name: ArrayString<8>,
    pub tag: ListEntry,
}

impl Partition {
    const fn zero() -> Self {
        Self {
            start_lba: 0,
            sec_cnt: 0,
            disk: core::ptr::null_mut(),
            name: ArrayString::new_const(),
            tag: ListEntry::new(),
        }
    }

    pub fn exists(&self) -> bool {
        self.sec_cnt != 0
    }
}

impl Disk {
    const fn zero() -> Self {
        Self {
            name: ArrayString::new_const(),
            channel: core::ptr::null_mut(),
            dev_no: 0,
            sectors: Cell::new(0),
            prim_parts: [const { Partition::zero() }; 4],
            logic_parts: [const { Partition::zero() }; 8],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> &IdeChannel {
        // SAFETY: back-link set at ide_init; channels are static.
        unsafe { &*self.channel }
    }

    fn reg_data(&self) -> u16 {
        self.channel().port_base
    }
    fn reg_sect_cnt(&self) -> u16 {
        self.channel().port_base + 2
    }
    fn reg_lba_l(&self) -> u16 {
        self.channel().port_base + 3
    }
    fn reg_lba_m(&self) -> u16 {
        self.channel().port_base + 4
    }
    fn reg_lba_h(&self) -> u16 {
        self.channel().port_base + 5
    }
    fn reg_dev(&self) -> u16 {
        self.channel().port_base + 6
    }
    fn reg_status(&self) -> u16 {
        self.channel().port_base + 7
    }

    /// Selects this device on its channel (master/slave, LBA mode).
    fn select_disk(&self) {
        let mut reg_device = BIT_DEV_MBS | BIT_DEV_LBA;
        if self.dev_no == 1 {
            reg_device |= BIT_DEV_DEV;
        }
        // SAFETY: channel mutex held by the caller.
        unsafe { crate::arch::outb(self.reg_dev(), reg_device) };
    }

    /// Programs start LBA and sector count. A count of 256 is written as 0.
    fn select_sector(&self, lba: u32, sec_cnt: usize) {
        debug_assert!(sec_cnt <= 256);
        // SAFETY: channel mutex held.
        unsafe {
            crate::arch::outb(self.reg_sect_cnt(), sec_cnt as u8);
            crate::arch::outb(self.reg_lba_l(), lba as u8);
            crate::arch::outb(self.reg_lba_m(), (lba >> 8) as u8);
            crate::arch::outb(self.reg_lba_h(), (lba >> 16) as u8);
            // LBA bits 24..27 ride in the low nibble of the device
            // register, so it is rewritten whole.
            crate::arch::outb(
                self.reg_dev(),
                BIT_DEV_MBS
                    | BIT_DEV_LBA
                    | if self.dev_no == 1 { BIT_DEV_DEV } else { 0 }
                    | ((lba >> 24) as u8 & 0xf),
            );
        }
    }

    fn cmd_out(&self, cmd: u8) {
        self.channel().expecting_intr.set(true);
        // SAFETY: channel mutex held.
        unsafe { crate::arch::outb(self.reg_status(), cmd) };
    }

    fn read_from_sector(&self, buf: &mut [u8], sec_cnt: usize) {
        let bytes = sec_cnt * SECTOR_SIZE;
        // SAFETY: DRQ confirmed by busy_wait; `buf` sized by the caller.
        unsafe { crate::arch::insw(self.reg_data(), buf.as_mut_ptr(), bytes / 2) };
    }

    fn write_to_sector(&self, buf: &[u8], sec_cnt: usize) {
        let bytes = sec_cnt * SECTOR_SIZE;
        // SAFETY: DRQ confirmed by busy_wait.
        unsafe { crate::arch::outsw(self.reg_data(), buf.as_ptr(), bytes / 2) };
    }

    /// Polls the status register until the device drops BSY, sleeping 10 ms
    /// between polls, bounded by the channel's wait budget. True when the
    /// device is ready to transfer data.
    fn busy_wait(&self) -> bool {
        let rounds = self.channel().wait_budget_ms.get() / ATA_POLL_MS;
        for _ in 0..rounds {
            // SAFETY: status reads are side-effect free here.
            let status = unsafe { crate::arch::inb(self.reg_status()) };
            if status & AtaStatus::BSY.bits() == 0 {
                // SAFETY: as above.
                let status = unsafe { crate::arch::inb(self.reg_status()) };
                return status & AtaStatus::DRQ.bits() != 0;
            }
            timer::msleep(ATA_POLL_MS);
        }
        false
    }

    /// IDENTIFY: prints serial, model and capacity, and remembers the
    /// sector count for bounds checks.
    fn identify(&self) {
        let channel = self.channel();
        let _guard = channel.lock.lock();

        self.select_disk();
        self.cmd_out(CMD_IDENTIFY);
        channel.disk_done.down();

        if !self.busy_wait() {
            panic!("{} identify failed", self.name);
        }
        let mut id_info = [0u8; SECTOR_SIZE];
        self.read_from_sector(&mut id_info, 1);

        // IDENTIFY strings come byte-swapped per 16-bit word.
        let mut buf = [0u8; 64];
        let sn = swap_pairs_bytes(&id_info[10 * 2..10 * 2 + 20], &mut buf);
        println!("    disk {} info:", self.name);
        println!("      SN: {}", core::str::from_utf8(sn).unwrap_or("?").trim());
        let mut buf = [0u8; 64];
        let md = swap_pairs_bytes(&id_info[27 * 2..27 * 2 + 40], &mut buf);
        println!("      MODULE: {}", core::str::from_utf8(md).unwrap_or("?").trim());

        let sectors = u32::from_le_bytes(id_info[60 * 2..60 * 2 + 4].try_into().unwrap());
        self.sectors.set(sectors);
        println!("      SECTORS: {}", sectors);
        println!("      CAPACITY: {}MB", sectors as usize * SECTOR_SIZE / 1024 / 1024);
    }
}

impl BlockIo for Disk {
    /// Reads `buf.len() / 512` sectors starting at `lba`.
    fn read(&self, lba: u32, buf: &mut [u8]) {
        assert!(buf.len() % SECTOR_SIZE == 0 && !buf.is_empty());
        let sec_cnt = buf.len() / SECTOR_SIZE;
        let max = self.sectors.get();
        assert!(max == 0 || lba as u64 + sec_cnt as u64 <= max as u64);

        let channel = self.channel();
        let _guard = channel.lock.lock();
        self.select_disk();

        let mut secs_done = 0;
        while secs_done < sec_cnt {
            let secs_op = (sec_cnt - secs_done).min(256);
            self.select_sector(lba + secs_done as u32, secs_op);
            self.cmd_out(CMD_READ_SECTOR);

            // The drive is working; sleep until its interrupt.
            channel.disk_done.down();

            if !self.busy_wait() {
                panic!("{} read sector {} failed", self.name, lba);
            }
            let off = secs_done * SECTOR_SIZE;
            self.read_from_sector(&mut buf[off..off + secs_op * SECTOR_SIZE], secs_op);
            secs_done += secs_op;
        }
    }

    /// Writes `buf.len() / 512` sectors starting at `lba`.
    fn write(&self, lba: u32, buf: &[u8]) {
        assert!(buf.len() % SECTOR_SIZE == 0 && !buf.is_empty());
        let sec_cnt = buf.len() / SECTOR_SIZE;
        let max = self.sectors.get();
        assert!(max == 0 || lba as u64 + sec_cnt as u64 <= max as u64);

        let channel = self.channel();
        let _guard = channel.lock.lock();
        self.select_disk();

        let mut secs_done = 0;
        while secs_done < sec_cnt {
            let secs_op = (sec_cnt - secs_done).min(256);
            self.select_sector(lba + secs_done as u32, secs_op);
            self.cmd_out(CMD_WRITE_SECTOR);

            // The drive must be DRQ-ready before it accepts data.
            if !self.busy_wait() {
                panic!("{} write sector {} failed", self.name, lba);
            }
            let off = secs_done * SECTOR_SIZE;
            self.write_to_sector(&buf[off..off + secs_op * SECTOR_SIZE], secs_op);

            // Now the drive is working; sleep until completion.
            channel.disk_done.down();
            secs_done += secs_op;
        }
    }
}

impl IdeChannel {
    const fn zero() -> Self {
        Self {
            name: ArrayString::new_const(),
            port_base: 0,
            irq_no: 0,
            lock: Mutex::new(()),
            expecting_intr: Cell::new(false),
            disk_done: Semaphore::new(0),
            wait_budget_ms: Cell::new(ATA_WAIT_BUDGET_MS),
            devices: [const { Disk::zero() }; 2],
        }
    }

    /// Tests dial the panic threshold down with this.
    pub fn set_wait_budget(&self, ms: u32) {
        self.wait_budget_ms.set(ms);
    }
}

static CHANNELS: Global<[IdeChannel; 2]> = Global::new([const { IdeChannel::zero() }; 2]);
static CHANNEL_CNT: Global<usize> = Global::new(0);
static PARTITION_LIST: Global<List> = Global::new(List::new());

pub fn channels() -> *mut [IdeChannel; 2] {
    CHANNELS.get()
}

/// Disk `b` of channel 0 carries the file system in the canonical setup.
pub fn disk(channel_no: usize, dev_no: usize) -> &'static Disk {
    // SAFETY: static storage; shared borrows only after ide_init.
    unsafe { &(*CHANNELS.get())[channel_no].devices[dev_no] }
}

/// Finds a scanned partition by name (`sdb1`, ...).
pub fn partition_by_name(name: &str) -> Option<&'static Partition> {
    // SAFETY: the list and its members are static after ide_init.
    unsafe {
        let hit = (*PARTITION_LIST.get()).traverse(|elem| {
            let part = elem2entry!(Partition, tag, elem);
            (*part).name.as_str() == name
        })?;
        Some(&*elem2entry!(Partition, tag, hit))
    }
}

/// ATA IRQ body (vectors 0x2e/0x2f), entered with interrupts off.
pub fn intr_hd_handler(irq_no: u8) {
    assert!(irq_no == 0x2e || irq_no == 0x2f);
    let ch_no = (irq_no - 0x2e) as usize;
    // SAFETY: only the flag and semaphore are touched; the channel mutex
    // guarantees this interrupt pairs with the most recent command.
    let channel = unsafe { &(*CHANNELS.get())[ch_no] };
    debug_assert_eq!(channel.irq_no, irq_no);
    if channel.expecting_intr.get() {
        channel.expecting_intr.set(false);
        channel.disk_done.up();
        // Reading the status register acks the device so it can raise the
        // next interrupt.
        // SAFETY: plain port read.
        let _ = unsafe { crate::arch::inb(channel.port_base + 7) };
    }
}

/// One 16-byte MBR/EBR partition-table entry.
#[derive(FromBytes, Clone, Copy)]
#[repr(C)]
pub struct PartTableEntry {
    pub bootable: u8,
    pub start_head: u8,
    pub start_sec: u8,
    pub start_chs: u8,
    pub fs_type: u8,
    pub end_head: u8,
    pub end_sec: u8,
    pub end_chs: u8,
    pub start_lba: u32,
    pub sec_cnt: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<PartTableEntry>(), 16);

/// What the recursive walk reports for each discovered partition.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PartKind {
    Primary,
    Logical,
}

struct ScanState {
    ext_lba_base: u32,
    primaries: usize,
    logicals: usize,
}

/// Recursively walks the MBR at sector 0 and every chained EBR, reporting
/// each real partition. Logical partitions' LBAs are relative to the
/// global extended base recorded on the first descent.
pub fn walk_partitions<D: BlockIo>(disk: &D, visit: &mut dyn FnMut(PartKind, u32, u32)) {
    let mut state = ScanState {
        ext_lba_base: 0,
        primaries: 0,
        logicals: 0,
    };
    scan_sector(disk, 0, &mut state, visit);
}

fn scan_sector<D: BlockIo>(
    disk: &D,
    ext_lba: u32,
    state: &mut ScanState,
    visit: &mut dyn FnMut(PartKind, u32, u32),
) {
    let mut bs = alloc::vec![0u8; SECTOR_SIZE];
    disk.read(ext_lba, &mut bs);
    assert_eq!(bs[510], 0x55, "boot sector signature");
    assert_eq!(bs[511], 0xaa, "boot sector signature");

    for part_idx in 0..4 {
        let entry: PartTableEntry = read_struct(&bs[446 + part_idx * 16..446 + (part_idx + 1) * 16]);
        if entry.fs_type == EXTENDED_PART_TYPE {
            if state.ext_lba_base != 0 {
                // Chained EBR: addresses are relative to the global base.
                scan_sector(disk, entry.start_lba + state.ext_lba_base, state, visit);
            } else {
                // First extended entry in the MBR anchors the base.
                state.ext_lba_base = entry.start_lba;
                scan_sector(disk, entry.start_lba, state, visit);
            }
        } else if entry.fs_type != 0 {
            if ext_lba == 0 {
                state.primaries += 1;
                assert!(state.primaries <= 4);
                visit(PartKind::Primary, entry.start_lba, entry.sec_cnt);
            } else {
                state.logicals += 1;
                visit(PartKind::Logical, ext_lba + entry.start_lba, entry.sec_cnt);
                if state.logicals >= 8 {
                    return;
                }
            }
        }
    }
}

/// Scans `hd` and records its partitions with synthesised names
/// (`sdX1`..`sdX4` primary, `sdX5`.. logical).
fn partition_scan(hd: *mut Disk) {
    // SAFETY: init-time exclusive access to the disk's partition arrays.
    unsafe {
        let disk_name = (*hd).name;
        let mut p_no = 0;
        let mut l_no = 0;
        walk_partitions(&*hd, &mut |kind, start_lba, sec_cnt| {
            let part: *mut Partition = match kind {
                PartKind::Primary => {
                    p_no += 1;
                    &mut (*hd).prim_parts[p_no - 1]
                }
                PartKind::Logical => {
                    l_no += 1;
                    if l_no > 8 {
                        return;
                    }
                    &mut (*hd).logic_parts[l_no - 1]
                }
            };
            (*part).start_lba = start_lba;
            (*part).sec_cnt = sec_cnt;
            (*part).disk = hd;
            let number = match kind {
                PartKind::Primary => p_no,
                PartKind::Logical => l_no + 4,
            };
            (*part).name.clear();
            let _ = write!((*part).name, "{}{}", disk_name, number);
            (*PARTITION_LIST.get()).push_back(&mut (*part).tag);
        });
    }
}

/// Swaps adjacent byte pairs, the IDENTIFY string encoding.
fn swap_pairs_bytes<'a>(src: &[u8], dst: &'a mut [u8]) -> &'a [u8] {
    let len = src.len();
    for idx in (0..len).step_by(2) {
        dst[idx] = src[idx + 1];
        dst[idx + 1] = src[idx];
    }
    &dst[..len]
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;
    use core::cell::RefCell;

    use super::*;
    use crate::param::SECTOR_SIZE;

    struct MemDisk(RefCell<Vec<u8>>);

    impl BlockIo for MemDisk {
        fn read(&self, lba: u32, buf: &mut [u8]) {
            let off = lba as usize * SECTOR_SIZE;
            buf.copy_from_slice(&self.0.borrow()[off..off + buf.len()]);
        }

        fn write(&self, lba: u32, buf: &[u8]) {
            let off = lba as usize * SECTOR_SIZE;
            self.0.borrow_mut()[off..off + buf.len()].copy_from_slice(buf);
        }
    }

    fn table_entry(fs_type: u8, start_lba: u32, sec_cnt: u32) -> [u8; 16] {
        let mut e = [0u8; 16];
        e[4] = fs_type;
        e[8..12].copy_from_slice(&start_lba.to_le_bytes());
        e[12..16].copy_from_slice(&sec_cnt.to_le_bytes());
        e
    }

    fn write_table(disk: &mut Vec<u8>, lba: u32, entries: &[[u8; 16]]) {
        let base = lba as usize * SECTOR_SIZE;
        for (idx, entry) in entries.iter().enumerate() {
            disk[base + 446 + idx * 16..base + 446 + (idx + 1) * 16].copy_from_slice(entry);
        }
        disk[base + 510] = 0x55;
        disk[base + 511] = 0xaa;
    }

    #[test]
    fn mbr_and_ebr_chain_walk() {
        let mut image = alloc::vec![0u8; 16 * 1024 * SECTOR_SIZE];
        // MBR: one primary, then the extended container at 8192.
        write_table(
            &mut image,
            0,
            &[table_entry(0x83, 2048, 4096), table_entry(0x5, 8192, 8192)],
        );
        // First EBR: a logical partition (LBA relative to this EBR) and a
        // link to the next EBR (LBA relative to the extended base).
        write_table(
            &mut image,
            8192,
            &[table_entry(0x66, 2, 2048), table_entry(0x5, 4096, 4096)],
        );
        // Second EBR: the final logical partition.
        write_table(&mut image, 8192 + 4096, &[table_entry(0x66, 2, 2048)]);

        let disk = MemDisk(RefCell::new(image));
        let mut found = Vec::new();
        walk_partitions(&disk, &mut |kind, start, cnt| found.push((kind, start, cnt)));

        assert_eq!(
            found,
            [
                (PartKind::Primary, 2048, 4096),
                (PartKind::Logical, 8194, 2048),
                (PartKind::Logical, 12290, 2048),
            ]
        );
    }

    #[test]
    fn empty_table_yields_nothing() {
        let mut image = alloc::vec![0u8; 4 * SECTOR_SIZE];
        write_table(&mut image, 0, &[]);
        let disk = MemDisk(RefCell::new(image));
        let mut count = 0;
        walk_partitions(&disk, &mut |_, _, _| count += 1);
        assert_eq!(count, 0);
    }
}

/// Probes channels and disks, identifies each device and scans partition
/// tables. The system disk (`sda`, holding the kernel image) is left
/// unscanned like the raw device it is.
pub fn ide_init() {
    println!("ide_init start");
    // SAFETY: the BIOS data area is mapped in the kernel half.
    let hd_cnt = unsafe { *(crate::memlayout::BOOT_DISK_CNT as *const u8) } as usize;
    assert!(hd_cnt > 0);
    let channel_cnt = div_round_up(hd_cnt, 2).min(2);

    // SAFETY: single-threaded init.
    unsafe {
        (*PARTITION_LIST.get()).init();
        *CHANNEL_CNT.get() = channel_cnt;

        for channel_no in 0..channel_cnt {
            let channel = &mut (*CHANNELS.get())[channel_no];
            channel.name.clear();
            let _ = write!(channel.name, "ide{}", channel_no);
            match channel_no {
                0 => {
                    channel.port_base = 0x1f0;
                    channel.irq_no = 0x20 + 14;
                }
                _ => {
                    channel.port_base = 0x170;
                    channel.irq_no = 0x20 + 15;
                }
            }
            channel.expecting_intr.set(false);

            for dev_no in 0..2 {
                let channel_ptr: *mut IdeChannel = channel;
                let hd: *mut Disk = &mut channel.devices[dev_no];
                (*hd).channel = channel_ptr;
                (*hd).dev_no = dev_no as u8;
                (*hd).name.clear();
                let _ = write!((*hd).name, "sd{}", (b'a' + (channel_no * 2 + dev_no) as u8) as char);
                (*hd).identify();
                if dev_no != 0 {
                    partition_scan(hd);
                }
            }
        }

        println!("   all partition info");
        let _ = (*PARTITION_LIST.get()).traverse(|elem| {
            let part = elem2entry!(Partition, tag, elem);
            println!(
                "   {} start_lba:{:#x}, sec_cnt:{:#x}",
                (*part).name,
                (*part).start_lba,
                (*part).sec_cnt
            );
            false
        });
    }
    println!("ide_init done");
}
