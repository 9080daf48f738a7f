//! Volume formatter.
//!
//! Lays down a fresh FAT32 image: boot sector at LBA 0 with its backup at
//! LBA 6, FSInfo at LBA 1 (copied at 7), both FATs zeroed with the
//! reserved head entries written, and a pre-seeded top-level directory
//! occupying cluster 3 next to the root at cluster 2.
//!
//! The FAT size must satisfy `fat_size * bytes_per_sector >= 4 * clusters`
//! counting the two reserved entries; the fixed point is reached by
//! recomputing the data region after each estimate.

use alloc::sync::Arc;
use alloc::vec;
use log::info;

use crate::bpb::{BiosParameterBlock, FsInfo};
use crate::device::{BlockDevice, Disk};
use crate::entry::ShortDirEntry;
use crate::name::short_name_format;
use crate::{write_le_u32, Error, ATTR_DIRECTORY, DIRENT_SIZE, END_OF_CHAIN, SPACE};

/// Reserved sector count for FAT32 volumes.
const RESERVED_SECTORS: u16 = 32;
const FAT_COUNT: u8 = 2;
const BACKUP_BOOT_SECTOR: u16 = 6;
const FSINFO_SECTOR: u16 = 1;
/// Name of the directory pre-seeded at cluster 3.
const SEED_DIR_NAME: &str = "DATA";

const GIB: u64 = 1024 * 1024 * 1024;

/// Sectors per cluster by capacity band. Bands follow the SD card
/// convention: 4 KiB clusters up to 8 GiB, then doubling.
fn sectors_per_cluster(capacity_bytes: u64) -> Result<u8, Error> {
    match capacity_bytes {
        c if c < 2 * GIB => Err(Error::InvalidArgument),
        c if c <= 8 * GIB => Ok(8),
        c if c <= 16 * GIB => Ok(16),
        c if c <= 32 * GIB => Ok(32),
        _ => Err(Error::InvalidArgument),
    }
}

/// Write a fresh FAT32 layout onto `device` for a volume of
/// `capacity_bytes`. Every step propagates device errors unmodified.
pub fn format(device: Arc<dyn BlockDevice>, capacity_bytes: u64) -> Result<(), Error> {
    let disk = Disk::new(device)?;
    let bytes_per_sector = disk.block_size();

    let spc = sectors_per_cluster(capacity_bytes)? as u32;
    let total_sectors = (capacity_bytes / bytes_per_sector as u64) as u32;
    let reserved = RESERVED_SECTORS as u32;

    // Fixed-point iteration for the FAT size: each estimate changes the
    // data region, which changes the entry count the FAT must cover.
    let mut fat_size = 1u32;
    loop {
        let data_sectors = total_sectors - reserved - FAT_COUNT as u32 * fat_size;
        let clusters = data_sectors / spc;
        let entry_bytes = (clusters as u64 + 2) * 4;
        let needed = ((entry_bytes + bytes_per_sector as u64 - 1) / bytes_per_sector as u64) as u32;
        if fat_size >= needed {
            break;
        }
        fat_size = needed;
    }

    info!(
        "formatting: {} sectors, {} sectors/cluster, FAT of {} sectors",
        total_sectors, spc, fat_size
    );

    // Erase the reserved region and both FATs before laying anything down.
    disk.erase_sectors(0, (reserved + FAT_COUNT as u32 * fat_size) as usize, bytes_per_sector)?;

    let volume_id = disk
        .datetime()
        .map(|dt| {
            let (date, time) = dt.to_fat();
            ((date as u32) << 16) | time as u32
        })
        .unwrap_or(0);

    let mut label = [SPACE; 11];
    label[..7].copy_from_slice(b"NO NAME");

    let bpb = BiosParameterBlock {
        jmp_boot: [0xEB, 0x58, 0x90],
        oem_name: *b"MSWIN4.1",
        bytes_per_sector: bytes_per_sector as u16,
        sectors_per_cluster: spc as u8,
        reserved_sectors: RESERVED_SECTORS,
        fat_count: FAT_COUNT,
        root_entry_count: 0,
        total_sectors_16: 0,
        media: 0xF8,
        fat_size_16: 0,
        sectors_per_track: 0,
        head_count: 0,
        hidden_sectors: 0,
        total_sectors_32: total_sectors,
        fat_size_32: fat_size,
        ext_flags: 0,
        fs_version: 0,
        root_cluster: 2,
        fsinfo_sector: FSINFO_SECTOR,
        backup_boot_sector: BACKUP_BOOT_SECTOR,
        reserved: [0; 12],
        drive_number: 0x80,
        nt_reserved: 0,
        boot_signature: 0x29,
        volume_id,
        volume_label: label,
        fs_type: *b"FAT32   ",
    };

    let mut sector = vec![0u8; bytes_per_sector];
    bpb.serialize(&mut sector);
    disk.write_sectors(&sector, 0, bytes_per_sector)?;
    disk.write_sectors(&sector, BACKUP_BOOT_SECTOR as u32, bytes_per_sector)?;

    // Data clusters of the final geometry; clusters 2 (root) and 3 (seed
    // directory) are taken immediately.
    let data_sectors = total_sectors - reserved - FAT_COUNT as u32 * fat_size;
    let free_clusters = data_sectors / spc - 2;

    sector.fill(0);
    let fsinfo = FsInfo::with_hints(free_clusters, 4);
    fsinfo.serialize(&mut sector);
    disk.write_sectors(&sector, FSINFO_SECTOR as u32, bytes_per_sector)?;
    disk.write_sectors(&sector, BACKUP_BOOT_SECTOR as u32 + 1, bytes_per_sector)?;

    // Head of each FAT: media entry, clean-shutdown entry, then the two
    // seeded end-of-chain entries for the root and the seed directory.
    sector.fill(0);
    write_le_u32(&mut sector[0..], 0x0FFFFFF8);
    write_le_u32(&mut sector[4..], 0x0FFFFFFF);
    write_le_u32(&mut sector[8..], END_OF_CHAIN);
    write_le_u32(&mut sector[12..], END_OF_CHAIN);
    let fat1_lba = reserved;
    let fat2_lba = reserved + fat_size;
    disk.write_sectors(&sector, fat1_lba, bytes_per_sector)?;
    disk.write_sectors(&sector, fat2_lba, bytes_per_sector)?;

    // Root directory cluster (2): zeroed, then one entry for the seed
    // directory. The root itself carries no "." or "..".
    let data_lba = reserved + FAT_COUNT as u32 * fat_size;
    disk.erase_sectors(data_lba, spc as usize * 2, bytes_per_sector)?;

    let now = disk.datetime();
    let mut seed = ShortDirEntry::new(short_name_format(SEED_DIR_NAME), ATTR_DIRECTORY, 3);
    seed.stamp_created(now);
    sector.fill(0);
    sector[..DIRENT_SIZE].copy_from_slice(&seed.serialize());
    disk.write_sectors(&sector, data_lba, bytes_per_sector)?;

    // Seed directory cluster (3): the standard "." and ".." pair, the
    // parent link recorded as 0 because the parent is the root.
    let mut dot_name = [SPACE; 11];
    dot_name[0] = b'.';
    let mut dot = ShortDirEntry::new(dot_name, ATTR_DIRECTORY, 3);
    dot.stamp_created(now);
    let mut dotdot_name = [SPACE; 11];
    dotdot_name[0] = b'.';
    dotdot_name[1] = b'.';
    let mut dotdot = ShortDirEntry::new(dotdot_name, ATTR_DIRECTORY, 0);
    dotdot.stamp_created(now);

    sector.fill(0);
    sector[..DIRENT_SIZE].copy_from_slice(&dot.serialize());
    sector[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(&dotdot.serialize());
    disk.write_sectors(&sector, data_lba + spc, bytes_per_sector)?;

    info!("format complete, {} clusters free", free_clusters);
    Ok(())
}
