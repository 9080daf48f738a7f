//! BIOS Parameter Block (BPB), FSInfo sector and the mounted layout.
//!
//! The first important data structure on a FAT volume is the BPB, located
//! in the first sector of the volume in the Reserved Region. This sector is
//! sometimes called the "boot sector" or the "0th sector"; the important
//! fact is simply that it is the first sector of the volume. A complete
//! backup copy lives at the sector recorded in `bk_boot_sec` (always 6).
//!
//! A FAT32 FAT entry is actually only a 28-bit entry. The high 4 bits of a
//! FAT32 FAT entry are reserved. The only time the high 4 bits should ever
//! be changed is when the volume is formatted, at which time the whole
//! 32-bit entry is zeroed, including the high 4 bits.
//!
//! Given any valid cluster number N, where in the FAT(s) is the entry for
//! that cluster number?
//!
//! ```text
//! FATOffset = N * 4;
//! ThisFATSecNum = BPB_ResvdSecCnt + (FATOffset / BPB_BytsPerSec);
//! ThisFATEntOffset = REM(FATOffset / BPB_BytsPerSec);
//! ```
//!
//! All multi-byte fields are little-endian on disk. This module parses
//! them from owned byte buffers with explicit reads; no struct overlay,
//! no reliance on host layout or alignment.

use crate::fs::MountError;
use crate::{
    read_le_u16, read_le_u32, write_le_u16, write_le_u32, BOOT_SIGNATURE, LEAD_SIGNATURE,
    MIN_BLOCK_SIZE, STRUCT_SIGNATURE, TRAIL_SIGNATURE,
};

/// Boot Sector and BPB for FAT32, one record per field of the on-disk
/// layout. Offsets below are bytes from the start of the sector.
#[derive(Debug, Clone, Copy)]
pub struct BiosParameterBlock {
    /// Jump and NOP instructions    Size: 3 bytes    Offset: 0x00
    pub jmp_boot: [u8; 3],
    /// OEM name, a name string only    Size: 8 bytes    Offset: 0x03
    pub oem_name: [u8; 8],
    /// Bytes per sector: 512, 1024, 2048 or 4096    Offset: 0x0B
    pub bytes_per_sector: u16,
    /// Sectors per allocation unit, a power of two. A value that makes
    /// "bytes per cluster" exceed 32K should never be used.    Offset: 0x0D
    pub sectors_per_cluster: u8,
    /// Sectors in the Reserved Region, typically 32 for FAT32.    Offset: 0x0E
    pub reserved_sectors: u16,
    /// Count of FATs, always 2.    Offset: 0x10
    pub fat_count: u8,
    /// Root entry count, must be 0 for FAT32.    Offset: 0x11
    pub root_entry_count: u16,
    /// 16-bit total sectors, must be 0 for FAT32.    Offset: 0x13
    pub total_sectors_16: u16,
    /// Media descriptor, 0xF8 for fixed media. Whatever value is put here
    /// must also be put in the low byte of the FAT[0] entry.    Offset: 0x15
    pub media: u8,
    /// 16-bit FAT size, must be 0 on FAT32 (fat_size_32 holds it).    Offset: 0x16
    pub fat_size_16: u16,
    /// CHS geometry for interrupt 0x13, irrelevant on SD.    Offset: 0x18
    pub sectors_per_track: u16,
    /// Offset: 0x1A
    pub head_count: u16,
    /// Hidden sectors preceding the partition.    Offset: 0x1C
    pub hidden_sectors: u32,
    /// 32-bit total count of sectors, all four regions. Non-zero.    Offset: 0x20
    pub total_sectors_32: u32,
    /// 32-bit count of sectors occupied by ONE FAT.    Offset: 0x24
    pub fat_size_32: u32,
    /// Bit 7 = 0 means the FAT is mirrored at runtime into all FATs.    Offset: 0x28
    pub ext_flags: u16,
    /// FAT32 version, 0:0.    Offset: 0x2A
    pub fs_version: u16,
    /// First cluster of the root directory, usually 2.    Offset: 0x2C
    pub root_cluster: u32,
    /// Sector number of the FSINFO structure, usually 1.    Offset: 0x30
    pub fsinfo_sector: u16,
    /// Sector number of the boot record copy, always 6.    Offset: 0x32
    pub backup_boot_sector: u16,
    /// Reserved, zero.    Offset: 0x34
    pub reserved: [u8; 12],
    /// INT 13h drive number.    Offset: 0x40
    pub drive_number: u8,
    /// Reserved (used by Windows NT).    Offset: 0x41
    pub nt_reserved: u8,
    /// Extended boot signature 0x29: the three fields below are present.    Offset: 0x42
    pub boot_signature: u8,
    /// Volume serial number.    Offset: 0x43
    pub volume_id: u32,
    /// Volume label, 11 bytes space padded.    Offset: 0x47
    pub volume_label: [u8; 11],
    /// "FAT32   ", informational only.    Offset: 0x52
    pub fs_type: [u8; 8],
}

impl BiosParameterBlock {
    /// Parse the boot sector. `buf` holds at least the first 512 bytes.
    pub fn parse(buf: &[u8]) -> Result<Self, MountError> {
        if buf.len() < MIN_BLOCK_SIZE {
            return Err(MountError::InvalidBootRecord);
        }
        if read_le_u16(&buf[510..]) != BOOT_SIGNATURE {
            return Err(MountError::InvalidBootRecord);
        }

        let bpb = Self {
            jmp_boot: [buf[0], buf[1], buf[2]],
            oem_name: buf[3..11].try_into().unwrap(),
            bytes_per_sector: read_le_u16(&buf[11..]),
            sectors_per_cluster: buf[13],
            reserved_sectors: read_le_u16(&buf[14..]),
            fat_count: buf[16],
            root_entry_count: read_le_u16(&buf[17..]),
            total_sectors_16: read_le_u16(&buf[19..]),
            media: buf[21],
            fat_size_16: read_le_u16(&buf[22..]),
            sectors_per_track: read_le_u16(&buf[24..]),
            head_count: read_le_u16(&buf[26..]),
            hidden_sectors: read_le_u32(&buf[28..]),
            total_sectors_32: read_le_u32(&buf[32..]),
            fat_size_32: read_le_u32(&buf[36..]),
            ext_flags: read_le_u16(&buf[40..]),
            fs_version: read_le_u16(&buf[42..]),
            root_cluster: read_le_u32(&buf[44..]),
            fsinfo_sector: read_le_u16(&buf[48..]),
            backup_boot_sector: read_le_u16(&buf[50..]),
            reserved: buf[52..64].try_into().unwrap(),
            drive_number: buf[64],
            nt_reserved: buf[65],
            boot_signature: buf[66],
            volume_id: read_le_u32(&buf[67..]),
            volume_label: buf[71..82].try_into().unwrap(),
            fs_type: buf[82..90].try_into().unwrap(),
        };

        bpb.validate()?;
        Ok(bpb)
    }

    /// Serialize into a sector-sized buffer (zeroed by the caller).
    pub fn serialize(&self, buf: &mut [u8]) {
        buf[0..3].copy_from_slice(&self.jmp_boot);
        buf[3..11].copy_from_slice(&self.oem_name);
        write_le_u16(&mut buf[11..], self.bytes_per_sector);
        buf[13] = self.sectors_per_cluster;
        write_le_u16(&mut buf[14..], self.reserved_sectors);
        buf[16] = self.fat_count;
        write_le_u16(&mut buf[17..], self.root_entry_count);
        write_le_u16(&mut buf[19..], self.total_sectors_16);
        buf[21] = self.media;
        write_le_u16(&mut buf[22..], self.fat_size_16);
        write_le_u16(&mut buf[24..], self.sectors_per_track);
        write_le_u16(&mut buf[26..], self.head_count);
        write_le_u32(&mut buf[28..], self.hidden_sectors);
        write_le_u32(&mut buf[32..], self.total_sectors_32);
        write_le_u32(&mut buf[36..], self.fat_size_32);
        write_le_u16(&mut buf[40..], self.ext_flags);
        write_le_u16(&mut buf[42..], self.fs_version);
        write_le_u32(&mut buf[44..], self.root_cluster);
        write_le_u16(&mut buf[48..], self.fsinfo_sector);
        write_le_u16(&mut buf[50..], self.backup_boot_sector);
        buf[52..64].copy_from_slice(&self.reserved);
        buf[64] = self.drive_number;
        buf[65] = self.nt_reserved;
        buf[66] = self.boot_signature;
        write_le_u32(&mut buf[67..], self.volume_id);
        buf[71..82].copy_from_slice(&self.volume_label);
        buf[82..90].copy_from_slice(&self.fs_type);
        write_le_u16(&mut buf[510..], crate::BOOT_SIGNATURE);
    }

    /// The one and only way the FAT type is determined is the cluster
    /// count; the checks below reject every layout that cannot be a
    /// FAT32 volume before any arithmetic runs on it.
    fn validate(&self) -> Result<(), MountError> {
        if self.bytes_per_sector < MIN_BLOCK_SIZE as u16
            || !self.bytes_per_sector.is_power_of_two()
        {
            return Err(MountError::InvalidBootRecord);
        }
        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            return Err(MountError::InvalidBootRecord);
        }
        if self.reserved_sectors == 0 || self.fat_count == 0 || self.total_sectors_32 == 0 {
            return Err(MountError::InvalidBootRecord);
        }
        // FAT32 markers: the 16-bit counts must be zero and the 32-bit FAT
        // size non-zero, else the volume is FAT12/16 or damaged.
        if self.fat_size_16 != 0
            || self.root_entry_count != 0
            || self.total_sectors_16 != 0
            || self.fat_size_32 == 0
            || self.root_cluster < 2
        {
            return Err(MountError::NotFat32);
        }
        Ok(())
    }
}

/// FAT32 FSInfo Sector Structure.
///
/// The free count and next-free fields are hints only. The authoritative
/// free count is always recomputable by scanning the FAT; a value of
/// 0xFFFFFFFF means "unknown, must be computed".
#[derive(Debug, Clone, Copy)]
pub struct FsInfo {
    /// Lead signature 0x41615252, validates the sector.    Offset: 0
    pub lead_signature: u32,
    /// Another signature, 0x61417272, localized to the used fields.    Offset: 484
    pub struct_signature: u32,
    /// Last known free cluster count, or 0xFFFFFFFF.    Offset: 488
    pub free_count: u32,
    /// Cluster number at which the driver should start looking for free
    /// clusters, or 0xFFFFFFFF for "start at cluster 2".    Offset: 492
    pub next_free: u32,
    /// Trail signature 0xAA550000.    Offset: 508
    pub trail_signature: u32,
}

impl FsInfo {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            lead_signature: read_le_u32(&buf[0..]),
            struct_signature: read_le_u32(&buf[484..]),
            free_count: read_le_u32(&buf[488..]),
            next_free: read_le_u32(&buf[492..]),
            trail_signature: read_le_u32(&buf[508..]),
        }
    }

    pub fn serialize(&self, buf: &mut [u8]) {
        write_le_u32(&mut buf[0..], self.lead_signature);
        write_le_u32(&mut buf[484..], self.struct_signature);
        write_le_u32(&mut buf[488..], self.free_count);
        write_le_u32(&mut buf[492..], self.next_free);
        write_le_u32(&mut buf[508..], self.trail_signature);
    }

    pub fn with_hints(free_count: u32, next_free: u32) -> Self {
        Self {
            lead_signature: LEAD_SIGNATURE,
            struct_signature: STRUCT_SIGNATURE,
            free_count,
            next_free,
            trail_signature: TRAIL_SIGNATURE,
        }
    }

    pub fn signature_ok(&self) -> bool {
        self.lead_signature == LEAD_SIGNATURE
            && self.struct_signature == STRUCT_SIGNATURE
            && self.trail_signature == TRAIL_SIGNATURE
    }
}

/// Everything mount precomputes from the BPB. Read-only afterwards.
#[derive(Debug, Clone, Copy)]
pub struct FatLayout {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub cluster_bytes: u32,
    pub hidden_sectors: u32,
    pub reserved_sectors: u32,
    pub total_sectors: u32,
    pub fat_size_sectors: u32,
    pub fat_count: u32,
    /// First sector of FAT1: hidden + reserved.
    pub fat1_lba: u32,
    /// First sector of FAT2: fat1_lba + fat_size_sectors.
    pub fat2_lba: u32,
    /// First sector of the data region (first sector of cluster 2).
    pub data_lba: u32,
    pub root_cluster: u32,
    pub fsinfo_lba: u32,
    pub backup_boot_lba: u32,
    pub fat_entries_per_sector: u32,
}

impl FatLayout {
    pub fn from_bpb(bpb: &BiosParameterBlock) -> Self {
        let bytes_per_sector = bpb.bytes_per_sector as u32;
        let sectors_per_cluster = bpb.sectors_per_cluster as u32;
        let fat1_lba = bpb.hidden_sectors + bpb.reserved_sectors as u32;
        let fat2_lba = fat1_lba + bpb.fat_size_32;
        let data_lba = fat2_lba + bpb.fat_size_32;
        Self {
            bytes_per_sector,
            sectors_per_cluster,
            cluster_bytes: bytes_per_sector * sectors_per_cluster,
            hidden_sectors: bpb.hidden_sectors,
            reserved_sectors: bpb.reserved_sectors as u32,
            total_sectors: bpb.total_sectors_32,
            fat_size_sectors: bpb.fat_size_32,
            fat_count: bpb.fat_count as u32,
            fat1_lba,
            fat2_lba,
            data_lba,
            root_cluster: bpb.root_cluster,
            fsinfo_lba: bpb.hidden_sectors + bpb.fsinfo_sector as u32,
            backup_boot_lba: bpb.hidden_sectors + bpb.backup_boot_sector as u32,
            fat_entries_per_sector: bytes_per_sector / 4,
        }
    }

    /// FirstSectorofCluster = ((N - 2) * BPB_SecPerClus) + FirstDataSector
    pub fn cluster_to_lba(&self, cluster: u32) -> u32 {
        debug_assert!(cluster >= 2);
        self.data_lba + (cluster - 2) * self.sectors_per_cluster
    }

    /// Count of data clusters starting at cluster 2, rounded down.
    /// On FAT32 the root directory region is empty, so the data region is
    /// everything past the reserved sectors and the two FATs.
    pub fn data_clusters(&self) -> u32 {
        let data_sectors =
            self.total_sectors - self.reserved_sectors - self.fat_count * self.fat_size_sectors;
        data_sectors / self.sectors_per_cluster
    }

    /// The maximum valid cluster number for the volume.
    pub fn max_cluster(&self) -> u32 {
        self.data_clusters() + 1
    }
}
