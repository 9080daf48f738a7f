//! 32-byte FAT directory entries.
//!
//! Special notes about the first byte (DIR_Name[0]) of a FAT directory
//! entry:
//! - If DIR_Name[0] == 0xE5, the directory entry is free (there is no file
//!   or directory name in this entry).
//! - If DIR_Name[0] == 0x00, the directory entry is free and there are no
//!   allocated directory entries after this one; the rest of the entries
//!   in this directory do not need to be examined.
//!
//! A set of long entries is always associated with a short entry that they
//! always immediately precede and are physically contiguous with. Every
//! member of a set of long entries is uniquely numbered and the last
//! member of the set is or'd with LAST_LONG_ENTRY. An 8-bit checksum over
//! the 11 short-name bytes is placed in every long entry; a mismatch makes
//! the long entries orphans.
//!
//! Everything here is parsed from and serialized to `[u8; 32]` with
//! explicit little-endian accesses.

use alloc::string::String;

use crate::time::DateTime;
use crate::{
    read_le_u16, read_le_u32, write_le_u16, write_le_u32, ATTR_DIRECTORY, ATTR_LONG_NAME,
    ATTR_VOLUME_ID, DIRENT_SIZE, DIR_ENTRY_LAST_AND_UNUSED, DIR_ENTRY_UNUSED, LAST_LONG_ENTRY,
    LONG_NAME_LEN, SPACE,
};

/// The unique on-disk address of one 32-byte entry: the cluster it lives
/// in, the sector within that cluster and the byte offset within that
/// sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryPos {
    pub cluster: u32,
    pub sector: u32,
    pub offset: usize,
}

impl DirEntryPos {
    pub fn new(cluster: u32, sector: u32, offset: usize) -> Self {
        Self {
            cluster,
            sector,
            offset,
        }
    }
}

/// Short (8.3) directory entry.
#[derive(Debug, Clone, Copy)]
pub struct ShortDirEntry {
    /// 8-byte base, space padded, uppercase.    Offset: 0x00
    pub name: [u8; 8],
    /// 3-byte extension, space padded.    Offset: 0x08
    pub extension: [u8; 3],
    /// Attribute byte; 0x0F here marks a long entry instead.    Offset: 0x0B
    pub attr: u8,
    /// Reserved for Windows NT, kept as read.    Offset: 0x0C
    pub nt_reserved: u8,
    /// Tenths of a second of the creation time, 0..199.    Offset: 0x0D
    pub crt_time_tenth: u8,
    /// Creation time, 2-second granularity.    Offset: 0x0E
    pub crt_time: u16,
    /// Creation date.    Offset: 0x10
    pub crt_date: u16,
    /// Last access date; set to the write date on writes.    Offset: 0x12
    pub acc_date: u16,
    /// High word of the first cluster number.    Offset: 0x14
    pub first_cluster_hi: u16,
    /// Last write time.    Offset: 0x16
    pub wrt_time: u16,
    /// Last write date.    Offset: 0x18
    pub wrt_date: u16,
    /// Low word of the first cluster number.    Offset: 0x1A
    pub first_cluster_lo: u16,
    /// File size in bytes; always 0 for directories (directories are
    /// sized by following their cluster chain to the EOC mark).    Offset: 0x1C
    pub file_size: u32,
}

impl ShortDirEntry {
    pub fn new(name11: [u8; 11], attr: u8, first_cluster: u32) -> Self {
        let mut entry = Self {
            name: [SPACE; 8],
            extension: [SPACE; 3],
            attr,
            nt_reserved: 0,
            crt_time_tenth: 0,
            crt_time: 0,
            crt_date: 0,
            acc_date: 0,
            first_cluster_hi: 0,
            wrt_time: 0,
            wrt_date: 0,
            first_cluster_lo: 0,
            file_size: 0,
        };
        entry.name.copy_from_slice(&name11[..8]);
        entry.extension.copy_from_slice(&name11[8..]);
        entry.set_first_cluster(first_cluster);
        entry
    }

    pub fn parse(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= DIRENT_SIZE);
        Self {
            name: buf[0..8].try_into().unwrap(),
            extension: buf[8..11].try_into().unwrap(),
            attr: buf[11],
            nt_reserved: buf[12],
            crt_time_tenth: buf[13],
            crt_time: read_le_u16(&buf[14..]),
            crt_date: read_le_u16(&buf[16..]),
            acc_date: read_le_u16(&buf[18..]),
            first_cluster_hi: read_le_u16(&buf[20..]),
            wrt_time: read_le_u16(&buf[22..]),
            wrt_date: read_le_u16(&buf[24..]),
            first_cluster_lo: read_le_u16(&buf[26..]),
            file_size: read_le_u32(&buf[28..]),
        }
    }

    pub fn serialize(&self) -> [u8; DIRENT_SIZE] {
        let mut buf = [0u8; DIRENT_SIZE];
        buf[0..8].copy_from_slice(&self.name);
        buf[8..11].copy_from_slice(&self.extension);
        buf[11] = self.attr;
        buf[12] = self.nt_reserved;
        buf[13] = self.crt_time_tenth;
        write_le_u16(&mut buf[14..], self.crt_time);
        write_le_u16(&mut buf[16..], self.crt_date);
        write_le_u16(&mut buf[18..], self.acc_date);
        write_le_u16(&mut buf[20..], self.first_cluster_hi);
        write_le_u16(&mut buf[22..], self.wrt_time);
        write_le_u16(&mut buf[24..], self.wrt_date);
        write_le_u16(&mut buf[26..], self.first_cluster_lo);
        write_le_u32(&mut buf[28..], self.file_size);
        buf
    }

    pub fn first_cluster(&self) -> u32 {
        ((self.first_cluster_hi as u32) << 16) | self.first_cluster_lo as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster_hi = (cluster >> 16) as u16;
        self.first_cluster_lo = (cluster & 0xFFFF) as u16;
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attr & ATTR_VOLUME_ID != 0 && self.attr != ATTR_LONG_NAME
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == DIR_ENTRY_UNUSED
    }

    /// Never-used terminator entry.
    pub fn is_end(&self) -> bool {
        self.name[0] == DIR_ENTRY_LAST_AND_UNUSED
    }

    /// The 11 name bytes as stored, for checksum and raw comparison.
    pub fn name_bytes(&self) -> [u8; 11] {
        let mut out = [0u8; 11];
        out[..8].copy_from_slice(&self.name);
        out[8..].copy_from_slice(&self.extension);
        out
    }

    /// Display form: trailing spaces trimmed and the implied dot restored.
    pub fn display_name(&self) -> String {
        let mut out = String::new();
        for &b in self.name.iter() {
            if b == SPACE {
                break;
            }
            out.push(b as char);
        }
        if self.extension[0] != SPACE {
            out.push('.');
            for &b in self.extension.iter() {
                if b == SPACE {
                    break;
                }
                out.push(b as char);
            }
        }
        out
    }

    pub fn is_dot(&self) -> bool {
        self.name[0] == b'.' && self.name[1] == SPACE
    }

    pub fn is_dot_dot(&self) -> bool {
        self.name[0] == b'.' && self.name[1] == b'.' && self.name[2] == SPACE
    }

    pub fn mark_deleted(&mut self) {
        self.name[0] = DIR_ENTRY_UNUSED;
    }

    /// Stamp creation, write and access fields from one clock sample.
    pub fn stamp_created(&mut self, dt: Option<DateTime>) {
        let (date, time) = dt.map(|d| d.to_fat()).unwrap_or((0, 0));
        self.crt_time = time;
        self.crt_date = date;
        self.wrt_time = time;
        self.wrt_date = date;
        self.acc_date = date;
    }

    /// Stamp the last-write fields; file creation is considered a write.
    pub fn stamp_written(&mut self, dt: Option<DateTime>) {
        let (date, time) = dt.map(|d| d.to_fat()).unwrap_or((0, 0));
        self.wrt_time = time;
        self.wrt_date = date;
        self.acc_date = date;
    }
}

/// Long directory entry: 13 UTF-16LE characters of the name plus the
/// linkage fields binding it to the trailing short entry.
#[derive(Debug, Clone, Copy)]
pub struct LongDirEntry {
    /// 1-based order in the set, LAST_LONG_ENTRY or'd into the last
    /// physically-first member.    Offset: 0x00
    pub order: u8,
    /// Characters 1-5.    Offset: 0x01
    pub name1: [u16; 5],
    /// Must be ATTR_LONG_NAME.    Offset: 0x0B
    pub attr: u8,
    /// Zero: sub-component of a long name.    Offset: 0x0C
    pub entry_type: u8,
    /// Checksum of the trailing short name.    Offset: 0x0D
    pub checksum: u8,
    /// Characters 6-11.    Offset: 0x0E
    pub name2: [u16; 6],
    /// Must be zero for compatibility with existing disk utilities.    Offset: 0x1A
    pub first_cluster_lo: u16,
    /// Characters 12-13.    Offset: 0x1C
    pub name3: [u16; 2],
}

impl LongDirEntry {
    /// Build one slot. `sequence` is the 1-based logical index, `last`
    /// tags the final (physically first) member of the set.
    pub fn new(sequence: u8, last: bool, units: &[u16; LONG_NAME_LEN], checksum: u8) -> Self {
        let mut name1 = [0u16; 5];
        let mut name2 = [0u16; 6];
        let mut name3 = [0u16; 2];
        name1.copy_from_slice(&units[0..5]);
        name2.copy_from_slice(&units[5..11]);
        name3.copy_from_slice(&units[11..13]);
        Self {
            order: if last {
                sequence | LAST_LONG_ENTRY
            } else {
                sequence
            },
            name1,
            attr: ATTR_LONG_NAME,
            entry_type: 0,
            checksum,
            name2,
            first_cluster_lo: 0,
            name3,
        }
    }

    pub fn parse(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= DIRENT_SIZE);
        let mut name1 = [0u16; 5];
        let mut name2 = [0u16; 6];
        let mut name3 = [0u16; 2];
        for (i, unit) in name1.iter_mut().enumerate() {
            *unit = read_le_u16(&buf[1 + i * 2..]);
        }
        for (i, unit) in name2.iter_mut().enumerate() {
            *unit = read_le_u16(&buf[14 + i * 2..]);
        }
        for (i, unit) in name3.iter_mut().enumerate() {
            *unit = read_le_u16(&buf[28 + i * 2..]);
        }
        Self {
            order: buf[0],
            name1,
            attr: buf[11],
            entry_type: buf[12],
            checksum: buf[13],
            name2,
            first_cluster_lo: read_le_u16(&buf[26..]),
            name3,
        }
    }

    pub fn serialize(&self) -> [u8; DIRENT_SIZE] {
        let mut buf = [0u8; DIRENT_SIZE];
        buf[0] = self.order;
        for (i, unit) in self.name1.iter().enumerate() {
            write_le_u16(&mut buf[1 + i * 2..], *unit);
        }
        buf[11] = self.attr;
        buf[12] = self.entry_type;
        buf[13] = self.checksum;
        for (i, unit) in self.name2.iter().enumerate() {
            write_le_u16(&mut buf[14 + i * 2..], *unit);
        }
        write_le_u16(&mut buf[26..], self.first_cluster_lo);
        for (i, unit) in self.name3.iter().enumerate() {
            write_le_u16(&mut buf[28 + i * 2..], *unit);
        }
        buf
    }

    /// 1-based position in the set with the terminal flag stripped.
    pub fn sequence(&self) -> u8 {
        self.order & (LAST_LONG_ENTRY - 1)
    }

    pub fn is_last_in_set(&self) -> bool {
        self.order & LAST_LONG_ENTRY != 0
    }

    /// All 13 UTF-16 units of this slot in name order.
    pub fn name_units(&self) -> [u16; LONG_NAME_LEN] {
        let mut out = [0u16; LONG_NAME_LEN];
        out[0..5].copy_from_slice(&self.name1);
        out[5..11].copy_from_slice(&self.name2);
        out[11..13].copy_from_slice(&self.name3);
        out
    }
}

/// Attribute test shared by the directory scanner: a long entry is any
/// slot whose attribute byte carries the composite 0x0F.
pub fn is_long_entry(raw: &[u8]) -> bool {
    raw[11] & 0x3F == ATTR_LONG_NAME
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::{sfn_checksum, short_name_format};

    #[test]
    fn short_entry_codec_preserves_fields() {
        let mut entry = ShortDirEntry::new(short_name_format("NOTES.TXT"), crate::ATTR_ARCHIVE, 0x12345);
        entry.file_size = 14;
        entry.wrt_time = 0x4A2D;
        entry.wrt_date = 0x5B21;

        let parsed = ShortDirEntry::parse(&entry.serialize());
        assert_eq!(parsed.name_bytes(), entry.name_bytes());
        assert_eq!(parsed.first_cluster(), 0x12345);
        assert_eq!(parsed.file_size, 14);
        assert_eq!(parsed.wrt_time, 0x4A2D);
        assert_eq!(parsed.display_name(), "NOTES.TXT");
    }

    #[test]
    fn first_cluster_splits_into_hi_lo() {
        let entry = ShortDirEntry::new(short_name_format("A.TXT"), crate::ATTR_ARCHIVE, 0x0012_0034);
        assert_eq!(entry.first_cluster_hi, 0x0012);
        assert_eq!(entry.first_cluster_lo, 0x0034);
        let raw = entry.serialize();
        assert_eq!(read_le_u16(&raw[20..]), 0x0012);
        assert_eq!(read_le_u16(&raw[26..]), 0x0034);
    }

    #[test]
    fn long_entry_units_land_in_disk_order() {
        let units: [u16; LONG_NAME_LEN] = core::array::from_fn(|i| 0x41 + i as u16);
        let checksum = sfn_checksum(&short_name_format("LONGNA~1.TXT"));
        let lde = LongDirEntry::new(2, true, &units, checksum);
        let raw = lde.serialize();

        assert_eq!(raw[0], 2 | LAST_LONG_ENTRY);
        assert_eq!(raw[11], ATTR_LONG_NAME);
        assert_eq!(raw[13], checksum);
        // char 1 at offset 1, char 6 at offset 14, char 12 at offset 28
        assert_eq!(read_le_u16(&raw[1..]), 0x41);
        assert_eq!(read_le_u16(&raw[14..]), 0x46);
        assert_eq!(read_le_u16(&raw[28..]), 0x4C);
        assert_eq!(read_le_u16(&raw[26..]), 0); // first cluster low

        let parsed = LongDirEntry::parse(&raw);
        assert_eq!(parsed.name_units(), units);
        assert_eq!(parsed.sequence(), 2);
        assert!(parsed.is_last_in_set());
    }
}
