//! Directory engine.
//!
//! A directory is a cluster chain of 32-byte entries. On disk a name is
//! laid out low address to high address as:
//!
//! ```text
//! lfn(n)  lfn(n-1) ... lfn(1)  sfn
//! ```
//!
//! so the long entries precede their short entry, highest order first,
//! with LAST_LONG_ENTRY or'd into the physically first one. Scanning
//! halts on the first entry whose first byte is 0x00; 0xE5 entries are
//! skipped. A long run binds to its short entry only when the orders are
//! strictly consecutive and every slot carries the checksum of the short
//! name; anything else makes the run an orphan and the short entry is
//! matched by its own 11 bytes.
//!
//! Multi-entry writes go sector by sector: read the sector, overwrite the
//! affected slots, write the sector back. A failure mid-run leaves the
//! directory inconsistent; recovering from that is a caller policy.

use alloc::string::String;
use alloc::vec::Vec;
use log::warn;

use crate::entry::{is_long_entry, DirEntryPos, LongDirEntry, ShortDirEntry};
use crate::fs::FileSystem;
use crate::name::{
    self, classify, decode_lfn_units, derive_sfn, encode_lfn_slots, names_equal, sfn_checksum,
    short_name_format, NameKind,
};
use crate::{
    is_end_of_chain, Error, ATTR_ARCHIVE, ATTR_DIRECTORY, DIRENT_SIZE, DIR_ENTRY_LAST_AND_UNUSED,
    DIR_ENTRY_UNUSED, LONG_NAME_LEN, SPACE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirError {
    FileNotFound,
    DirNotFound,
    /// Generic not-found for callers that do not care about the kind.
    NotFound,
    EntryNotFound,
    /// A long-name run with a gap, a bad checksum or a 0x00 terminator
    /// inside it.
    EntryCorrupted,
    /// Free-run search failed and the directory could not grow.
    NoFreeEntries,
    CreateFailed,
    DeleteFailed,
    DeleteProtected,
    DirNotEmpty,
    IsDirectory,
    NotADirectory,
}

/// A located directory entry: the short entry, its position and the
/// positions of the long-name run bound to it (empty when the name was
/// matched by the short entry alone).
#[derive(Debug, Clone)]
pub struct FoundEntry {
    pub sde: ShortDirEntry,
    pub pos: DirEntryPos,
    pub lfn_pos: Vec<DirEntryPos>,
    pub name: String,
}

/// Walks the 32-byte slots of a directory chain, yielding each slot with
/// its position. One sector is held in memory at a time.
struct DirCursor<'a> {
    fs: &'a FileSystem,
    cluster: u32,
    sector: u32,
    slot: usize,
    buf: Vec<u8>,
    loaded: bool,
    finished: bool,
}

impl<'a> DirCursor<'a> {
    fn new(fs: &'a FileSystem, dir_cluster: u32) -> Self {
        Self {
            fs,
            cluster: dir_cluster,
            sector: 0,
            slot: 0,
            buf: fs.sector_buf(),
            loaded: false,
            finished: false,
        }
    }

    fn slots_per_sector(&self) -> usize {
        self.fs.sector_bytes() / DIRENT_SIZE
    }

    /// Next slot, or `None` when the chain is exhausted.
    fn next(&mut self) -> Result<Option<(DirEntryPos, [u8; DIRENT_SIZE])>, Error> {
        if self.finished {
            return Ok(None);
        }
        if self.slot == self.slots_per_sector() {
            self.slot = 0;
            self.sector += 1;
            self.loaded = false;
        }
        if self.sector == self.fs.layout.sectors_per_cluster {
            let next = self.fs.fat.read().get_next(self.cluster)?;
            if is_end_of_chain(next) {
                self.finished = true;
                return Ok(None);
            }
            self.cluster = next;
            self.sector = 0;
            self.loaded = false;
        }
        if !self.loaded {
            let lba = self.fs.layout.cluster_to_lba(self.cluster) + self.sector;
            self.fs.read_sector(lba, &mut self.buf)?;
            self.loaded = true;
        }

        let pos = DirEntryPos::new(self.cluster, self.sector, self.slot * DIRENT_SIZE);
        let mut raw = [0u8; DIRENT_SIZE];
        raw.copy_from_slice(&self.buf[pos.offset..pos.offset + DIRENT_SIZE]);
        self.slot += 1;
        Ok(Some((pos, raw)))
    }
}

/// Accumulates a long-name run while scanning toward its short entry.
struct LfnRun {
    checksum: u8,
    /// Countdown of the next expected order value.
    expected: u8,
    units: Vec<u16>,
    positions: Vec<DirEntryPos>,
}

impl LfnRun {
    fn start(lde: &LongDirEntry, pos: DirEntryPos) -> Option<Self> {
        if !lde.is_last_in_set() || lde.sequence() == 0 {
            return None;
        }
        let total = lde.sequence();
        let mut run = Self {
            checksum: lde.checksum,
            expected: total,
            units: alloc::vec![0xFFFF; total as usize * LONG_NAME_LEN],
            positions: Vec::with_capacity(total as usize),
        };
        run.accept(lde, pos);
        Some(run)
    }

    /// True when the slot continues this run.
    fn matches(&self, lde: &LongDirEntry) -> bool {
        !lde.is_last_in_set() && lde.sequence() == self.expected && lde.checksum == self.checksum
    }

    fn accept(&mut self, lde: &LongDirEntry, pos: DirEntryPos) {
        let seq = lde.sequence() as usize;
        let at = (seq - 1) * LONG_NAME_LEN;
        self.units[at..at + LONG_NAME_LEN].copy_from_slice(&lde.name_units());
        self.positions.push(pos);
        self.expected -= 1;
    }

    fn complete(&self) -> bool {
        self.expected == 0
    }

    /// Bind against the short entry that terminated the run.
    fn bind(&self, sde: &ShortDirEntry) -> Option<String> {
        if !self.complete() || sfn_checksum(&sde.name_bytes()) != self.checksum {
            return None;
        }
        Some(decode_lfn_units(&self.units))
    }
}

impl FileSystem {
    /// Find `name` (long or short form, case-insensitive) among the live
    /// entries of the directory chain starting at `dir_cluster`.
    pub(crate) fn lookup(
        &self,
        dir_cluster: u32,
        name: &str,
    ) -> Result<Option<FoundEntry>, Error> {
        let mut cursor = DirCursor::new(self, dir_cluster);
        let mut run: Option<LfnRun> = None;

        while let Some((pos, raw)) = cursor.next()? {
            if raw[0] == DIR_ENTRY_LAST_AND_UNUSED {
                if run.is_some() {
                    warn!("directory scan hit the terminator inside a long-name run");
                    return Err(DirError::EntryCorrupted.into());
                }
                return Ok(None);
            }
            if raw[0] == DIR_ENTRY_UNUSED {
                run = None;
                continue;
            }
            if is_long_entry(&raw) {
                let lde = LongDirEntry::parse(&raw);
                match run.as_mut() {
                    Some(r) if r.matches(&lde) => r.accept(&lde, pos),
                    _ => run = LfnRun::start(&lde, pos),
                }
                continue;
            }

            let sde = ShortDirEntry::parse(&raw);
            let bound = run.take();
            if sde.is_volume_label() {
                continue;
            }

            if let Some(long_name) = bound.as_ref().and_then(|r| r.bind(&sde)) {
                if names_equal(&long_name, name) {
                    return Ok(Some(FoundEntry {
                        sde,
                        pos,
                        lfn_pos: bound.map(|r| r.positions).unwrap_or_default(),
                        name: long_name,
                    }));
                }
                continue;
            }

            if names_equal(&sde.display_name(), name) {
                return Ok(Some(FoundEntry {
                    sde,
                    pos,
                    lfn_pos: Vec::new(),
                    name: sde.display_name(),
                }));
            }
        }
        Ok(None)
    }

    /// Every live entry of the directory as (name, attribute) pairs.
    /// Orphaned long runs are discarded and the short name shown instead.
    pub(crate) fn list(&self, dir_cluster: u32) -> Result<Vec<(String, u8)>, Error> {
        let mut cursor = DirCursor::new(self, dir_cluster);
        let mut run: Option<LfnRun> = None;
        let mut out = Vec::new();

        while let Some((pos, raw)) = cursor.next()? {
            if raw[0] == DIR_ENTRY_LAST_AND_UNUSED {
                if run.is_some() {
                    return Err(DirError::EntryCorrupted.into());
                }
                break;
            }
            if raw[0] == DIR_ENTRY_UNUSED {
                run = None;
                continue;
            }
            if is_long_entry(&raw) {
                let lde = LongDirEntry::parse(&raw);
                match run.as_mut() {
                    Some(r) if r.matches(&lde) => r.accept(&lde, pos),
                    _ => run = LfnRun::start(&lde, pos),
                }
                continue;
            }

            let sde = ShortDirEntry::parse(&raw);
            let bound = run.take();
            if sde.is_volume_label() {
                continue;
            }
            let name = bound
                .as_ref()
                .and_then(|r| r.bind(&sde))
                .unwrap_or_else(|| sde.display_name());
            out.push((name, sde.attr));
        }
        Ok(out)
    }

    /// A directory is empty iff, past the "." and ".." seeds, every slot
    /// is 0x00 or 0xE5.
    pub(crate) fn dir_is_empty(&self, dir_cluster: u32) -> Result<bool, Error> {
        let mut cursor = DirCursor::new(self, dir_cluster);
        let mut index = 0usize;
        while let Some((_pos, raw)) = cursor.next()? {
            if raw[0] == DIR_ENTRY_LAST_AND_UNUSED {
                break;
            }
            let seed = index < 2;
            index += 1;
            if seed || raw[0] == DIR_ENTRY_UNUSED {
                continue;
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Find `needed` consecutive free slots, extending the directory by
    /// one zeroed cluster when the chain runs out. Returns the position
    /// of the first slot of the run.
    pub(crate) fn find_free_run(
        &self,
        dir_cluster: u32,
        needed: usize,
    ) -> Result<DirEntryPos, Error> {
        let mut run_start: Option<DirEntryPos> = None;
        let mut run_len = 0usize;
        let mut tail = dir_cluster;

        let mut cursor = DirCursor::new(self, dir_cluster);
        loop {
            match cursor.next()? {
                Some((pos, raw)) => {
                    tail = pos.cluster;
                    if raw[0] == DIR_ENTRY_LAST_AND_UNUSED || raw[0] == DIR_ENTRY_UNUSED {
                        if run_start.is_none() {
                            run_start = Some(pos);
                        }
                        run_len += 1;
                        if run_len == needed {
                            return Ok(run_start.unwrap());
                        }
                    } else {
                        run_start = None;
                        run_len = 0;
                    }
                }
                None => {
                    // Chain exhausted: grow the directory. The fresh
                    // cluster is zeroed so all of it counts as free slots.
                    let fresh = self.fat.write().extend_if_needed(tail)?;
                    self.clear_cluster(fresh)?;
                    cursor.finished = false;
                }
            }
        }
    }

    /// Write `records` contiguously starting at `start`, one sector
    /// read-modify-write at a time. Returns the position of the last
    /// record (the short entry of a run).
    pub(crate) fn write_records(
        &self,
        start: DirEntryPos,
        records: &[[u8; DIRENT_SIZE]],
    ) -> Result<DirEntryPos, Error> {
        let slots_per_sector = self.sector_bytes() / DIRENT_SIZE;
        let spc = self.layout.sectors_per_cluster;

        let mut cluster = start.cluster;
        let mut sector = start.sector;
        let mut slot = start.offset / DIRENT_SIZE;
        let mut written = 0usize;
        let mut buf = self.sector_buf();
        let mut last = start;

        while written < records.len() {
            let lba = self.layout.cluster_to_lba(cluster) + sector;
            self.read_sector(lba, &mut buf)?;
            while slot < slots_per_sector && written < records.len() {
                let at = slot * DIRENT_SIZE;
                buf[at..at + DIRENT_SIZE].copy_from_slice(&records[written]);
                last = DirEntryPos::new(cluster, sector, at);
                slot += 1;
                written += 1;
            }
            self.write_sector(lba, &buf)?;

            if written < records.len() {
                slot = 0;
                sector += 1;
                if sector == spc {
                    let next = self.fat.read().get_next(cluster)?;
                    if is_end_of_chain(next) {
                        return Err(DirError::NoFreeEntries.into());
                    }
                    cluster = next;
                    sector = 0;
                }
            }
        }
        Ok(last)
    }

    /// True when the raw 11-byte short name is already taken in the
    /// directory, used for numeric-tail collision resolution.
    fn sfn_in_use(&self, dir_cluster: u32, name11: &[u8; 11]) -> Result<bool, Error> {
        let mut cursor = DirCursor::new(self, dir_cluster);
        while let Some((_pos, raw)) = cursor.next()? {
            if raw[0] == DIR_ENTRY_LAST_AND_UNUSED {
                break;
            }
            if raw[0] == DIR_ENTRY_UNUSED || is_long_entry(&raw) {
                continue;
            }
            if &raw[0..11] == name11 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Create a file or directory entry named `name` in the directory at
    /// `parent_cluster`. Allocates the first cluster, builds the record
    /// run, finds room and writes it; a new directory also receives its
    /// "." and ".." seeds.
    pub(crate) fn create_entry(
        &self,
        parent_cluster: u32,
        name: &str,
        is_dir: bool,
    ) -> Result<(ShortDirEntry, DirEntryPos), Error> {
        let kind = classify(name, is_dir)?;
        let now = self.disk.datetime();

        let first_cluster = self.fat.write().allocate()?;
        if is_dir {
            self.clear_cluster(first_cluster)?;
        }

        let attr = if is_dir { ATTR_DIRECTORY } else { ATTR_ARCHIVE };
        let result = (|| {
            let mut records: Vec<[u8; DIRENT_SIZE]> = Vec::new();
            let name11 = match kind {
                NameKind::Short => short_name_format(name),
                NameKind::Long => {
                    let mut alias = derive_sfn(name);
                    while self.sfn_in_use(parent_cluster, &alias)? {
                        if !name::bump_numeric_tail(&mut alias) {
                            return Err(DirError::CreateFailed.into());
                        }
                    }
                    let checksum = sfn_checksum(&alias);
                    let slots = encode_lfn_slots(name);
                    for i in (0..slots.len()).rev() {
                        let lde = LongDirEntry::new(
                            (i + 1) as u8,
                            i == slots.len() - 1,
                            &slots[i],
                            checksum,
                        );
                        records.push(lde.serialize());
                    }
                    alias
                }
            };

            let mut sde = ShortDirEntry::new(name11, attr, first_cluster);
            sde.stamp_created(now);
            records.push(sde.serialize());

            let start = self.find_free_run(parent_cluster, records.len())?;
            let sde_pos = self.write_records(start, &records)?;

            if is_dir {
                self.seed_dot_entries(first_cluster, parent_cluster, now)?;
            }
            Ok((sde, sde_pos))
        })();

        if result.is_err() {
            // The entry never landed; give the cluster back.
            let _ = self.fat.write().free_chain(first_cluster);
        }
        result
    }

    /// Write the "." and ".." entries at the head of a fresh directory
    /// cluster. The dot entry points at the directory itself; the dotdot
    /// entry points at the parent, recorded as cluster 0 when the parent
    /// is the root.
    fn seed_dot_entries(
        &self,
        dir_cluster: u32,
        parent_cluster: u32,
        now: Option<crate::time::DateTime>,
    ) -> Result<(), Error> {
        let mut dot_name = [SPACE; 11];
        dot_name[0] = b'.';
        let mut dot = ShortDirEntry::new(dot_name, ATTR_DIRECTORY, dir_cluster);
        dot.stamp_created(now);

        let mut dotdot_name = [SPACE; 11];
        dotdot_name[0] = b'.';
        dotdot_name[1] = b'.';
        let parent_link = if parent_cluster == self.layout.root_cluster {
            0
        } else {
            parent_cluster
        };
        let mut dotdot = ShortDirEntry::new(dotdot_name, ATTR_DIRECTORY, parent_link);
        dotdot.stamp_created(now);

        let start = DirEntryPos::new(dir_cluster, 0, 0);
        self.write_records(start, &[dot.serialize(), dotdot.serialize()])?;
        Ok(())
    }

    /// Mark the short entry and its bound long run deleted, then release
    /// the cluster chain.
    pub(crate) fn delete_entry(&self, found: &FoundEntry) -> Result<(), Error> {
        for pos in found.lfn_pos.iter().chain(core::iter::once(&found.pos)) {
            let lba = self.entry_lba(pos);
            let mut buf = self.sector_buf();
            self.read_sector(lba, &mut buf)?;
            buf[pos.offset] = DIR_ENTRY_UNUSED;
            self.write_sector(lba, &buf)?;
        }

        let head = found.sde.first_cluster();
        if crate::is_data_cluster(head) {
            self.fat.write().free_chain(head)?;
        }
        Ok(())
    }
}
