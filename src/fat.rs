//! FAT table manager and cluster chain walker.
//!
//! The file allocation table defines a singly linked list of the clusters
//! of a file. Entries are 32-bit little-endian but only 28 bits carry the
//! link; the high 4 bits are reserved and are preserved across writes.
//!
//! Every mutation is mirrored: FAT1 is written first, then FAT2 for the
//! same entry, so readers may always believe FAT1. A failure before FAT1
//! is written surfaces as [`FatError::UpdateFailed`] and FAT2 is left
//! untouched; a failure after FAT1 succeeded surfaces as
//! [`FatError::UpdatePartialFail`] so the caller can retry or roll FAT1
//! back to the prior value.

use alloc::vec;
use alloc::vec::Vec;
use log::warn;

use crate::bpb::{FatLayout, FsInfo};
use crate::device::Disk;
use crate::{
    is_data_cluster, is_end_of_chain, read_le_u32, write_le_u32, Error, END_OF_CHAIN,
    FAT_ENTRY_MASK, FREE_CLUSTER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatError {
    /// No free cluster left on the volume.
    DiskFull,
    /// A chain walk could not be completed.
    ClusterChainBroken,
    /// A cluster number outside [2, 0x0FFFFFF6] where a link was expected.
    InvalidCluster,
    /// A chain with a free or reserved entry inside it, or one that never
    /// terminates.
    InvalidChain,
    /// Allocation rolled back after a mirror failure.
    AllocFailed,
    /// FAT1 could not be updated; nothing was written.
    UpdateFailed,
    /// FAT1 was updated but FAT2 was not; the tables disagree.
    UpdatePartialFail,
    /// The rollback after a partial failure failed as well.
    RecoveryFailed,
}

/// Byte position of a file offset inside its chain, the walker output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePos {
    /// Index of the cluster along the chain, 0-based.
    pub cluster_idx: u32,
    /// The cluster number itself.
    pub cluster: u32,
    /// Sector within the cluster. May equal sectors_per_cluster to mean
    /// "at the end of this cluster, successor not yet resolved".
    pub sector_idx: u32,
    /// Byte within the sector.
    pub byte_offset: u32,
}

/// The mounted FAT pair plus the FSInfo allocation hints.
///
/// The hints are advisory: `free_clusters` tracks the last known free
/// count and `next_free` seeds the linear scan, both persisted to the
/// FSInfo sector on a best-effort basis.
pub struct FatTable {
    disk: Disk,
    layout: FatLayout,
    free_clusters: u32,
    next_free: u32,
}

impl FatTable {
    pub fn new(disk: Disk, layout: FatLayout, free_clusters: u32, next_free: u32) -> Self {
        let next_free = if is_data_cluster(next_free) {
            next_free
        } else {
            2
        };
        Self {
            disk,
            layout,
            free_clusters,
            next_free,
        }
    }

    pub fn free_clusters(&self) -> u32 {
        self.free_clusters
    }

    /// (sector offset inside a FAT, byte offset inside that sector)
    fn entry_location(&self, cluster: u32) -> (u32, usize) {
        let sector = cluster / self.layout.fat_entries_per_sector;
        let offset = (cluster % self.layout.fat_entries_per_sector) as usize * 4;
        (sector, offset)
    }

    fn sector_buf(&self) -> Vec<u8> {
        vec![0u8; self.layout.bytes_per_sector as usize]
    }

    /// Read the link stored for `cluster`, masked to 28 bits. Readers
    /// always consult FAT1.
    pub fn get_next(&self, cluster: u32) -> Result<u32, Error> {
        if !is_data_cluster(cluster) {
            return Err(FatError::InvalidCluster.into());
        }
        let (sector, offset) = self.entry_location(cluster);
        let mut buf = self.sector_buf();
        self.disk.read_sectors(
            &mut buf,
            self.layout.fat1_lba + sector,
            self.layout.bytes_per_sector as usize,
        )?;
        Ok(read_le_u32(&buf[offset..]) & FAT_ENTRY_MASK)
    }

    /// Read-modify-write one FAT copy, preserving the reserved high bits.
    fn write_entry(&self, fat_lba: u32, cluster: u32, value: u32) -> Result<(), Error> {
        let (sector, offset) = self.entry_location(cluster);
        let mut buf = self.sector_buf();
        let sector_bytes = self.layout.bytes_per_sector as usize;
        self.disk
            .read_sectors(&mut buf, fat_lba + sector, sector_bytes)?;
        let old = read_le_u32(&buf[offset..]);
        write_le_u32(
            &mut buf[offset..],
            (old & !FAT_ENTRY_MASK) | (value & FAT_ENTRY_MASK),
        );
        self.disk
            .write_sectors(&buf, fat_lba + sector, sector_bytes)?;
        Ok(())
    }

    /// Mirror `value` into the entry for `cluster`, FAT1 before FAT2.
    pub fn update(&mut self, cluster: u32, value: u32) -> Result<(), Error> {
        if !is_data_cluster(cluster) {
            return Err(FatError::InvalidCluster.into());
        }
        if self.write_entry(self.layout.fat1_lba, cluster, value).is_err() {
            return Err(FatError::UpdateFailed.into());
        }
        if self.write_entry(self.layout.fat2_lba, cluster, value).is_err() {
            warn!("FAT mirror out of sync at cluster {}", cluster);
            return Err(FatError::UpdatePartialFail.into());
        }
        Ok(())
    }

    /// Restore FAT1 alone, used to roll back after a partial failure
    /// where FAT2 was never reached.
    fn restore_fat1(&mut self, cluster: u32, value: u32) -> Result<(), Error> {
        self.write_entry(self.layout.fat1_lba, cluster, value)
    }

    /// Linear scan of FAT1 for the first free entry. The FSInfo next-free
    /// hint seeds the scan; the scan wraps to cluster 2 before giving up.
    pub fn find_free(&mut self) -> Result<u32, Error> {
        let max = self.layout.max_cluster();
        let start = if (2..=max).contains(&self.next_free) {
            self.next_free
        } else {
            2
        };

        if let Some(c) = self.scan_free(start, max)? {
            return Ok(c);
        }
        if start > 2 {
            if let Some(c) = self.scan_free(2, start - 1)? {
                return Ok(c);
            }
        }
        Err(FatError::DiskFull.into())
    }

    fn scan_free(&self, from: u32, to: u32) -> Result<Option<u32>, Error> {
        let sector_bytes = self.layout.bytes_per_sector as usize;
        let mut buf = self.sector_buf();

        let mut cluster = from;
        let mut loaded_sector = u32::MAX;
        while cluster <= to {
            let (sector, offset) = self.entry_location(cluster);
            if sector != loaded_sector {
                self.disk
                    .read_sectors(&mut buf, self.layout.fat1_lba + sector, sector_bytes)?;
                loaded_sector = sector;
            }
            if read_le_u32(&buf[offset..]) & FAT_ENTRY_MASK == FREE_CLUSTER {
                return Ok(Some(cluster));
            }
            cluster += 1;
        }
        Ok(None)
    }

    /// Claim one free cluster and mark it end-of-chain in both FATs.
    pub fn allocate(&mut self) -> Result<u32, Error> {
        let cluster = self.find_free()?;
        match self.update(cluster, END_OF_CHAIN) {
            Ok(()) => {}
            Err(Error::Fat(FatError::UpdatePartialFail)) => {
                // FAT2 was never written, so restoring FAT1 restores the
                // mirror invariant.
                return match self.restore_fat1(cluster, FREE_CLUSTER) {
                    Ok(()) => Err(FatError::AllocFailed.into()),
                    Err(_) => Err(FatError::RecoveryFailed.into()),
                };
            }
            Err(e) => return Err(e),
        }
        self.free_clusters = self.free_clusters.saturating_sub(1);
        self.next_free = cluster + 1;
        self.write_fsinfo_hints();
        Ok(cluster)
    }

    /// Walk the chain from `head` and mark every node free.
    ///
    /// The walk first collects the nodes so that a chain break cannot
    /// leak clusters: whatever was seen before the break is still freed.
    /// Returns the number of clusters released.
    pub fn free_chain(&mut self, head: u32) -> Result<u32, Error> {
        let mut nodes: Vec<u32> = Vec::new();
        let mut walk_error: Option<Error> = None;
        let guard = self.layout.data_clusters() as usize + 2;

        let mut cluster = head;
        loop {
            if !is_data_cluster(cluster) {
                walk_error = Some(FatError::InvalidChain.into());
                break;
            }
            nodes.push(cluster);
            if nodes.len() > guard {
                walk_error = Some(FatError::InvalidChain.into());
                break;
            }
            match self.get_next(cluster) {
                Ok(next) if is_end_of_chain(next) => break,
                Ok(next) => cluster = next,
                Err(_) => {
                    walk_error = Some(FatError::ClusterChainBroken.into());
                    break;
                }
            }
        }

        let mut freed = 0u32;
        let mut free_error: Option<Error> = None;
        for &node in nodes.iter() {
            match self.update(node, FREE_CLUSTER) {
                Ok(()) => freed += 1,
                Err(e) => {
                    if free_error.is_none() {
                        free_error = Some(e);
                    }
                }
            }
        }

        if freed > 0 {
            self.free_clusters = self.free_clusters.saturating_add(freed);
            if nodes[0] < self.next_free {
                self.next_free = nodes[0];
            }
            self.write_fsinfo_hints();
        }

        if let Some(e) = free_error.or(walk_error) {
            warn!("chain free from cluster {} was incomplete", head);
            return Err(e);
        }
        Ok(freed)
    }

    /// Free every successor of `first` and re-link `first` to
    /// end-of-chain. The re-link happens before the successors are
    /// released so a failure cannot leave `first` pointing at free
    /// clusters.
    pub fn truncate_chain(&mut self, first: u32) -> Result<(), Error> {
        let next = self.get_next(first)?;
        if is_end_of_chain(next) {
            return Ok(());
        }
        self.update(first, END_OF_CHAIN)?;
        self.free_chain(next)?;
        Ok(())
    }

    /// The cluster at `index` hops from `head`.
    pub fn cluster_at(&self, head: u32, index: u32) -> Result<u32, Error> {
        let mut cluster = head;
        for _ in 0..index {
            let next = self.get_next(cluster)?;
            if is_end_of_chain(next) {
                return Err(FatError::ClusterChainBroken.into());
            }
            if !is_data_cluster(next) {
                return Err(FatError::InvalidChain.into());
            }
            cluster = next;
        }
        Ok(cluster)
    }

    /// The last cluster of the chain starting at `head`.
    pub fn chain_tail(&self, head: u32) -> Result<u32, Error> {
        let guard = self.layout.data_clusters() + 2;
        let mut cluster = head;
        for _ in 0..guard {
            let next = self.get_next(cluster)?;
            if is_end_of_chain(next) {
                return Ok(cluster);
            }
            if !is_data_cluster(next) {
                return Err(FatError::InvalidChain.into());
            }
            cluster = next;
        }
        Err(FatError::InvalidChain.into())
    }

    pub fn chain_length(&self, head: u32) -> Result<u32, Error> {
        let guard = self.layout.data_clusters() + 2;
        let mut cluster = head;
        let mut len = 1;
        loop {
            let next = self.get_next(cluster)?;
            if is_end_of_chain(next) {
                return Ok(len);
            }
            if !is_data_cluster(next) || len > guard {
                return Err(FatError::InvalidChain.into());
            }
            cluster = next;
            len += 1;
        }
    }

    /// Translate a byte offset within the chain starting at `head` into a
    /// (cluster, sector, byte) position.
    ///
    /// An offset sitting exactly on a cluster boundary resolves to the end
    /// of the preceding cluster (`sector_idx == sectors_per_cluster`); the
    /// successor is only looked up when someone actually crosses it, which
    /// keeps an offset equal to the chain size addressable.
    pub fn locate(&self, head: u32, byte_offset: u32) -> Result<FilePos, Error> {
        let cb = self.layout.cluster_bytes;
        let bps = self.layout.bytes_per_sector;
        let idx = byte_offset / cb;
        let rem = byte_offset % cb;

        if rem == 0 && idx > 0 {
            let cluster = self.cluster_at(head, idx - 1)?;
            return Ok(FilePos {
                cluster_idx: idx - 1,
                cluster,
                sector_idx: self.layout.sectors_per_cluster,
                byte_offset: 0,
            });
        }

        let cluster = self.cluster_at(head, idx)?;
        Ok(FilePos {
            cluster_idx: idx,
            cluster,
            sector_idx: rem / bps,
            byte_offset: rem % bps,
        })
    }

    /// Follow the link out of `cur`, allocating and linking a fresh
    /// cluster when `cur` is the chain tail. On any failure the chain is
    /// left untouched.
    pub fn extend_if_needed(&mut self, cur: u32) -> Result<u32, Error> {
        let next = self.get_next(cur)?;
        if !is_end_of_chain(next) {
            if !is_data_cluster(next) {
                return Err(FatError::InvalidChain.into());
            }
            return Ok(next);
        }
        let fresh = self.allocate()?;
        if let Err(e) = self.update(cur, fresh) {
            // Give the fresh cluster back; the old tail still ends the
            // chain on FAT1 if the link write never landed.
            let _ = self.update(fresh, FREE_CLUSTER);
            self.free_clusters = self.free_clusters.saturating_add(1);
            return Err(e);
        }
        Ok(fresh)
    }

    /// Recompute the free count by scanning FAT1. Expensive; used when
    /// the FSInfo hint is missing or out of range.
    pub fn count_free(&self) -> Result<u32, Error> {
        let max = self.layout.max_cluster();
        let sector_bytes = self.layout.bytes_per_sector as usize;
        let mut buf = self.sector_buf();
        let mut loaded_sector = u32::MAX;
        let mut free = 0u32;
        for cluster in 2..=max {
            let (sector, offset) = self.entry_location(cluster);
            if sector != loaded_sector {
                self.disk
                    .read_sectors(&mut buf, self.layout.fat1_lba + sector, sector_bytes)?;
                loaded_sector = sector;
            }
            if read_le_u32(&buf[offset..]) & FAT_ENTRY_MASK == FREE_CLUSTER {
                free += 1;
            }
        }
        Ok(free)
    }

    /// Persist the allocation hints into the FSInfo sector. The sector is
    /// advisory, so a write failure is logged and swallowed.
    pub fn write_fsinfo_hints(&self) {
        let sector_bytes = self.layout.bytes_per_sector as usize;
        let mut buf = vec![0u8; sector_bytes];
        if self
            .disk
            .read_sectors(&mut buf, self.layout.fsinfo_lba, sector_bytes)
            .is_err()
        {
            warn!("FSInfo sector unreadable, hints not persisted");
            return;
        }
        let mut info = FsInfo::parse(&buf);
        info.free_count = self.free_clusters;
        info.next_free = self.next_free;
        info.serialize(&mut buf);
        if self
            .disk
            .write_sectors(&buf, self.layout.fsinfo_lba, sector_bytes)
            .is_err()
        {
            warn!("FSInfo sector not writable, hints not persisted");
        }
    }
}
