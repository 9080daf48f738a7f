//! The mounted volume handle and the public operation surface.
//!
//! `mount` reads and validates the on-disk layout into an immutable
//! descriptor and hands back an `Arc<FileSystem>`; every operation takes
//! that handle, so there is no process-wide mutable state. Mutable pieces
//! (the FAT allocation hints) live behind an `RwLock` inside the handle.
//! Access is single-threaded cooperative; a host that wants concurrency
//! serializes at its own boundary.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use log::{error, info};
use spin::RwLock;

use crate::bpb::{BiosParameterBlock, FatLayout, FsInfo};
use crate::device::{BlockDevice, Disk};
use crate::dir::DirError;
use crate::entry::{DirEntryPos, ShortDirEntry};
use crate::fat::FatTable;
use crate::{Error, ATTR_READ_ONLY, DIRENT_SIZE, MIN_BLOCK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountError {
    /// Boot record unreadable, bad signature word or impossible geometry.
    InvalidBootRecord,
    /// A readable boot record that describes a FAT12/16 volume.
    NotFat32,
    /// FSInfo sector without its three signatures.
    InvalidFsInfo,
}

/// Behavior of `delete_dir` on a non-empty directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Refuse with `DirError::DirNotEmpty`.
    Safe,
    /// Remove contents depth-first, then the directory itself.
    Recursive,
}

pub struct FileSystem {
    pub(crate) disk: Disk,
    pub(crate) layout: FatLayout,
    pub(crate) bpb: BiosParameterBlock,
    pub(crate) fat: RwLock<FatTable>,
}

impl FileSystem {
    /// Read and validate the on-disk layout, returning the handle every
    /// other operation borrows.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Arc<Self>, Error> {
        let disk = Disk::new(device)?;

        let mut boot = vec![0u8; MIN_BLOCK_SIZE];
        disk.read_sectors(&mut boot, 0, MIN_BLOCK_SIZE)?;
        let bpb = BiosParameterBlock::parse(&boot)?;
        let layout = FatLayout::from_bpb(&bpb);

        let sector_bytes = layout.bytes_per_sector as usize;
        let mut buf = vec![0u8; sector_bytes];
        disk.read_sectors(&mut buf, layout.fsinfo_lba, sector_bytes)?;
        let fsinfo = FsInfo::parse(&buf);
        if !fsinfo.signature_ok() {
            error!("FSInfo signatures missing at sector {}", layout.fsinfo_lba);
            return Err(MountError::InvalidFsInfo.into());
        }

        let fat = FatTable::new(disk.clone(), layout, 0, fsinfo.next_free);
        // The FSInfo free count is a hint; range-check it and recompute
        // from the FAT when it cannot be trusted.
        let free = if fsinfo.free_count <= layout.data_clusters() {
            fsinfo.free_count
        } else {
            info!("free-cluster hint out of range, rescanning the FAT");
            fat.count_free()?
        };
        let fat = FatTable::new(disk.clone(), layout, free, fsinfo.next_free);

        info!(
            "mounted FAT32 volume: {} sectors, {} free clusters",
            layout.total_sectors, free
        );
        Ok(Arc::new(Self {
            disk,
            layout,
            bpb,
            fat: RwLock::new(fat),
        }))
    }

    /// Write back the FSInfo hints. The handle itself is released by
    /// dropping the last `Arc`.
    pub fn unmount(&self) -> Result<(), Error> {
        self.fat.read().write_fsinfo_hints();
        Ok(())
    }

    pub fn root_cluster(&self) -> u32 {
        self.layout.root_cluster
    }

    /// Volume label as recorded in the boot sector, space padded.
    pub fn volume_label(&self) -> [u8; 11] {
        self.bpb.volume_label
    }

    pub fn volume_id(&self) -> u32 {
        self.bpb.volume_id
    }

    /// Last known free cluster count.
    pub fn free_clusters(&self) -> u32 {
        self.fat.read().free_clusters()
    }

    pub(crate) fn sector_bytes(&self) -> usize {
        self.layout.bytes_per_sector as usize
    }

    pub(crate) fn sector_buf(&self) -> Vec<u8> {
        vec![0u8; self.sector_bytes()]
    }

    pub(crate) fn read_sector(&self, lba: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.disk.read_sectors(buf, lba, self.sector_bytes())?;
        Ok(())
    }

    pub(crate) fn write_sector(&self, lba: u32, buf: &[u8]) -> Result<(), Error> {
        self.disk.write_sectors(buf, lba, self.sector_bytes())?;
        Ok(())
    }

    /// Absolute sector of a directory entry position.
    pub(crate) fn entry_lba(&self, pos: &DirEntryPos) -> u32 {
        self.layout.cluster_to_lba(pos.cluster) + pos.sector
    }

    /// Zero a whole cluster. A cluster taken over as directory storage
    /// must read as all-free entries.
    pub(crate) fn clear_cluster(&self, cluster: u32) -> Result<(), Error> {
        let lba = self.layout.cluster_to_lba(cluster);
        self.disk.erase_sectors(
            lba,
            self.layout.sectors_per_cluster as usize,
            self.sector_bytes(),
        )?;
        Ok(())
    }

    /// Read the short entry stored at `pos`.
    pub(crate) fn read_entry_at(&self, pos: &DirEntryPos) -> Result<ShortDirEntry, Error> {
        let mut buf = self.sector_buf();
        self.read_sector(self.entry_lba(pos), &mut buf)?;
        Ok(ShortDirEntry::parse(&buf[pos.offset..pos.offset + DIRENT_SIZE]))
    }

    /// Read-modify-write the sector holding `pos` with a patched entry.
    pub(crate) fn write_entry_at(
        &self,
        pos: &DirEntryPos,
        entry: &ShortDirEntry,
    ) -> Result<(), Error> {
        let lba = self.entry_lba(pos);
        let mut buf = self.sector_buf();
        self.read_sector(lba, &mut buf)?;
        buf[pos.offset..pos.offset + DIRENT_SIZE].copy_from_slice(&entry.serialize());
        self.write_sector(lba, &buf)
    }

    /// True when `path` resolves to an existing file or directory.
    pub fn path_exists(&self, path: &str) -> bool {
        if path == "/" {
            return true;
        }
        matches!(self.resolve_entry(path), Ok(Some(_)))
    }

    /// Create a directory at `path`. Intermediate components must already
    /// exist; the new directory receives its "." and ".." seed entries.
    pub fn mkdir(&self, path: &str) -> Result<(), Error> {
        let (parent_cluster, leaf) = self.resolve_parent(path)?;
        crate::name::classify(leaf, true)?;
        if self.lookup(parent_cluster, leaf)?.is_some() {
            return Err(DirError::CreateFailed.into());
        }
        self.create_entry(parent_cluster, leaf, true)?;
        Ok(())
    }

    /// Remove a file. The directory record run is marked deleted and the
    /// cluster chain is released.
    pub fn delete_file(&self, path: &str) -> Result<(), Error> {
        let (parent_cluster, leaf) = self.resolve_parent(path)?;
        let found = self
            .lookup(parent_cluster, leaf)?
            .ok_or(DirError::FileNotFound)?;
        if found.sde.is_dir() {
            return Err(DirError::IsDirectory.into());
        }
        if found.sde.attr & ATTR_READ_ONLY != 0 {
            return Err(DirError::DeleteProtected.into());
        }
        self.delete_entry(&found)
    }

    /// Remove a directory. `Safe` refuses unless empty; `Recursive`
    /// removes contents depth-first first.
    pub fn delete_dir(&self, path: &str, mode: DeleteMode) -> Result<(), Error> {
        if path == "/" {
            return Err(DirError::DeleteProtected.into());
        }
        let (parent_cluster, leaf) = self.resolve_parent(path)?;
        let found = self
            .lookup(parent_cluster, leaf)?
            .ok_or(DirError::DirNotFound)?;
        if !found.sde.is_dir() {
            return Err(DirError::NotADirectory.into());
        }

        let cluster = found.sde.first_cluster();
        match mode {
            DeleteMode::Safe => {
                if !self.dir_is_empty(cluster)? {
                    return Err(DirError::DirNotEmpty.into());
                }
            }
            DeleteMode::Recursive => self.remove_children(cluster)?,
        }
        self.delete_entry(&found)
    }

    fn remove_children(&self, dir_cluster: u32) -> Result<(), Error> {
        let children = self.list(dir_cluster)?;
        for (name, attr) in children {
            if name == "." || name == ".." {
                continue;
            }
            let found = self
                .lookup(dir_cluster, &name)?
                .ok_or(DirError::EntryNotFound)?;
            if attr & crate::ATTR_DIRECTORY != 0 {
                self.remove_children(found.sde.first_cluster())?;
            }
            self.delete_entry(&found)?;
        }
        Ok(())
    }

    /// Names and attribute bytes of every live entry in the directory at
    /// `path`.
    pub fn list_dir(&self, path: &str) -> Result<Vec<(String, u8)>, Error> {
        let cluster = self.resolve_dir(path)?;
        self.list(cluster)
    }
}
