//! File handles and the byte-level I/O path.
//!
//! A handle carries the position of its directory entry, the first
//! cluster, the current size and a position triple that maps the byte
//! offset onto (cluster, sector, byte) coordinates. Reads and writes move
//! sector by sector; a write that crosses the chain tail extends the
//! chain on demand. The directory entry is only touched by `flush`, which
//! writes back the size and the last-write stamp.

use crate::dir::DirError;
use crate::entry::DirEntryPos;
use crate::fat::FilePos;
use crate::fs::FileSystem;
use crate::name::{classify, validate_lfn_file, validate_sfn_file};
use crate::{is_data_cluster, is_end_of_chain, Error, FatError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    /// Write on a read-only handle, or a mode the operation rejects.
    InvalidMode,
    /// CUR/END seek arithmetic produced a negative absolute offset.
    InvalidSeekMode,
    /// Seek target outside [0, size].
    InvalidPosition,
    /// The directory entry write-back failed.
    FlushFailed,
    OpenFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    /// Truncate if present, create if absent.
    Write,
    /// Open existing metadata, position at the end.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Set,
    Cur,
    End,
}

/// An open file. Borrows the mounted filesystem for its whole lifetime,
/// so a volume cannot be unmounted from under its handles.
pub struct FileHandle<'fs> {
    fs: &'fs FileSystem,
    entry_pos: DirEntryPos,
    first_cluster: u32,
    size: u32,
    pos: FilePos,
    mode: FileMode,
}

impl FileSystem {
    /// Open a file by absolute path.
    ///
    /// `Read` and `Append` require the file to exist; `Write` truncates
    /// an existing file (successor clusters freed, the first re-linked to
    /// end-of-chain) or creates a fresh one.
    pub fn open(&self, path: &str, mode: FileMode) -> Result<FileHandle<'_>, Error> {
        let (parent_cluster, leaf) = self.resolve_parent(path)?;
        if validate_sfn_file(leaf).is_err() {
            validate_lfn_file(leaf)?;
        }

        let (sde, entry_pos) = match self.lookup(parent_cluster, leaf)? {
            Some(found) => {
                if found.sde.is_dir() {
                    return Err(DirError::IsDirectory.into());
                }
                (found.sde, found.pos)
            }
            None => match mode {
                FileMode::Write => {
                    classify(leaf, false)?;
                    self.create_entry(parent_cluster, leaf, false)?
                }
                _ => return Err(DirError::FileNotFound.into()),
            },
        };

        // Every file this crate creates owns at least one cluster; an
        // entry without one is damaged and cannot back a handle.
        let first_cluster = sde.first_cluster();
        if !is_data_cluster(first_cluster) {
            return Err(FileError::OpenFailed.into());
        }

        let mut size = sde.file_size;
        if mode == FileMode::Write && size != 0 {
            // Truncate: drop every successor and re-link the first
            // cluster to end-of-chain, then forget the old size.
            self.fat.write().truncate_chain(first_cluster)?;
            size = 0;
            let mut entry = self.read_entry_at(&entry_pos)?;
            entry.file_size = 0;
            entry.stamp_written(self.disk.datetime());
            self.write_entry_at(&entry_pos, &entry)?;
        }

        let pos = if mode == FileMode::Append {
            self.fat.read().locate(first_cluster, size)?
        } else {
            FilePos {
                cluster_idx: 0,
                cluster: first_cluster,
                sector_idx: 0,
                byte_offset: 0,
            }
        };

        Ok(FileHandle {
            fs: self,
            entry_pos,
            first_cluster,
            size,
            pos,
            mode,
        })
    }
}

impl FileHandle<'_> {
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Current byte offset, derived from the position triple.
    pub fn tell(&self) -> u32 {
        let layout = &self.fs.layout;
        self.pos.cluster_idx * layout.cluster_bytes
            + self.pos.sector_idx * layout.bytes_per_sector
            + self.pos.byte_offset
    }

    /// Step the position onto the next addressable sector, following the
    /// chain when the cluster is exhausted. `extend` allocates a fresh
    /// cluster at the tail instead of failing.
    fn hop_if_needed(&mut self, extend: bool) -> Result<(), Error> {
        let layout = self.fs.layout;
        if self.pos.byte_offset == layout.bytes_per_sector {
            self.pos.byte_offset = 0;
            self.pos.sector_idx += 1;
        }
        if self.pos.sector_idx == layout.sectors_per_cluster {
            let next = if extend {
                self.fs.fat.write().extend_if_needed(self.pos.cluster)?
            } else {
                let next = self.fs.fat.read().get_next(self.pos.cluster)?;
                if is_end_of_chain(next) {
                    return Err(FatError::ClusterChainBroken.into());
                }
                next
            };
            self.pos.cluster = next;
            self.pos.cluster_idx += 1;
            self.pos.sector_idx = 0;
            self.pos.byte_offset = 0;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes from the current position. A short
    /// count happens only at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let layout = self.fs.layout;
        let remaining = (self.size - self.tell()) as usize;
        let want = buf.len().min(remaining);
        if want == 0 {
            return Ok(0);
        }

        let mut sector = self.fs.sector_buf();
        let mut done = 0usize;
        while done < want {
            self.hop_if_needed(false)?;
            let lba = layout.cluster_to_lba(self.pos.cluster) + self.pos.sector_idx;
            self.fs.read_sector(lba, &mut sector)?;

            let at = self.pos.byte_offset as usize;
            let len = (layout.bytes_per_sector as usize - at).min(want - done);
            buf[done..done + len].copy_from_slice(&sector[at..at + len]);
            done += len;
            self.pos.byte_offset += len as u32;
        }
        Ok(done)
    }

    /// Write `buf` at the current position, extending the chain on
    /// demand. The in-memory size grows when the position passes it; the
    /// directory entry is not touched until `flush`.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if self.mode == FileMode::Read {
            return Err(FileError::InvalidMode.into());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let layout = self.fs.layout;
        let bps = layout.bytes_per_sector as usize;
        let mut sector = self.fs.sector_buf();
        let mut done = 0usize;
        while done < buf.len() {
            self.hop_if_needed(true)?;
            let lba = layout.cluster_to_lba(self.pos.cluster) + self.pos.sector_idx;

            let at = self.pos.byte_offset as usize;
            let len = (bps - at).min(buf.len() - done);
            if len == bps {
                sector.copy_from_slice(&buf[done..done + len]);
            } else {
                // Partial sector: merge with what is on disk.
                self.fs.read_sector(lba, &mut sector)?;
                sector[at..at + len].copy_from_slice(&buf[done..done + len]);
            }
            self.fs.write_sector(lba, &sector)?;

            done += len;
            self.pos.byte_offset += len as u32;
            let abs = self.tell();
            if abs > self.size {
                self.size = abs;
            }
        }
        Ok(done)
    }

    /// Move the position. The absolute target must lie inside [0, size].
    /// Returns the new offset.
    pub fn seek(&mut self, offset: i32, whence: SeekMode) -> Result<u32, Error> {
        let base = match whence {
            SeekMode::Set => 0i64,
            SeekMode::Cur => self.tell() as i64,
            SeekMode::End => self.size as i64,
        };
        let target = base + offset as i64;
        if target < 0 {
            return Err(FileError::InvalidSeekMode.into());
        }
        if target as u64 > self.size as u64 {
            return Err(FileError::InvalidPosition.into());
        }
        let target = target as u32;

        // Forward CUR movement keeps walking from the current cluster;
        // everything else restarts from the first cluster.
        let current = self.tell();
        if whence == SeekMode::Cur && target >= current {
            let hops_done = self.pos.cluster_idx;
            let pos = self.fs.fat.read().locate(self.pos.cluster, target - hops_done * self.fs.layout.cluster_bytes)?;
            self.pos = FilePos {
                cluster_idx: hops_done + pos.cluster_idx,
                ..pos
            };
        } else {
            self.pos = self.fs.fat.read().locate(self.first_cluster, target)?;
        }
        Ok(target)
    }

    /// Write the recorded size and the last-write stamp back into the
    /// parent directory entry. No FAT mutation.
    pub fn flush(&mut self) -> Result<(), Error> {
        let mut entry = self
            .fs
            .read_entry_at(&self.entry_pos)
            .map_err(|_| FileError::FlushFailed)?;
        entry.file_size = self.size;
        entry.stamp_written(self.fs.disk.datetime());
        self.fs
            .write_entry_at(&self.entry_pos, &entry)
            .map_err(|_| FileError::FlushFailed)?;
        Ok(())
    }

    /// Flush and release the handle.
    pub fn close(mut self) -> Result<(), Error> {
        self.flush()
    }
}
