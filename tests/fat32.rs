//! End-to-end tests against an in-memory block device.
//!
//! The device is sparse: blocks never written read back as zeroes, which
//! lets the tests format multi-GiB volumes without backing storage.

use std::collections::HashMap;
use std::sync::Arc;

use spin::RwLock;

use ufat32::bpb::BiosParameterBlock;
use ufat32::entry::{is_long_entry, LongDirEntry, ShortDirEntry};
use ufat32::name::sfn_checksum;
use ufat32::{
    format, BlockDevice, DateTime, DeleteMode, DeviceError, DirError, Error, FileError,
    FileMode, FileSystem, NameError, SeekMode,
};

const BLOCK: usize = 512;
const EIGHT_GIB: u64 = 8 * 1024 * 1024 * 1024;

struct MemDisk {
    blocks: RwLock<HashMap<u32, Box<[u8; BLOCK]>>>,
}

impl MemDisk {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            blocks: RwLock::new(HashMap::new()),
        })
    }

    /// Raw bytes for structural assertions.
    fn read_at(&self, offset: u64, out: &mut [u8]) {
        let map = self.blocks.read();
        for (i, byte) in out.iter_mut().enumerate() {
            let pos = offset + i as u64;
            let block = (pos / BLOCK as u64) as u32;
            let within = (pos % BLOCK as u64) as usize;
            *byte = map.get(&block).map(|b| b[within]).unwrap_or(0);
        }
    }
}

impl BlockDevice for MemDisk {
    fn read_blocks(
        &self,
        buf: &mut [u8],
        start_block: u32,
        block_cnt: usize,
    ) -> Result<(), DeviceError> {
        let map = self.blocks.read();
        for i in 0..block_cnt {
            let dst = &mut buf[i * BLOCK..(i + 1) * BLOCK];
            match map.get(&(start_block + i as u32)) {
                Some(block) => dst.copy_from_slice(&block[..]),
                None => dst.fill(0),
            }
        }
        Ok(())
    }

    fn write_blocks(
        &self,
        buf: &[u8],
        start_block: u32,
        block_cnt: usize,
    ) -> Result<(), DeviceError> {
        let mut map = self.blocks.write();
        for i in 0..block_cnt {
            let mut block = Box::new([0u8; BLOCK]);
            block.copy_from_slice(&buf[i * BLOCK..(i + 1) * BLOCK]);
            map.insert(start_block + i as u32, block);
        }
        Ok(())
    }

    fn erase_blocks(&self, start_block: u32, block_cnt: usize) -> Result<(), DeviceError> {
        let mut map = self.blocks.write();
        for i in 0..block_cnt {
            map.remove(&(start_block + i as u32));
        }
        Ok(())
    }

    fn datetime(&self) -> Option<DateTime> {
        Some(DateTime::new(2026, 8, 1, 12, 30, 20))
    }

    fn block_size(&self) -> usize {
        BLOCK
    }
}

fn fresh_volume() -> (Arc<MemDisk>, Arc<FileSystem>) {
    let disk = MemDisk::new();
    format(disk.clone(), EIGHT_GIB).expect("format");
    let fs = FileSystem::mount(disk.clone()).expect("mount");
    (disk, fs)
}

#[test]
fn format_then_mount() {
    let (disk, fs) = fresh_volume();

    let mut boot = [0u8; BLOCK];
    disk.read_at(0, &mut boot);
    let bpb = BiosParameterBlock::parse(&boot).expect("boot sector parses");
    assert_eq!(u16::from_le_bytes([boot[510], boot[511]]), 0xAA55);
    assert_eq!(bpb.fat_size_16, 0);
    assert_eq!(bpb.bytes_per_sector as usize, BLOCK);
    assert_eq!(bpb.fat_count, 2);
    assert_eq!(bpb.root_cluster, 2);
    assert_eq!(fs.root_cluster(), 2);

    // The backup boot sector at LBA 6 is byte-identical.
    let mut backup = [0u8; BLOCK];
    disk.read_at(6 * BLOCK as u64, &mut backup);
    assert_eq!(boot[..], backup[..]);
}

#[test]
fn preseeded_directory_exists() {
    let (_disk, fs) = fresh_volume();
    assert!(fs.path_exists("/DATA"));
    let entries = fs.list_dir("/DATA").unwrap();
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert!(names.contains(&"."));
    assert!(names.contains(&".."));
}

#[test]
fn nested_directories() {
    let (_disk, fs) = fresh_volume();
    fs.mkdir("/MYDIR").unwrap();
    fs.mkdir("/MYDIR/TEST1").unwrap();
    fs.mkdir("/MYDIR/TEST1/test1").unwrap();
    assert!(fs.path_exists("/MYDIR/TEST1/test1"));
    assert!(!fs.path_exists("/MYDIR/TEST2"));
}

#[test]
fn write_then_read() {
    let (_disk, fs) = fresh_volume();
    fs.mkdir("/MYDIR").unwrap();
    fs.mkdir("/MYDIR/TEST1").unwrap();
    fs.mkdir("/MYDIR/TEST1/test1").unwrap();

    let mut file = fs
        .open("/MYDIR/TEST1/test1/1.txt", FileMode::Write)
        .unwrap();
    let written = file.write(b"How do you do?").unwrap();
    assert_eq!(written, 14);
    file.flush().unwrap();
    file.close().unwrap();

    let mut file = fs.open("/MYDIR/TEST1/test1/1.txt", FileMode::Read).unwrap();
    let mut buf = [0u8; 256];
    let read = file.read(&mut buf).unwrap();
    assert_eq!(read, 14);
    assert_eq!(&buf[..14], b"How do you do?");
}

#[test]
fn append_concatenates() {
    let (_disk, fs) = fresh_volume();

    let mut file = fs.open("/a.txt", FileMode::Write).unwrap();
    file.write(b"Hello ").unwrap();
    file.flush().unwrap();
    file.close().unwrap();

    let mut file = fs.open("/a.txt", FileMode::Append).unwrap();
    file.write(b"World!").unwrap();
    file.flush().unwrap();
    file.close().unwrap();

    let mut file = fs.open("/a.txt", FileMode::Read).unwrap();
    let mut buf = [0u8; 64];
    let read = file.read(&mut buf).unwrap();
    assert_eq!(read, 12);
    assert_eq!(&buf[..12], b"Hello World!");
}

#[test]
fn size_recorded_after_flush() {
    let (disk, fs) = fresh_volume();
    let mut file = fs.open("/size.txt", FileMode::Write).unwrap();
    file.write(b"seven!!").unwrap();
    file.flush().unwrap();
    file.close().unwrap();

    // Reopen and trust only the directory-recorded size.
    let file = fs.open("/size.txt", FileMode::Read).unwrap();
    assert_eq!(file.size(), 7);
    drop(disk);
}

/// Walk the root directory raw and return (long-run slots, short entry)
/// for the first long-named entry found.
fn first_lfn_run(disk: &MemDisk) -> (Vec<LongDirEntry>, ShortDirEntry) {
    let mut boot = [0u8; BLOCK];
    disk.read_at(0, &mut boot);
    let bpb = BiosParameterBlock::parse(&boot).unwrap();

    let data_lba = bpb.reserved_sectors as u64 + 2 * bpb.fat_size_32 as u64;
    let root_bytes = data_lba * BLOCK as u64;
    let cluster_bytes = bpb.sectors_per_cluster as usize * BLOCK;

    let mut cluster = vec![0u8; cluster_bytes];
    disk.read_at(root_bytes, &mut cluster);

    let mut run = Vec::new();
    for chunk in cluster.chunks(32) {
        if chunk[0] == 0x00 {
            break;
        }
        if chunk[0] == 0xE5 {
            run.clear();
            continue;
        }
        if is_long_entry(chunk) {
            run.push(LongDirEntry::parse(chunk));
            continue;
        }
        let sde = ShortDirEntry::parse(chunk);
        if !run.is_empty() {
            return (run, sde);
        }
    }
    panic!("no long-named entry in the root directory");
}

#[test]
fn long_name_cycle() {
    let (disk, fs) = fresh_volume();
    let name = "/This is a valid long filename.txt";

    let mut file = fs.open(name, FileMode::Write).unwrap();
    file.write(b"payload").unwrap();
    file.close().unwrap();

    // Listed and found under the same long name.
    let entries = fs.list_dir("/").unwrap();
    assert!(entries
        .iter()
        .any(|(n, _)| n == "This is a valid long filename.txt"));
    assert!(fs.path_exists(name));

    // On disk: orders run highest-first with 0x40 on the first slot, and
    // every slot carries the checksum of the trailing short name.
    let (run, sde) = first_lfn_run(&disk);
    assert_eq!(sde.name_bytes(), *b"THISIS~1TXT");
    let checksum = sfn_checksum(&sde.name_bytes());
    assert!(run[0].is_last_in_set());
    for (i, lde) in run.iter().enumerate() {
        assert_eq!(lde.checksum, checksum);
        assert_eq!(lde.sequence() as usize, run.len() - i);
    }
}

#[test]
fn delete_file_then_recreate() {
    let (_disk, fs) = fresh_volume();

    let mut file = fs.open("/t.txt", FileMode::Write).unwrap();
    file.write(b"first contents").unwrap();
    file.close().unwrap();

    fs.delete_file("/t.txt").unwrap();
    assert!(!fs.path_exists("/t.txt"));

    let mut file = fs.open("/t.txt", FileMode::Write).unwrap();
    file.write(b"second").unwrap();
    file.close().unwrap();

    let mut file = fs.open("/t.txt", FileMode::Read).unwrap();
    let mut buf = [0u8; 64];
    let read = file.read(&mut buf).unwrap();
    assert_eq!(&buf[..read], b"second");
}

#[test]
fn delete_missing_file_fails() {
    let (_disk, fs) = fresh_volume();
    assert_eq!(
        fs.delete_file("/no_such.txt"),
        Err(Error::Dir(DirError::FileNotFound))
    );
}

#[test]
fn delete_dir_safe_and_recursive() {
    let (_disk, fs) = fresh_volume();

    fs.mkdir("/emptydir").unwrap();
    assert!(fs.path_exists("/emptydir"));
    fs.delete_dir("/emptydir", DeleteMode::Safe).unwrap();
    assert!(!fs.path_exists("/emptydir"));

    fs.mkdir("/parent").unwrap();
    fs.mkdir("/parent/inner").unwrap();
    let mut file = fs.open("/parent/inner/child.txt", FileMode::Write).unwrap();
    file.write(b"x").unwrap();
    file.close().unwrap();

    assert_eq!(
        fs.delete_dir("/parent", DeleteMode::Safe),
        Err(Error::Dir(DirError::DirNotEmpty))
    );
    assert!(fs.path_exists("/parent/inner/child.txt"));

    fs.delete_dir("/parent", DeleteMode::Recursive).unwrap();
    assert!(!fs.path_exists("/parent"));
}

#[test]
fn cluster_boundary_allocation() {
    let (_disk, fs) = fresh_volume();
    let cluster_bytes = 8 * BLOCK; // 8 GiB band formats 8 sectors/cluster

    let free_before = fs.free_clusters();
    let mut file = fs.open("/exact.bin", FileMode::Write).unwrap();
    file.write(&vec![0xABu8; cluster_bytes]).unwrap();
    file.close().unwrap();
    // Exactly one cluster for exactly cluster_bytes bytes.
    assert_eq!(fs.free_clusters(), free_before - 1);

    let free_before = fs.free_clusters();
    let mut file = fs.open("/plus1.bin", FileMode::Write).unwrap();
    file.write(&vec![0xCDu8; cluster_bytes + 1]).unwrap();
    file.close().unwrap();
    assert_eq!(fs.free_clusters(), free_before - 2);

    let mut file = fs.open("/plus1.bin", FileMode::Read).unwrap();
    let mut buf = vec![0u8; cluster_bytes + 16];
    let read = file.read(&mut buf).unwrap();
    assert_eq!(read, cluster_bytes + 1);
    assert!(buf[..read].iter().all(|&b| b == 0xCD));
}

#[test]
fn truncate_releases_tail_clusters() {
    let (_disk, fs) = fresh_volume();
    let cluster_bytes = 8 * BLOCK;

    let mut file = fs.open("/trunc.bin", FileMode::Write).unwrap();
    file.write(&vec![1u8; 3 * cluster_bytes]).unwrap();
    file.close().unwrap();
    let free_after_big = fs.free_clusters();

    let mut file = fs.open("/trunc.bin", FileMode::Write).unwrap();
    assert_eq!(file.size(), 0);
    file.write(b"small").unwrap();
    file.close().unwrap();
    // Two of the three clusters came back; the first one is kept.
    assert_eq!(fs.free_clusters(), free_after_big + 2);

    let mut file = fs.open("/trunc.bin", FileMode::Read).unwrap();
    let mut buf = [0u8; 64];
    let read = file.read(&mut buf).unwrap();
    assert_eq!(&buf[..read], b"small");
}

#[test]
fn seek_bounds_and_tell() {
    let (_disk, fs) = fresh_volume();
    let mut file = fs.open("/seek.txt", FileMode::Write).unwrap();
    file.write(b"0123456789").unwrap();
    file.flush().unwrap();

    assert_eq!(file.seek(0, SeekMode::Set).unwrap(), 0);
    assert_eq!(file.tell(), 0);
    assert_eq!(file.seek(4, SeekMode::Cur).unwrap(), 4);
    assert_eq!(file.seek(0, SeekMode::End).unwrap(), 10);
    assert_eq!(file.seek(-3, SeekMode::End).unwrap(), 7);

    assert_eq!(
        file.seek(11, SeekMode::Set),
        Err(Error::File(FileError::InvalidPosition))
    );
    assert_eq!(
        file.seek(-1, SeekMode::Set),
        Err(Error::File(FileError::InvalidSeekMode))
    );
    // Failed seeks leave the position alone.
    assert_eq!(file.tell(), 7);

    let mut buf = [0u8; 8];
    let read = file.read(&mut buf).unwrap();
    assert_eq!(&buf[..read], b"789");
    file.close().unwrap();
}

#[test]
fn overwrite_mid_file() {
    let (_disk, fs) = fresh_volume();
    let mut file = fs.open("/mid.txt", FileMode::Write).unwrap();
    file.write(b"aaaaaaaaaa").unwrap();
    file.seek(3, SeekMode::Set).unwrap();
    file.write(b"BBB").unwrap();
    file.close().unwrap();

    let mut file = fs.open("/mid.txt", FileMode::Read).unwrap();
    let mut buf = [0u8; 16];
    let read = file.read(&mut buf).unwrap();
    assert_eq!(&buf[..read], b"aaaBBBaaaa");
}

#[test]
fn open_missing_intermediate_is_invalid_path() {
    let (_disk, fs) = fresh_volume();
    assert!(matches!(
        fs.open("/a/b.txt", FileMode::Write),
        Err(Error::Name(NameError::InvalidPath))
    ));
}

#[test]
fn read_mode_rejects_writes_and_missing_files() {
    let (_disk, fs) = fresh_volume();
    assert!(matches!(
        fs.open("/absent.txt", FileMode::Read),
        Err(Error::Dir(DirError::FileNotFound))
    ));

    let mut file = fs.open("/ro.txt", FileMode::Write).unwrap();
    file.write(b"data").unwrap();
    file.close().unwrap();

    let mut file = fs.open("/ro.txt", FileMode::Read).unwrap();
    assert_eq!(
        file.write(b"nope"),
        Err(Error::File(FileError::InvalidMode))
    );
}

#[test]
fn invalid_names_are_rejected() {
    let (_disk, fs) = fresh_volume();
    assert!(fs.mkdir("/bad?name").is_err());
    assert!(fs.mkdir("/with.dot").is_err());
    assert!(fs.open("/two.dots.txt", FileMode::Write).is_err());
    assert!(fs.open("/toolongext.extens", FileMode::Write).is_err());
}

#[test]
fn fat_mirror_stays_identical() {
    let (disk, fs) = fresh_volume();
    fs.mkdir("/MYDIR").unwrap();
    let mut file = fs.open("/MYDIR/f.txt", FileMode::Write).unwrap();
    file.write(&vec![7u8; 3 * 8 * BLOCK]).unwrap();
    file.close().unwrap();
    fs.delete_file("/MYDIR/f.txt").unwrap();

    let mut boot = [0u8; BLOCK];
    disk.read_at(0, &mut boot);
    let bpb = BiosParameterBlock::parse(&boot).unwrap();

    let fat_bytes = bpb.fat_size_32 as u64 * BLOCK as u64;
    let fat1_off = bpb.reserved_sectors as u64 * BLOCK as u64;
    let fat2_off = fat1_off + fat_bytes;

    let mut fat1 = vec![0u8; fat_bytes as usize];
    let mut fat2 = vec![0u8; fat_bytes as usize];
    disk.read_at(fat1_off, &mut fat1);
    disk.read_at(fat2_off, &mut fat2);
    assert_eq!(fat1, fat2);
}

#[test]
fn free_count_survives_remount() {
    let (disk, fs) = fresh_volume();
    fs.mkdir("/MYDIR").unwrap();
    let free = fs.free_clusters();
    fs.unmount().unwrap();
    drop(fs);

    let fs = FileSystem::mount(disk).expect("remount");
    assert_eq!(fs.free_clusters(), free);
}

#[test]
fn capacity_bands() {
    let disk = MemDisk::new();
    assert_eq!(
        format(disk.clone(), 1024 * 1024 * 1024),
        Err(Error::InvalidArgument)
    );
    assert_eq!(
        format(disk.clone(), 64 * 1024 * 1024 * 1024),
        Err(Error::InvalidArgument)
    );
    format(disk.clone(), 4 * 1024 * 1024 * 1024).expect("4 GiB formats");
    FileSystem::mount(disk).expect("mounts after 4 GiB format");
}
