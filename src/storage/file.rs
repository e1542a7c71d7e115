//! Memory-mapped extent file.
//!
//! A database file is a sequence of fixed-size blocks:
//!
//! ```text
//! Offset 0:                FileHeader (128 bytes) + unused remainder of block 0
//! Offset NODE_BLOCK_SIZE:  block 1 (a node extent)
//! Offset 2*NODE_BLOCK_SIZE: block 2
//! ...
//! ```
//!
//! The file is mapped with `memmap2` and grown in whole blocks. Growth
//! remaps, which invalidates outstanding slices into the map; both accessors
//! borrow `self`, so the borrow checker rules out a stale slice surviving a
//! `grow()` with no runtime machinery.
//!
//! The header carries the current root's logical address. It is rewritten in
//! place on commit, after every node block of the transaction has been
//! written, so a reopened file never sees a root pointing at unwritten
//! blocks.

use std::fs::OpenOptions;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{FILE_HEADER_SIZE, NODE_BLOCK_SIZE};
use crate::storage::{Laddr, LADDR_NULL};

pub const EXTENT_MAGIC: &[u8; 16] = b"onode-tree v1\x00\x00\x00";
pub const CURRENT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 16],
    version: U32,
    block_size: U32,
    block_count: U64,
    root_laddr: U64,
    flags: U64,
    reserved: [u8; 80],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new() -> Self {
        Self {
            magic: *EXTENT_MAGIC,
            version: U32::new(CURRENT_VERSION),
            block_size: U32::new(NODE_BLOCK_SIZE as u32),
            block_count: U64::new(1),
            root_laddr: U64::new(LADDR_NULL),
            flags: U64::new(0),
            reserved: [0u8; 80],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );
        Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read FileHeader: {:?}", e))
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read FileHeader: {:?}", e))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.magic == *EXTENT_MAGIC, "bad extent file magic");
        ensure!(
            self.version.get() == CURRENT_VERSION,
            "unsupported extent file version {}",
            self.version.get()
        );
        ensure!(
            self.block_size.get() as usize == NODE_BLOCK_SIZE,
            "extent file block size {} does not match built-in {}",
            self.block_size.get(),
            NODE_BLOCK_SIZE
        );
        Ok(())
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.get()
    }

    pub fn set_block_count(&mut self, count: u64) {
        self.block_count = U64::new(count);
    }

    pub fn root_laddr(&self) -> Laddr {
        self.root_laddr.get()
    }

    pub fn set_root_laddr(&mut self, laddr: Laddr) {
        self.root_laddr = U64::new(laddr);
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ExtentFile {
    file: std::fs::File,
    mmap: MmapMut,
    block_count: u64,
}

impl ExtentFile {
    /// Creates a fresh extent file holding only the header block.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create extent file '{}'", path.display()))?;

        file.set_len(NODE_BLOCK_SIZE as u64)
            .wrap_err_with(|| format!("failed to size extent file '{}'", path.display()))?;

        // SAFETY: the file was just created with exclusive write access and is
        // not shared with external writers. The map's lifetime is tied to this
        // ExtentFile, and all access is bounds-checked through block()/block_mut().
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = FileHeader::new();
        mmap[..FILE_HEADER_SIZE].copy_from_slice(header.as_bytes());

        Ok(Self {
            file,
            mmap,
            block_count: 1,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open extent file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size >= NODE_BLOCK_SIZE as u64,
            "extent file '{}' is shorter than one block",
            path.display()
        );
        ensure!(
            file_size % NODE_BLOCK_SIZE as u64 == 0,
            "extent file '{}' size {} is not a multiple of block size {}",
            path.display(),
            file_size,
            NODE_BLOCK_SIZE
        );

        // SAFETY: same reasoning as in create(); the file is owned by this
        // process for the lifetime of the mapping.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = FileHeader::from_bytes(&mmap)?;
        header.validate()?;
        let block_count = header.block_count();
        ensure!(
            block_count == file_size / NODE_BLOCK_SIZE as u64,
            "extent file header claims {} blocks but the file holds {}",
            block_count,
            file_size / NODE_BLOCK_SIZE as u64
        );

        Ok(Self {
            file,
            mmap,
            block_count,
        })
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn root_laddr(&self) -> Result<Laddr> {
        Ok(FileHeader::from_bytes(&self.mmap)?.root_laddr())
    }

    pub fn block(&self, laddr: Laddr) -> Result<&[u8]> {
        ensure!(
            laddr != LADDR_NULL && laddr < self.block_count,
            "block {} out of bounds (block_count={})",
            laddr,
            self.block_count
        );
        let start = laddr as usize * NODE_BLOCK_SIZE;
        Ok(&self.mmap[start..start + NODE_BLOCK_SIZE])
    }

    pub fn block_mut(&mut self, laddr: Laddr) -> Result<&mut [u8]> {
        ensure!(
            laddr != LADDR_NULL && laddr < self.block_count,
            "block {} out of bounds (block_count={})",
            laddr,
            self.block_count
        );
        let start = laddr as usize * NODE_BLOCK_SIZE;
        Ok(&mut self.mmap[start..start + NODE_BLOCK_SIZE])
    }

    /// Grows the file to `new_count` blocks and remaps.
    pub fn grow(&mut self, new_count: u64) -> Result<()> {
        ensure!(
            new_count > self.block_count,
            "grow to {} blocks would shrink the file (block_count={})",
            new_count,
            self.block_count
        );

        self.mmap.flush().wrap_err("failed to flush before grow")?;
        self.file
            .set_len(new_count * NODE_BLOCK_SIZE as u64)
            .wrap_err("failed to extend extent file")?;

        // SAFETY: remapping after set_len; the old map is dropped on
        // assignment and no borrows of it can be live because grow takes
        // &mut self.
        self.mmap = unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap")? };
        self.block_count = new_count;

        let header = FileHeader::from_bytes_mut(&mut self.mmap)?;
        header.set_block_count(new_count);
        Ok(())
    }

    pub fn write_root_laddr(&mut self, laddr: Laddr) -> Result<()> {
        let header = FileHeader::from_bytes_mut(&mut self.mmap)?;
        header.set_root_laddr(laddr);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync extent file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_header_is_128_bytes() {
        assert_eq!(std::mem::size_of::<FileHeader>(), FILE_HEADER_SIZE);
    }

    #[test]
    fn create_writes_valid_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");

        let file = ExtentFile::create(&path).unwrap();
        assert_eq!(file.block_count(), 1);
        assert_eq!(file.root_laddr().unwrap(), LADDR_NULL);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");

        ExtentFile::create(&path).unwrap();
        assert!(ExtentFile::create(&path).is_err());
    }

    #[test]
    fn open_validates_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.db");
        std::fs::write(&path, vec![0u8; NODE_BLOCK_SIZE]).unwrap();

        let result = ExtentFile::open(&path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("magic"));
    }

    #[test]
    fn grow_and_block_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");

        let mut file = ExtentFile::create(&path).unwrap();
        file.grow(3).unwrap();
        assert_eq!(file.block_count(), 3);

        file.block_mut(2).unwrap().fill(0xAB);
        assert!(file.block(2).unwrap().iter().all(|&b| b == 0xAB));
        assert!(file.block(1).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn block_zero_is_not_addressable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");

        let file = ExtentFile::create(&path).unwrap();
        assert!(file.block(0).is_err());
    }

    #[test]
    fn root_laddr_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.db");

        {
            let mut file = ExtentFile::create(&path).unwrap();
            file.grow(2).unwrap();
            file.write_root_laddr(1).unwrap();
            file.sync().unwrap();
        }

        let file = ExtentFile::open(&path).unwrap();
        assert_eq!(file.root_laddr().unwrap(), 1);
        assert_eq!(file.block_count(), 2);
    }
}
