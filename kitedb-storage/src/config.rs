//! Storage layer configuration.

use crate::column::CheckpointOptions;
use crate::error::Result;
use crate::page::{FilePageStore, MemPageStore, PAGE_SIZE};
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CHUNK_CAPACITY: usize = 2048;
pub const DEFAULT_NODE_GROUP_SIZE: usize = 128 * 1024;
pub const DEFAULT_SPLIT_ROWS: usize = DEFAULT_CHUNK_CAPACITY;
pub const DEFAULT_ENABLE_COMPRESSION: bool = true;
pub const DEFAULT_MAIN_FILE: &str = "main.data";
pub const DEFAULT_INIT_STORE_SIZE: Byte = Byte::from_u64(16 * 1024 * 1024);
pub const DEFAULT_MAX_STORE_SIZE: Byte = Byte::from_u64(4 * 1024 * 1024 * 1024);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    // Rows per transient chunk, also the version tracking granule.
    pub chunk_capacity: usize,
    // Maximum rows of one node group.
    pub node_group_size: usize,
    // Segment size checkpoint splits plain columns into.
    pub split_rows: usize,
    // Whether flushed chunks are bit-packed.
    pub enable_compression: bool,
    // Path of the page store file.
    pub main_file: String,
    // Initial size of the page store file.
    pub init_store_size: Byte,
    // The page store refuses to grow beyond this.
    pub max_store_size: Byte,
}

impl Default for StorageConfig {
    #[inline]
    fn default() -> Self {
        StorageConfig {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            node_group_size: DEFAULT_NODE_GROUP_SIZE,
            split_rows: DEFAULT_SPLIT_ROWS,
            enable_compression: DEFAULT_ENABLE_COMPRESSION,
            main_file: String::from(DEFAULT_MAIN_FILE),
            init_store_size: DEFAULT_INIT_STORE_SIZE,
            max_store_size: DEFAULT_MAX_STORE_SIZE,
        }
    }
}

impl StorageConfig {
    /// Rows per transient chunk.
    #[inline]
    pub fn chunk_capacity(mut self, chunk_capacity: usize) -> Self {
        assert!(chunk_capacity > 0);
        self.chunk_capacity = chunk_capacity;
        self
    }

    /// Maximum rows of one node group. Rounded up to a whole number
    /// of chunks by the table layer.
    #[inline]
    pub fn node_group_size(mut self, node_group_size: usize) -> Self {
        assert!(node_group_size >= self.chunk_capacity);
        self.node_group_size = node_group_size;
        self
    }

    /// Segment size checkpoint splits plain columns into.
    #[inline]
    pub fn split_rows(mut self, split_rows: usize) -> Self {
        assert!(split_rows > 0);
        self.split_rows = split_rows;
        self
    }

    #[inline]
    pub fn enable_compression(mut self, enable_compression: bool) -> Self {
        self.enable_compression = enable_compression;
        self
    }

    /// Page store file name.
    #[inline]
    pub fn main_file(mut self, main_file: impl Into<String>) -> Self {
        self.main_file = main_file.into();
        self
    }

    /// Prefixes the page store file with a directory.
    #[inline]
    pub fn with_main_dir(mut self, main_dir: impl AsRef<Path>) -> Self {
        let path = main_dir.as_ref().join(&self.main_file);
        self.main_file = path.to_string_lossy().to_string();
        self
    }

    /// Initial size of the page store file.
    #[inline]
    pub fn init_store_size<T>(mut self, init_store_size: T) -> Self
    where
        Byte: From<T>,
    {
        self.init_store_size = Byte::from(init_store_size);
        self
    }

    /// Upper bound the page store may grow to.
    #[inline]
    pub fn max_store_size<T>(mut self, max_store_size: T) -> Self
    where
        Byte: From<T>,
    {
        self.max_store_size = Byte::from(max_store_size);
        self
    }

    #[inline]
    fn init_pages(&self) -> u64 {
        (self.init_store_size.as_u64() / PAGE_SIZE as u64).max(1)
    }

    #[inline]
    fn max_pages(&self) -> u64 {
        (self.max_store_size.as_u64() / PAGE_SIZE as u64).max(self.init_pages())
    }

    /// Checkpoint policy derived from the sizing knobs.
    #[inline]
    pub fn checkpoint_options(&self) -> CheckpointOptions {
        CheckpointOptions {
            can_split: true,
            split_rows: self.split_rows,
        }
    }

    /// Builds an in-memory page store, for transient databases and
    /// tests.
    #[inline]
    pub fn build_mem(&self) -> MemPageStore {
        MemPageStore::new(self.init_pages(), self.max_pages())
    }

    /// Creates the page store file, truncating any existing content.
    #[inline]
    pub fn create_file(&self) -> Result<FilePageStore> {
        FilePageStore::create(&self.main_file, self.init_pages(), self.max_pages())
    }

    /// Opens an existing page store file.
    #[inline]
    pub fn open_file(&self) -> Result<FilePageStore> {
        FilePageStore::open(&self.main_file, self.max_pages())
    }
}
