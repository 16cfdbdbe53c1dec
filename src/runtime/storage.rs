//! Filesystem layout helpers and atomic write operations
//!
//! Manages the engine root (`.actionflow/` by default): the configuration
//! file, the `programs/` tree and the `cache/` directory of stored
//! responses. Writes go through a temp file and a rename.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use super::EngineConfig;

/// Storage manager rooted at one directory.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Directory holding program documents.
    pub fn programs_dir(&self) -> PathBuf {
        self.root.join("programs")
    }

    /// Directory holding cached responses.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames.
    /// Every writer gets its own temp file, so concurrent writers of one
    /// path never interleave; the last rename wins.
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        let written = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))
            .and_then(|mut file| {
                file.write_all(data).context("Failed to write data")?;
                file.sync_all().context("Failed to sync file")
            })
            .and_then(|()| {
                fs::rename(&temp_path, path)
                    .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))
            });
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }

        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .with_context(|| format!("Failed to open directory: {:?}", parent))?;
            dir.sync_all().context("Failed to sync directory")?;
        }

        Ok(())
    }

    /// Read a file
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))
    }

    /// Contents and modification time of a file, both taken from one open
    /// handle; `None` when the file does not exist.
    pub fn read_stamped(&self, path: &Path) -> Result<Option<(Vec<u8>, SystemTime)>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("Failed to open: {:?}", path)),
        };
        let modified = file
            .metadata()
            .and_then(|meta| meta.modified())
            .with_context(|| format!("Failed to read mtime: {:?}", path))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .with_context(|| format!("Failed to read file: {:?}", path))?;
        Ok(Some((data, modified)))
    }

    /// Create a directory and all parent directories
    pub fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {:?}", path))
    }
}

/// Initialize the directory layout for a new engine root
pub fn init_storage(root: &Path) -> Result<()> {
    let storage = Storage::new(root.to_path_buf());
    storage.create_dir_all(root)?;
    storage.create_dir_all(&storage.programs_dir())?;
    storage.create_dir_all(&storage.cache_dir())?;
    Ok(())
}

/// Write engine configuration
pub fn write_config(config: &EngineConfig) -> Result<()> {
    let storage = Storage::new(config.root.clone());
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    storage.write_atomic(&storage.config_path(), &json)?;
    Ok(())
}

/// Load engine configuration
pub fn load_config(root: &Path) -> Result<EngineConfig> {
    let storage = Storage::new(root.to_path_buf());
    let data = storage.read_file(&storage.config_path())?;
    let mut config: EngineConfig =
        serde_json::from_slice(&data).context("Failed to deserialize config")?;
    // The directory the file was found in wins over a stale stored root.
    config.root = root.to_path_buf();
    Ok(config)
}
