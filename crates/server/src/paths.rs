//! Path resolution for ntsc data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `NTSC_DATA_DIR` env > `~/.ntsc`.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Priority: `explicit` arg > `NTSC_DATA_DIR` env > `~/.ntsc` default.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let root = if let Some(p) = explicit {
            p.to_path_buf()
        } else if let Ok(env_val) = std::env::var("NTSC_DATA_DIR") {
            PathBuf::from(env_val)
        } else {
            dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("HOME directory not found; pass --data-dir"))?
                .join(".ntsc")
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("ntsc.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create all required subdirectories under the data dir.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}
