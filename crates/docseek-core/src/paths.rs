use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::BaseDirs;

#[derive(Debug, Clone)]
pub struct DocseekPaths {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub transcripts_path: PathBuf,
    pub token_cache_dir: PathBuf,
    pub socket_path: PathBuf,
}

impl DocseekPaths {
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os("DOCSEEK_DATA_DIR") {
            return Self::from_base(PathBuf::from(dir));
        }
        if let Some(base) = BaseDirs::new() {
            return Self::from_base(base.home_dir().join(".docseek"));
        }
        Self::from_base(PathBuf::from(".docseek"))
    }

    pub fn from_base(base_dir: PathBuf) -> Self {
        Self {
            config_path: base_dir.join("config.toml"),
            transcripts_path: base_dir.join("transcripts.db"),
            token_cache_dir: base_dir.join("token_cache"),
            socket_path: base_dir.join("docseek.sock"),
            base_dir,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.token_cache_dir)
            .with_context(|| format!("Failed to create {}", self.token_cache_dir.display()))?;
        Ok(())
    }
}
