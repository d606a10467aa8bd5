//! Drain signal: a sentinel file at `<base>/drain`.
//!
//! When present, the orchestrator finishes in-flight work but stops picking
//! up new board items. `drover drain` creates the file, `drover resume`
//! removes it.

use std::path::{Path, PathBuf};

use anyhow::Result;

pub struct DrainSignal(PathBuf);

impl DrainSignal {
    pub fn new(base_dir: &Path) -> Self {
        Self(base_dir.join("drain"))
    }

    pub fn is_set(&self) -> bool {
        self.0.exists()
    }

    pub fn set(&self) -> Result<()> {
        if let Some(parent) = self.0.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.0, "")?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.0.exists() {
            std::fs::remove_file(&self.0)?;
        }
        Ok(())
    }
}
