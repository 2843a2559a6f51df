// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-instance lock file.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::{debug, warn};

/// An exclusively-created file holding this process's id, removed on drop.
pub struct Lock {
    path: PathBuf,
}

impl Lock {
    /// Creates `path`, failing if it already exists.
    pub fn acquire(path: &Path) -> Result<Self, Error> {
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("unable to acquire lock file {}", path.display()))?;
        writeln!(f, "{}", std::process::id())
            .with_context(|| format!("unable to write lock file {}", path.display()))?;
        debug!("acquired lock file {}", path.display());
        Ok(Lock {
            path: path.to_owned(),
        })
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("unable to remove lock file {}: {e}", self.path.display());
        }
    }
}
