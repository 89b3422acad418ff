use std::path::PathBuf;

use anyhow::{Context, Result};

pub fn default_download_dir() -> Result<PathBuf> {
    let base = dirs::video_dir()
        .or_else(dirs::home_dir)
        .context("unable to resolve a download directory")?;
    Ok(base.join("giptrack"))
}
