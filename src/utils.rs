use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

pub fn app_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("app", "conjure", "conjure")
        .ok_or_else(|| anyhow!("cannot resolve project dirs"))
}

pub fn ensure_data_dir() -> Result<PathBuf> {
    let dirs = app_dirs()?;
    let data_dir = dirs.data_dir().to_path_buf();
    fs::create_dir_all(&data_dir).context("create data dir")?;
    Ok(data_dir)
}

pub fn videos_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("videos")
}

pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}
