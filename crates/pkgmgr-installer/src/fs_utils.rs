use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    Ok(())
}

/// Copies a directory tree, replacing whatever is at `destination_root`.
pub(crate) fn copy_dir_recursive(source_root: &Path, destination_root: &Path) -> Result<()> {
    if !source_root.is_dir() {
        anyhow::bail!("archive location is not a directory: {}", source_root.display());
    }

    remove_dir_if_exists(destination_root)
        .with_context(|| format!("failed clearing {}", destination_root.display()))?;
    fs::create_dir_all(destination_root)
        .with_context(|| format!("failed creating {}", destination_root.display()))?;

    let mut queue: VecDeque<(PathBuf, PathBuf)> = VecDeque::new();
    queue.push_back((source_root.to_path_buf(), destination_root.to_path_buf()));

    while let Some((from_dir, to_dir)) = queue.pop_front() {
        for entry in fs::read_dir(&from_dir)
            .with_context(|| format!("failed reading directory {}", from_dir.display()))?
        {
            let entry = entry?;
            let from_path = entry.path();
            let to_path = to_dir.join(entry.file_name());
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                fs::create_dir_all(&to_path)
                    .with_context(|| format!("failed creating directory {}", to_path.display()))?;
                queue.push_back((from_path, to_path));
            } else if file_type.is_file() {
                fs::copy(&from_path, &to_path).with_context(|| {
                    format!(
                        "failed copying file from {} to {}",
                        from_path.display(),
                        to_path.display()
                    )
                })?;
            }
        }
    }

    Ok(())
}

pub(crate) fn dir_size(root: &Path) -> Result<u64> {
    if root.is_file() {
        return Ok(fs::metadata(root)
            .with_context(|| format!("failed to stat {}", root.display()))?
            .len());
    }
    let mut total = 0;
    let mut queue = VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        for entry in
            fs::read_dir(&dir).with_context(|| format!("failed reading directory {}", dir.display()))?
        {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                queue.push_back(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}

/// Free bytes on the filesystem holding `dir`. A directory that does not
/// exist yet is measured at its nearest existing ancestor.
pub fn available_space(dir: &Path) -> Result<u64> {
    let existing = dir
        .ancestors()
        .find(|candidate| candidate.exists())
        .unwrap_or(dir);
    fs2::available_space(existing)
        .with_context(|| format!("failed to query free space of {}", existing.display()))
}

/// Immediate subdirectories, sorted by name.
pub(crate) fn child_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in
        fs::read_dir(root).with_context(|| format!("failed reading directory {}", root.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}
