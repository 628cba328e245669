//! Filesystem moves for backup, restore, and staging.
//!
//! Everything here moves trees by `rename` with a copy-and-delete fallback
//! for cross-device moves. These helpers never consult the cancellation
//! token: the restore path must keep working after an abort.

use std::path::{Path, PathBuf};

use crate::error::{FragmenterError, FragmenterResult};
use crate::events::EventSink;

/// Collision policy when a move target already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    /// Leave the existing file in place and skip the source.
    Skip,
    /// Replace the existing file.
    Replace,
}

/// Count regular files under `dir`, recursively. Missing dir counts zero.
pub async fn count_files(dir: &Path) -> FragmenterResult<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut count = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .map_err(|e| FragmenterError::from_io(&e, &current))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FragmenterError::from_io(&e, &current))?
        {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Move one file, creating the target's parent directories.
pub async fn move_file(source: &Path, target: &Path, overwrite: Overwrite) -> FragmenterResult<bool> {
    if target.exists() {
        match overwrite {
            Overwrite::Skip => return Ok(false),
            Overwrite::Replace => {
                tokio::fs::remove_file(target)
                    .await
                    .map_err(|e| FragmenterError::from_io(&e, target))?;
            }
        }
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FragmenterError::from_io(&e, parent))?;
    }

    if tokio::fs::rename(source, target).await.is_err() {
        // Rename can fail across filesystems; fall back to copy + delete.
        tokio::fs::copy(source, target)
            .await
            .map_err(|e| FragmenterError::from_io(&e, target))?;
        tokio::fs::remove_file(source)
            .await
            .map_err(|e| FragmenterError::from_io(&e, source))?;
    }
    Ok(true)
}

/// Recursively move every file under `source` into `target`, preserving
/// relative paths. Returns the number of files moved. Empty source
/// directories are left behind and deleted with the temp root.
pub async fn move_tree(source: &Path, target: &Path, overwrite: Overwrite) -> FragmenterResult<u64> {
    move_tree_inner(source, target, overwrite, &mut |_| {}).await
}

/// [`move_tree`] with file-count copy events for one module.
pub async fn move_tree_with_events(
    sink: &dyn EventSink,
    module: &str,
    source: &Path,
    target: &Path,
    overwrite: Overwrite,
) -> FragmenterResult<u64> {
    let total = count_files(source).await?;
    sink.copy_started(module);
    let moved = move_tree_inner(source, target, overwrite, &mut |moved| {
        sink.copy_progress(module, moved, total);
    })
    .await?;
    sink.copy_finished(module);
    Ok(moved)
}

async fn move_tree_inner(
    source: &Path,
    target: &Path,
    overwrite: Overwrite,
    on_file_moved: &mut dyn FnMut(u64),
) -> FragmenterResult<u64> {
    if !source.exists() {
        return Ok(0);
    }
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| FragmenterError::from_io(&e, target))?;

    let mut moved = 0;
    let mut pending = vec![source.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .map_err(|e| FragmenterError::from_io(&e, &current))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FragmenterError::from_io(&e, &current))?
        {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let relative = path
                    .strip_prefix(source)
                    .expect("walked path is under its root")
                    .to_path_buf();
                if move_file(&path, &target.join(&relative), overwrite).await? {
                    moved += 1;
                    on_file_moved(moved);
                }
            }
        }
    }
    Ok(moved)
}

/// Copy one file, creating the target's parent directories.
async fn copy_file(source: &Path, target: &Path) -> FragmenterResult<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FragmenterError::from_io(&e, parent))?;
    }
    tokio::fs::copy(source, target)
        .await
        .map_err(|e| FragmenterError::from_io(&e, target))?;
    Ok(())
}

/// Recursively copy every file under `source` into `target`.
///
/// Used to bring backed-up trees back while an install is still in
/// flight: the backup must stay complete until the run succeeds, so the
/// restore path can always reproduce the pre-install tree.
pub async fn copy_tree(source: &Path, target: &Path) -> FragmenterResult<u64> {
    if !source.exists() {
        return Ok(0);
    }
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| FragmenterError::from_io(&e, target))?;

    let mut copied = 0;
    let mut pending = vec![source.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .map_err(|e| FragmenterError::from_io(&e, &current))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FragmenterError::from_io(&e, &current))?
        {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let relative = path
                    .strip_prefix(source)
                    .expect("walked path is under its root");
                copy_file(&path, &target.join(relative)).await?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

/// Copy a set of listed relative paths from one root to another.
/// Missing sources are skipped.
pub async fn copy_listed_files(
    files: &[String],
    source_root: &Path,
    target_root: &Path,
) -> FragmenterResult<u64> {
    let mut copied = 0;
    for relative in files {
        let source = source_root.join(relative);
        if source.exists() {
            copy_file(&source, &target_root.join(relative)).await?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Move a set of listed relative paths from one root to another.
/// Missing sources are skipped.
pub async fn move_listed_files(
    files: &[String],
    source_root: &Path,
    target_root: &Path,
    overwrite: Overwrite,
) -> FragmenterResult<u64> {
    let mut moved = 0;
    for relative in files {
        let source = source_root.join(relative);
        if source.exists() && move_file(&source, &target_root.join(relative), overwrite).await? {
            moved += 1;
        }
    }
    Ok(moved)
}

/// Delete listed relative paths under a root. Missing files are skipped.
pub async fn remove_listed_files(files: &[String], root: &Path) -> FragmenterResult<()> {
    for relative in files {
        let path = root.join(relative);
        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| FragmenterError::from_io(&e, &path))?;
        }
    }
    Ok(())
}

/// Remove every entry inside `dir`, leaving `dir` itself in place.
pub async fn empty_dir(dir: &Path) -> FragmenterResult<()> {
    if !dir.exists() {
        return Ok(());
    }
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| FragmenterError::from_io(&e, dir))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FragmenterError::from_io(&e, dir))?
    {
        let path = entry.path();
        let result = if path.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|e| FragmenterError::from_io(&e, &path))?;
    }
    Ok(())
}

/// Remove a file or directory if present.
pub async fn remove_if_exists(path: &Path) -> FragmenterResult<()> {
    if !path.exists() {
        return Ok(());
    }
    let result = if path.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    result.map_err(|e| FragmenterError::from_io(&e, path))
}

/// Relative paths of every file under `root`, for tree comparisons.
pub fn list_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                files.push(relative.to_path_buf());
            }
        }
    }
    files.sort();
    files
}
