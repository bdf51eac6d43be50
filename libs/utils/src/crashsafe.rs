use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

/// Adds a suffix to the file(directory) name, either appending the suffix to the end of its extension,
/// or if there's no extension, creates one and puts a suffix there.
pub fn path_with_suffix_extension(
    original_path: impl AsRef<Utf8Path>,
    suffix: &str,
) -> Utf8PathBuf {
    let new_extension = match original_path.as_ref().extension() {
        Some(extension) => format!("{extension}.{suffix}"),
        None => suffix.to_string(),
    };
    original_path.as_ref().with_extension(new_extension)
}

pub fn fsync_file_and_parent(file_path: &Utf8Path) -> anyhow::Result<()> {
    let parent = file_path
        .parent()
        .with_context(|| format!("File {file_path} has no parent"))?;

    fsync(file_path)?;
    fsync(parent)?;
    Ok(())
}

pub fn fsync(path: &Utf8Path) -> anyhow::Result<()> {
    File::open(path)
        .context("Failed to open the file")
        .and_then(|file| file.sync_all().context("Failed to sync file metadata"))
        .with_context(|| format!("Failed to fsync file {path}"))
}

pub async fn fsync_async(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    tokio::fs::File::open(path.as_ref()).await?.sync_all().await
}

/// Similar to [`std::fs::create_dir`], except we fsync the
/// created directory and its parent.
pub fn create_dir(path: impl AsRef<Utf8Path>) -> anyhow::Result<()> {
    let directory_path = path.as_ref();

    fs::create_dir(directory_path)
        .with_context(|| format!("Failed to create directory {directory_path}"))?;
    fsync_file_and_parent(directory_path).context("failed to fsync created directory")?;
    Ok(())
}

/// Similar to [`std::fs::create_dir_all`], except we fsync all
/// newly created directories and the pre-existing parent.
pub fn create_dir_all(path: impl AsRef<Utf8Path>) -> anyhow::Result<()> {
    let mut path = path.as_ref();

    let mut dirs_to_create = Vec::new();

    // Figure out which directories we need to create.
    loop {
        match path.metadata() {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => anyhow::bail!("non-directory found in path: {path}"),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => anyhow::bail!("Error during path {path} metadata retrieval: {e}"),
        }

        dirs_to_create.push(path);

        match path.parent() {
            Some(parent) => path = parent,
            None => anyhow::bail!("can't find parent of path '{path}'"),
        }
    }

    // Create directories from parent to child.
    for &path in dirs_to_create.iter().rev() {
        match fs::create_dir(path) {
            Ok(()) => {}
            // lost a race with a concurrent creator
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to create directory {path}")),
        }
    }

    // Fsync the created directories from child to parent.
    for &path in dirs_to_create.iter() {
        fsync(path)?;
    }

    // If we created any new directories, fsync the parent.
    if !dirs_to_create.is_empty() {
        fsync(path)?;
    }

    Ok(())
}

/// Rename `old_path` to `new_path` and make the result survive a crash.
///
/// The sequence follows durable_rename from postgres' file_utils.c:
///     fsync(old)
///     rename(old, new)
///     fsync(new)
///     fsync(parent)
/// With `do_fsync` unset this is a plain rename.
pub fn durable_rename_sync(
    old_path: &Utf8Path,
    new_path: &Utf8Path,
    do_fsync: bool,
) -> anyhow::Result<()> {
    if do_fsync {
        fsync(old_path)?;
    }
    fs::rename(old_path, new_path)
        .with_context(|| format!("failed to rename {old_path} to {new_path}"))?;
    if do_fsync {
        fsync_file_and_parent(new_path)?;
    }
    Ok(())
}

/// Async version of [`durable_rename_sync`].
pub async fn durable_rename(
    old_path: impl AsRef<Utf8Path>,
    new_path: impl AsRef<Utf8Path>,
    do_fsync: bool,
) -> io::Result<()> {
    let old_path = old_path.as_ref();
    let new_path = new_path.as_ref();
    if do_fsync {
        fsync_async(old_path).await?;
    }
    tokio::fs::rename(old_path, new_path).await?;
    if do_fsync {
        fsync_async(new_path).await?;
        if let Some(parent) = new_path.parent() {
            fsync_async(parent).await?;
        }
    }
    Ok(())
}

/// Write `contents` to `final_path` through a temporary sibling file, so
/// that readers only ever observe the old or the new version.
pub fn overwrite_with_sync(
    final_path: &Utf8Path,
    tmp_path: &Utf8Path,
    contents: &[u8],
    do_fsync: bool,
) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp_path)
        .with_context(|| format!("failed to create temporary file {tmp_path}"))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write temporary file {tmp_path}"))?;
    if do_fsync {
        file.sync_all()
            .with_context(|| format!("failed to fsync temporary file {tmp_path}"))?;
    }
    drop(file);
    durable_rename_sync(tmp_path, final_path, do_fsync)
}
