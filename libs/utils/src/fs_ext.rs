/// Extensions to `std::fs` types.
use std::{fs, io};

use anyhow::Context;
use camino::Utf8Path;

pub trait PathExt {
    /// Returns an error if `self` is not a directory.
    fn is_empty_dir(&self) -> io::Result<bool>;
}

impl<P> PathExt for P
where
    P: AsRef<Utf8Path>,
{
    fn is_empty_dir(&self) -> io::Result<bool> {
        Ok(fs::read_dir(self.as_ref())?.next().is_none())
    }
}

pub async fn list_dir(path: impl AsRef<Utf8Path>) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let mut dir = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("read_dir({path})"))?;

    let mut content = vec![];
    while let Some(next) = dir.next_entry().await? {
        let file_name = next.file_name();
        content.push(file_name.to_string_lossy().to_string());
    }

    Ok(content)
}

/// Sync version of [`list_dir`]. A missing directory lists as empty.
pub fn list_dir_sync(path: impl AsRef<Utf8Path>) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let dir = match fs::read_dir(path) {
        Ok(dir) => dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read_dir({path})")),
    };

    let mut content = vec![];
    for entry in dir {
        let entry = entry.with_context(|| format!("read_dir({path})"))?;
        content.push(entry.file_name().to_string_lossy().to_string());
    }
    Ok(content)
}

/// Version of [`std::fs::remove_dir_all`] that is idempotent and tolerates parallel removals of the same path or sub-paths
///
/// The idempotency implies that we return `Ok(())` even if the file is already gone or has never existed,
/// unlike `remove_dir_all` from std/tokio.
pub fn remove_dir_all(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    fn strip_not_found<T>(v: io::Result<T>) -> Option<io::Result<T>> {
        match v {
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            other => Some(other),
        }
    }
    let path = path.as_ref();
    let Some(list) = strip_not_found(fs::read_dir(path)) else {
        return Ok(());
    };
    for entry in list? {
        let Some(entry) = strip_not_found(entry) else {
            continue;
        };
        let entry = entry?;
        let Some(file_type) = strip_not_found(entry.file_type()) else {
            continue;
        };
        let entry_path = entry.path();
        if file_type?.is_dir() {
            let Ok(entry_path) = camino::Utf8PathBuf::try_from(entry_path) else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "non-utf8 path in directory tree",
                ));
            };
            remove_dir_all(entry_path)?;
        } else {
            strip_not_found(fs::remove_file(entry_path)).unwrap_or(Ok(()))?;
        }
    }
    strip_not_found(fs::remove_dir(path)).unwrap_or(Ok(()))
}

pub fn ignore_not_found(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

pub fn ignore_absent_files<F>(fs_operation: F) -> io::Result<()>
where
    F: Fn() -> io::Result<()>,
{
    fs_operation().or_else(ignore_not_found)
}

#[cfg(test)]
mod test {
    use super::{PathExt, ignore_absent_files, list_dir, list_dir_sync, remove_dir_all};

    #[test]
    fn is_empty_dir() {
        let dir = camino_tempfile::tempdir().unwrap();
        let dir_path = dir.path();

        assert!(
            dir_path.is_empty_dir().expect("test failure"),
            "new tempdir should be empty"
        );

        // invoke on a file to ensure it returns an error
        let file_path = dir_path.join("testfile");
        std::fs::File::create(&file_path).unwrap();
        assert!(file_path.is_empty_dir().is_err());
    }

    #[test]
    fn ignore_absent_files_works() {
        let dir = camino_tempfile::tempdir().unwrap();

        let file_path = dir.path().join("testfile");

        ignore_absent_files(|| std::fs::remove_file(&file_path)).expect("should execute normally");

        std::fs::File::create(&file_path).unwrap();

        ignore_absent_files(|| std::fs::remove_file(&file_path)).expect("should execute normally");

        assert!(!file_path.exists());
    }

    #[tokio::test]
    async fn list_dir_works() {
        let dir = camino_tempfile::tempdir().unwrap();
        let dir_path = dir.path();

        assert!(list_dir(dir_path).await.unwrap().is_empty());

        std::fs::File::create(dir_path.join("testfile")).unwrap();
        std::fs::create_dir(dir_path.join("testdir")).unwrap();

        let expected = &["testdir", "testfile"];
        let mut actual = list_dir(dir_path).await.unwrap();
        actual.sort();
        assert_eq!(actual, expected);

        let mut actual = list_dir_sync(dir_path).unwrap();
        actual.sort();
        assert_eq!(actual, expected);
        assert!(list_dir_sync(dir_path.join("missing")).unwrap().is_empty());
    }

    #[test]
    fn remove_dir_all_is_idempotent() {
        let dir = camino_tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("f"), b"x").unwrap();

        remove_dir_all(dir.path().join("a")).unwrap();
        assert!(!dir.path().join("a").exists());
        remove_dir_all(dir.path().join("a")).unwrap();
    }
}
