//! Filesystem-backed object store, for local development and the
//! integration tests that want something closer to real I/O than
//! [`super::InMemoryObjectStore`].

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use doxa_common::error::{Error, Result};

use super::{ListOptions, ListResult, ObjectHead, ObjectMeta, ObjectStore, PutOptions};

pub struct LocalFsObjectStore {
    root: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn etag_for(metadata: &std::fs::Metadata) -> String {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("{}-{}", metadata.len(), mtime)
    }
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| map_io_err(key, e))?;
        Ok(Bytes::from(bytes))
    }

    async fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Bytes> {
        super::validate_range(offset as i64, (offset + length) as i64)?;
        let path = self.path_for(key);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let mut file =
                std::fs::File::open(&path).map_err(|e| map_io_err(&key, e))?;
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| Error::ReadError(e.to_string()))?;
            let mut buf = vec![0u8; length as usize];
            file.read_exact(&mut buf)
                .map_err(|e| Error::ReadError(format!("short read on {key}: {e}")))?;
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn head(&self, key: &str) -> Result<ObjectHead> {
        let path = self.path_for(key);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| map_io_err(key, e))?;
        Ok(ObjectHead {
            size: meta.len(),
            etag: Self::etag_for(&meta),
        })
    }

    async fn put(&self, key: &str, value: Bytes, opts: PutOptions) -> Result<String> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let key_owned = key.to_string();
        let existing_etag = if opts.if_match.is_some() {
            std::fs::metadata(&path).ok().map(|m| Self::etag_for(&m))
        } else {
            None
        };
        if let Some(expected) = &opts.if_match {
            match &existing_etag {
                Some(actual) if actual == expected => {}
                _ => return Err(Error::AlreadyExists(key_owned)),
            }
        }

        let create_only = opts.if_none_match_star;
        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut open_opts = OpenOptions::new();
            open_opts.write(true);
            if create_only {
                open_opts.create_new(true);
            } else {
                open_opts.create(true).truncate(true);
            }
            let mut file = open_opts.open(&path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::AlreadyExists(key_owned.clone())
                } else {
                    Error::BackendUnavailable(e.to_string())
                }
            })?;
            file.write_all(&value)
                .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
            file.sync_all()
                .map_err(|e| Error::BackendUnavailable(e.to_string()))
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
        result?;

        self.head(key).await.map(|h| h.etag)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            let path = self.path_for(key);
            let _ = tokio::fs::remove_file(&path).await;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str, opts: ListOptions) -> Result<ListResult> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let limit = opts.limit;
        tokio::task::spawn_blocking(move || list_blocking(&root, &prefix, limit))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }
}

fn list_blocking(root: &Path, prefix: &str, limit: Option<usize>) -> Result<ListResult> {
    let search_root = root.join(prefix);
    let mut objects = Vec::new();

    if search_root.is_dir() {
        collect_recursive(root, &search_root, &mut objects)?;
    } else if let Some(parent) = search_root.parent() {
        if parent.is_dir() {
            collect_recursive(root, parent, &mut objects)?;
            objects.retain(|o: &ObjectMeta| o.key.starts_with(prefix));
        }
    }

    objects.sort_by(|a, b| a.key.cmp(&b.key));

    let truncated = if let Some(limit) = limit {
        let was_truncated = objects.len() > limit;
        objects.truncate(limit);
        was_truncated
    } else {
        false
    };

    Ok(ListResult { objects, truncated })
}

fn collect_recursive(root: &Path, dir: &Path, out: &mut Vec<ObjectMeta>) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|e| Error::BackendUnavailable(e.to_string()))? {
        let entry = entry.map_err(|e| Error::BackendUnavailable(e.to_string()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_recursive(root, &path, out)?;
        } else {
            let meta = entry
                .metadata()
                .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
            let key = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            out.push(ObjectMeta {
                key,
                size: meta.len(),
                etag: LocalFsObjectStore::etag_for(&meta),
            });
        }
    }
    Ok(())
}

fn map_io_err(key: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(key.to_string())
    } else {
        Error::BackendUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_only_fails_on_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        store
            .put("a.txt", Bytes::from_static(b"1"), PutOptions::create_only())
            .await
            .unwrap();
        let err = store
            .put("a.txt", Bytes::from_static(b"2"), PutOptions::create_only())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        for name in ["ns/b.parquet", "ns/a.parquet", "other/c.parquet"] {
            store
                .put(name, Bytes::from_static(b"x"), PutOptions::default())
                .await
                .unwrap();
        }
        let listed = store.list("ns/", ListOptions::default()).await.unwrap();
        let keys: Vec<_> = listed.objects.iter().map(|o| o.key.clone()).collect();
        assert_eq!(keys, vec!["ns/a.parquet", "ns/b.parquet"]);
    }
}
