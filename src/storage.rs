//! Object storage access.
//!
//! The engine only needs three primitives: read an object, write an object and
//! list the immediate children of a prefix. Paths are URI-style strings;
//! prefixes ("directories") end with `/`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("unsupported storage scheme in '{0}'")]
    UnsupportedScheme(String),

    #[error("failed to list '{path}': {source}")]
    List {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reads the whole object at `path`.
    async fn open(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Creates or replaces the object at `path`.
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Lists the immediate children of the prefix `path`, sorted, as full
    /// paths. Child prefixes end with `/`.
    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError>;
}

/// Picks the store for a path by its scheme.
pub fn store_for(path: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match path.split_once("://") {
        None | Some(("file", _)) => Ok(Arc::new(LocalStore)),
        Some(_) => Err(StorageError::UnsupportedScheme(path.to_string())),
    }
}

/// Store backed by the local filesystem. Accepts bare paths and `file://`
/// URIs; listings keep whichever form the prefix used.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStore;

impl LocalStore {
    fn fs_path(path: &str) -> PathBuf {
        PathBuf::from(path.strip_prefix("file://").unwrap_or(path))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn open(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        tokio::fs::read(Self::fs_path(path))
            .await
            .map_err(|source| StorageError::Read {
                path: path.to_string(),
                source,
            })
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let fs_path = Self::fs_path(path);
        let write_err = |source: std::io::Error| StorageError::Write {
            path: path.to_string(),
            source,
        };
        if let Some(parent) = fs_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        tokio::fs::write(&fs_path, data).await.map_err(write_err)
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let list_err = |source: std::io::Error| StorageError::List {
            path: path.to_string(),
            source,
        };
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };

        let mut entries = tokio::fs::read_dir(Self::fs_path(&prefix))
            .await
            .map_err(list_err)?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map_err(list_err)?.is_dir();
            if is_dir {
                children.push(format!("{}{}/", prefix, name));
            } else {
                children.push(format!("{}{}", prefix, name));
            }
        }
        children.sort();
        Ok(children)
    }
}

/// Final path component, ignoring a trailing `/`.
pub fn final_component(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}
