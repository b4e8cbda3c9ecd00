//! Key-addressed byte store abstraction.
//!
//! This is the one primitive the commit engine is built on: a conditional
//! `put` that reports `AlreadyExists` as a distinct, atomic outcome rather
//! than racing a read-then-write against the backend.

mod local;
mod memory;

pub use local::LocalFsObjectStore;
pub use memory::InMemoryObjectStore;

use async_trait::async_trait;
use bytes::Bytes;
use doxa_common::error::{Error, Result};

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub size: u64,
    pub etag: String,
}

/// An object returned by `list`.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub objects: Vec<ObjectMeta>,
    pub truncated: bool,
}

/// Conditional-write preconditions for `put`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// `ifNoneMatch: "*"` — create-only. The write fails with
    /// `Error::AlreadyExists` if the key is already present.
    pub if_none_match_star: bool,
    /// `ifMatch: etag` — replace-only. The write fails with
    /// `Error::AlreadyExists` if the current etag differs (reusing the same
    /// error kind; the distinguishing fact callers need is "my precondition
    /// failed", not which precondition).
    pub if_match: Option<String>,
}

impl PutOptions {
    pub fn create_only() -> Self {
        Self {
            if_none_match_star: true,
            if_match: None,
        }
    }

    pub fn replace_only(etag: impl Into<String>) -> Self {
        Self {
            if_none_match_star: false,
            if_match: Some(etag.into()),
        }
    }
}

/// A flat key-addressed byte store with conditional writes.
///
/// Implementers must back create-only puts with a mechanism that checks
/// existence and writes atomically — a plain read-then-write race is not a
/// conforming implementation, since concurrent commit attempts rely on the
/// atomicity to detect conflicts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Reads `length` bytes starting at `offset`. Implementations must
    /// reject `length == 0` or reads past the object's end with
    /// `Error::ReadError`.
    async fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Bytes>;

    async fn head(&self, key: &str) -> Result<ObjectHead>;

    /// Writes `value` to `key` subject to `opts`. Returns the new etag.
    /// Returns `Error::AlreadyExists` if a precondition in `opts` fails.
    async fn put(&self, key: &str, value: Bytes, opts: PutOptions) -> Result<String>;

    /// Best-effort delete of every key in `keys`; missing keys are not an
    /// error.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    async fn list(&self, prefix: &str, opts: ListOptions) -> Result<ListResult>;
}

/// Validates a range request's bounds before any implementation does I/O,
/// rejecting a negative start or a non-positive length up front.
pub fn validate_range(start: i64, end: i64) -> Result<()> {
    if start < 0 {
        return Err(Error::ReadError(format!("range start {start} is negative")));
    }
    if end <= start {
        return Err(Error::ReadError(format!(
            "range end {end} must be greater than start {start}"
        )));
    }
    Ok(())
}
