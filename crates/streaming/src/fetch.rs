//! The transport seam: how raw chunk bytes are obtained.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use runtime::CancellationToken;
use serde::{Deserialize, Serialize};

use crate::payload::DecodeError;
use crate::request::{GridPosition, SourceId};
use crate::source::SourceDescriptor;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything a data source needs to fetch one chunk.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source: SourceId,
    pub descriptor: Arc<SourceDescriptor>,
    pub position: GridPosition,
    /// 1 for the first attempt.
    pub attempt: u32,
    /// Cancelled when nobody wants the chunk anymore. Sources with their own
    /// transport should stop once this fires; the result is discarded anyway.
    pub cancel: CancellationToken,
}

/// A chunk store reachable by URL. The returned future is polled on the
/// owner's runtime and must not borrow from `self`.
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<Vec<u8>, FetchError>>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// The chunk does not exist. Never retried.
    NotFound,
    /// Timeouts, throttling, server errors. Retried with backoff.
    Transient,
    /// Anything else the request itself is to blame for. Never retried.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Permanent, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FetchErrorKind::Transient
    }

    /// Classifies a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Option<Self> {
        classify_status(status).map(|kind| Self::new(kind, message))
    }
}

/// `None` for success statuses. 408, 429 and every 5xx are transient, 404 is
/// not-found, any other status is permanent.
pub fn classify_status(status: u16) -> Option<FetchErrorKind> {
    match status {
        200..=299 => None,
        404 => Some(FetchErrorKind::NotFound),
        408 | 429 | 500..=599 => Some(FetchErrorKind::Transient),
        _ => Some(FetchErrorKind::Permanent),
    }
}

/// Why a chunk request did not produce data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("fetch failed: {0}")]
    Fetch(FetchError),
    #[error("fetch failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: FetchError },
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("chunk was disposed before it became resident")]
    Disposed,
    #[error("request was withdrawn")]
    Cancelled,
}
