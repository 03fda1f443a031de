//! Object store transfers.
//!
//! [`ObjectUploaderFactory`] is what the upload task consumes: it turns a
//! [`TransferRequest`] into an [`ObjectTransfer`] that reports through
//! [`TransferCallbacks`]. [`S3Uploader`] is the implementation, layered over
//! the wire-level [`ObjectStoreClient`].

#[cfg(feature = "s3")]
mod aws;
pub mod chunks;
mod client;
pub mod hashing;
mod memory;
mod statistics;
mod uploader;

#[cfg(feature = "s3")]
pub use aws::AwsObjectStore;
pub use chunks::{Chunk, ChunkPlan};
pub use client::{CompletedPart, ObjectStoreClient, ObjectStoreConnector, RemoteObject};
pub use memory::MemoryObjectStore;
pub use statistics::{CountingReader, StatisticsObserver};
pub use uploader::{S3Uploader, HASH_METADATA_KEY};

use crate::clock::Clock;
use crate::content::ContentStreams;
use crate::error::{CourierError, Result};
use crate::model::{BucketConfiguration, BucketName};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use url::Url;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Where and as whom a transfer connects
#[derive(Clone, PartialEq, Eq)]
pub struct BucketTarget {
    pub endpoint: Url,
    pub region: String,
    pub bucket: BucketName,
    pub access_key: String,
    pub secret: String,
    pub path_style: bool,
}

impl From<&BucketConfiguration> for BucketTarget {
    fn from(bucket: &BucketConfiguration) -> Self {
        Self {
            endpoint: bucket.endpoint.clone(),
            region: bucket.region.clone(),
            bucket: bucket.name.clone(),
            access_key: bucket.access_key.clone(),
            secret: bucket.secret.clone(),
            path_style: bucket.access_style.path_style(),
        }
    }
}

impl fmt::Debug for BucketTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketTarget")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key", &self.access_key)
            .field("path_style", &self.path_style)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatistics {
    pub time: DateTime<Utc>,
    pub transferred: u64,
    pub expected: u64,
    pub transferred_this_period: u64,
}

impl TransferStatistics {
    /// Fraction of the expected bytes transferred so far
    pub fn progress(&self) -> f64 {
        if self.expected == 0 {
            1.0
        } else {
            (self.transferred as f64 / self.expected as f64).min(1.0)
        }
    }
}

/// Hooks a transfer reports through.
///
/// `on_statistics` may be called from the statistics observer thread.
pub trait TransferCallbacks: Send + Sync {
    fn on_statistics(&self, statistics: TransferStatistics);
    fn on_informative_event(&self, message: &str);
    fn on_error(&self, error: &CourierError);
    fn on_file_skipped(&self);
    fn on_file_successfully_uploaded(&self);
}

#[derive(Clone)]
pub struct TransferRequest {
    pub target: BucketTarget,
    pub key: String,
    pub content_type: String,
    pub size: u64,
    pub streams: Arc<dyn ContentStreams>,
    pub callbacks: Arc<dyn TransferCallbacks>,
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("target", &self.target)
            .field("key", &self.key)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// One file's transfer. Dropping the handle releases its resources.
pub trait ObjectTransfer: Send {
    fn execute(&mut self) -> Result<()>;
}

pub trait ObjectUploaderFactory: Send + Sync {
    fn create(
        &self,
        request: TransferRequest,
        clock: Arc<dyn Clock>,
    ) -> Result<Box<dyn ObjectTransfer>>;
}
