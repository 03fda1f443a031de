//! Wire-level object store contract.

use super::BucketTarget;
use crate::error::Result;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

/// What a HEAD request reports about an existing object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub size: u64,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Blocking S3-style operations against one bucket endpoint.
///
/// Implementations are driven from worker threads, never from async tasks.
pub trait ObjectStoreClient: Send + Sync {
    /// `Ok(None)` when the key does not exist
    fn head_object(&self, bucket: &str, key: &str) -> Result<Option<RemoteObject>>;

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
        body: &mut dyn Read,
        size: u64,
    ) -> Result<()>;

    /// Returns the upload id
    fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String>;

    /// Returns the part's entity tag
    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &mut dyn Read,
        size: u64,
    ) -> Result<String>;

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;
}

/// Builds clients for bucket targets
pub trait ObjectStoreConnector: Send + Sync {
    fn connect(&self, target: &BucketTarget) -> Result<Arc<dyn ObjectStoreClient>>;
}
