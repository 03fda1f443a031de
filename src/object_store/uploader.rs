//! Content-addressed uploads.
//!
//! A file is skipped when the remote object already carries the same size and
//! SHA256 metadata; otherwise it is sent as a single PUT or, above the multipart
//! threshold, as a planned multipart upload. Every upload is verified with a
//! second HEAD afterwards.

use super::chunks;
use super::client::{CompletedPart, ObjectStoreClient, ObjectStoreConnector};
use super::hashing::sha256_base64;
use super::statistics::{CountingReader, StatisticsObserver};
use super::{ObjectTransfer, ObjectUploaderFactory, TransferRequest};
use crate::clock::Clock;
use crate::config::CourierConfig;
use crate::error::{CourierError, Result};
use crate::logging::{log_debug, log_warn};
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

/// User metadata key holding the base64 SHA256 of the object content
pub const HASH_METADATA_KEY: &str = "courier-sha256";

#[derive(Debug, Clone, Copy)]
struct UploadLimits {
    multipart_threshold: u64,
    minimum_chunk_size: u64,
    maximum_chunk_count: u64,
    statistics_interval: Duration,
}

pub struct S3Uploader {
    connector: Arc<dyn ObjectStoreConnector>,
    limits: UploadLimits,
}

impl S3Uploader {
    pub fn new(connector: Arc<dyn ObjectStoreConnector>, config: &CourierConfig) -> Self {
        Self {
            connector,
            limits: UploadLimits {
                multipart_threshold: config.multipart_threshold,
                minimum_chunk_size: config.minimum_chunk_size,
                maximum_chunk_count: config.maximum_chunk_count,
                statistics_interval: config.statistics_interval(),
            },
        }
    }
}

impl ObjectUploaderFactory for S3Uploader {
    fn create(
        &self,
        request: TransferRequest,
        clock: Arc<dyn Clock>,
    ) -> Result<Box<dyn ObjectTransfer>> {
        let client = self.connector.connect(&request.target)?;
        Ok(Box::new(S3Transfer {
            request,
            client,
            clock,
            limits: self.limits,
            counter: Arc::new(AtomicU64::new(0)),
            observer: None,
        }))
    }
}

struct S3Transfer {
    request: TransferRequest,
    client: Arc<dyn ObjectStoreClient>,
    clock: Arc<dyn Clock>,
    limits: UploadLimits,
    counter: Arc<AtomicU64>,
    observer: Option<StatisticsObserver>,
}

impl ObjectTransfer for S3Transfer {
    fn execute(&mut self) -> Result<()> {
        let result = self.run();
        // The observer's final sample lands before any completion callback
        self.observer.take();
        match result {
            Ok(outcome) => {
                match outcome {
                    Outcome::Skipped => self.request.callbacks.on_file_skipped(),
                    Outcome::Uploaded => self.request.callbacks.on_file_successfully_uploaded(),
                }
                Ok(())
            }
            Err(e) => {
                self.request.callbacks.on_error(&e);
                Err(e)
            }
        }
    }
}

enum Outcome {
    Skipped,
    Uploaded,
}

impl S3Transfer {
    fn event(&self, message: &str) {
        self.request.callbacks.on_informative_event(message);
    }

    fn bucket(&self) -> &str {
        self.request.target.bucket.as_str()
    }

    fn run(&mut self) -> Result<Outcome> {
        let key = self.request.key.clone();
        let size = self.request.size;

        self.event("Calculating local content hash.");
        let (local_hash, hashed_size) = sha256_base64(&mut *self.request.streams.open()?)?;
        if hashed_size != size {
            return Err(CourierError::Transfer(format!(
                "Local file size changed (expected {} bytes, read {})",
                size, hashed_size
            )));
        }
        self.event(&format!("Local content hash: {}", local_hash));

        self.event("Fetching remote content hash.");
        match self.client.head_object(self.bucket(), &key)? {
            None => self.event("Remote file does not exist. Upload is required."),
            Some(remote) => {
                let remote_hash = remote
                    .metadata
                    .get(HASH_METADATA_KEY)
                    .map(String::as_str)
                    .unwrap_or("");
                self.event(&format!("Remote content hash: {}", remote_hash));

                if remote_hash == local_hash && remote.size == size {
                    self.event("Hashes match, no upload is required.");
                    return Ok(Outcome::Skipped);
                }
                self.event("Hashes do not match. Upload is required.");
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert(HASH_METADATA_KEY.to_string(), local_hash.clone());

        self.event("Uploading file.");
        self.observer = Some(StatisticsObserver::spawn(
            self.counter.clone(),
            size,
            self.limits.statistics_interval,
            self.clock.clone(),
            self.request.callbacks.clone(),
        )?);

        if size < self.limits.multipart_threshold {
            self.upload_single(&key, &metadata)?;
        } else {
            self.upload_multipart(&key, &metadata)?;
        }

        match self.client.head_object(self.bucket(), &key)? {
            Some(remote)
                if remote.size == size
                    && remote.metadata.get(HASH_METADATA_KEY) == Some(&local_hash) => {}
            _ => {
                return Err(CourierError::Transfer(
                    "After uploading, the size or hash does not match!".to_string(),
                ))
            }
        }

        self.event("Uploading completed.");
        Ok(Outcome::Uploaded)
    }

    fn upload_single(&self, key: &str, metadata: &HashMap<String, String>) -> Result<()> {
        let mut body = CountingReader::new(self.request.streams.open()?, self.counter.clone());
        self.client.put_object(
            self.bucket(),
            key,
            &self.request.content_type,
            metadata,
            &mut body,
            self.request.size,
        )
    }

    fn upload_multipart(&self, key: &str, metadata: &HashMap<String, String>) -> Result<()> {
        let plan = chunks::plan(
            self.request.size,
            self.limits.minimum_chunk_size,
            self.limits.maximum_chunk_count,
        )?;

        self.event(&format!("Uploading as {} chunks.", plan.len()));
        self.event("Requesting multi-part upload…");
        let upload_id = self.client.create_multipart_upload(
            self.bucket(),
            key,
            &self.request.content_type,
            metadata,
        )?;

        match self.upload_parts(key, &upload_id, plan) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(abort_error) =
                    self.client
                        .abort_multipart_upload(self.bucket(), key, &upload_id)
                {
                    log_warn(
                        "object-store",
                        &format!(
                            "⚠ Failed to abort multi-part upload {} for {}: {}",
                            upload_id, key, abort_error
                        ),
                    )
                    .unwrap_or_default();
                }
                Err(e)
            }
        }
    }

    fn upload_parts(&self, key: &str, upload_id: &str, plan: chunks::ChunkPlan) -> Result<()> {
        // Parts are contiguous, so one stream serves all of them in order
        let mut stream = CountingReader::new(self.request.streams.open()?, self.counter.clone());
        let mut parts = Vec::with_capacity(plan.len());

        for chunk in plan {
            self.event(&format!(
                "Uploading part {} (Size {})…",
                chunk.part_number, chunk.size
            ));
            let mut body = (&mut stream).take(chunk.size);
            let etag = self.client.upload_part(
                self.bucket(),
                key,
                upload_id,
                chunk.part_number,
                &mut body,
                chunk.size,
            )?;
            log_debug(
                "object-store",
                &format!("Uploaded part {} of {} ({})", chunk.part_number, key, etag),
            )
            .unwrap_or_default();
            parts.push(CompletedPart {
                part_number: chunk.part_number,
                etag,
            });
        }

        self.event("Completing multi-part upload…");
        self.client
            .complete_multipart_upload(self.bucket(), key, upload_id, &parts)
    }
}
