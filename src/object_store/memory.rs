//! In-process object store.
//!
//! Behaves like a single S3 endpoint holding any number of buckets. Used by tests
//! and for dry runs.

use super::client::{CompletedPart, ObjectStoreClient, ObjectStoreConnector, RemoteObject};
use super::hashing::sha256_hex;
use super::BucketTarget;
use crate::error::{CourierError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: HashMap<String, String>,
}

#[derive(Debug)]
struct PendingMultipart {
    bucket: String,
    key: String,
    metadata: HashMap<String, String>,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    pending: Mutex<HashMap<String, PendingMultipart>>,
    access_keys: Option<HashSet<String>>,
    puts: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    state: Arc<MemoryState>,
}

impl MemoryObjectStore {
    /// A store accepting any credentials
    pub fn new() -> Self {
        Self::default()
    }

    /// A store rejecting every access key not listed
    pub fn with_access_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Arc::new(MemoryState {
                access_keys: Some(keys.into_iter().map(Into::into).collect()),
                ..MemoryState::default()
            }),
        }
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .objects
            .lock()
            .ok()?
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    pub fn object_metadata(&self, bucket: &str, key: &str) -> Option<HashMap<String, String>> {
        self.state
            .objects
            .lock()
            .ok()?
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.metadata.clone())
    }

    pub fn object_count(&self) -> usize {
        self.state.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    /// Completed single and multipart uploads
    pub fn put_count(&self) -> usize {
        self.state.puts.load(Ordering::SeqCst)
    }

    pub fn pending_multipart_count(&self) -> usize {
        self.state.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl ObjectStoreConnector for MemoryObjectStore {
    fn connect(&self, target: &BucketTarget) -> Result<Arc<dyn ObjectStoreClient>> {
        let authorized = self
            .state
            .access_keys
            .as_ref()
            .map_or(true, |keys| keys.contains(&target.access_key));
        Ok(Arc::new(MemoryClient {
            state: self.state.clone(),
            authorized,
        }))
    }
}

struct MemoryClient {
    state: Arc<MemoryState>,
    authorized: bool,
}

impl MemoryClient {
    fn authorize(&self) -> Result<()> {
        if self.authorized {
            Ok(())
        } else {
            Err(CourierError::Transfer(
                "Access Denied (Service: S3, Status Code: 403)".to_string(),
            ))
        }
    }
}

fn read_exact_body(body: &mut dyn Read, size: u64) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(size as usize);
    body.read_to_end(&mut data)?;
    if data.len() as u64 != size {
        return Err(CourierError::Transfer(format!(
            "Body length {} does not match declared size {}",
            data.len(),
            size
        )));
    }
    Ok(data)
}

impl ObjectStoreClient for MemoryClient {
    fn head_object(&self, bucket: &str, key: &str) -> Result<Option<RemoteObject>> {
        self.authorize()?;
        let objects = self.state.objects.lock()?;
        Ok(objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| RemoteObject {
                size: o.data.len() as u64,
                metadata: o.metadata.clone(),
            }))
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        _content_type: &str,
        metadata: &HashMap<String, String>,
        body: &mut dyn Read,
        size: u64,
    ) -> Result<()> {
        self.authorize()?;
        let data = read_exact_body(body, size)?;
        self.state.objects.lock()?.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                metadata: metadata.clone(),
            },
        );
        self.state.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        _content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        self.authorize()?;
        let upload_id = Uuid::new_v4().to_string();
        self.state.pending.lock()?.insert(
            upload_id.clone(),
            PendingMultipart {
                bucket: bucket.to_string(),
                key: key.to_string(),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: &mut dyn Read,
        size: u64,
    ) -> Result<String> {
        self.authorize()?;
        let data = read_exact_body(body, size)?;
        let etag = sha256_hex(&data);
        let mut pending = self.state.pending.lock()?;
        let upload = pending.get_mut(upload_id).ok_or_else(|| {
            CourierError::Transfer(format!("No such multi-part upload: {}", upload_id))
        })?;
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    fn complete_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        self.authorize()?;
        let upload = self.state.pending.lock()?.remove(upload_id).ok_or_else(|| {
            CourierError::Transfer(format!("No such multi-part upload: {}", upload_id))
        })?;

        let mut data = Vec::new();
        for (index, part) in parts.iter().enumerate() {
            if part.part_number as usize != index + 1 {
                return Err(CourierError::Transfer(format!(
                    "Parts out of order at part {}",
                    part.part_number
                )));
            }
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => data.extend_from_slice(bytes),
                _ => {
                    return Err(CourierError::Transfer(format!(
                        "Invalid part {}",
                        part.part_number
                    )))
                }
            }
        }

        self.state.objects.lock()?.insert(
            (upload.bucket, upload.key),
            StoredObject {
                data,
                metadata: upload.metadata,
            },
        );
        self.state.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort_multipart_upload(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<()> {
        self.authorize()?;
        self.state.pending.lock()?.remove(upload_id);
        Ok(())
    }
}
