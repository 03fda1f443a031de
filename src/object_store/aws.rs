//! AWS SDK S3 client implementation.

use std::collections::HashMap;
use std::future::Future;
use std::io::Read;
use std::sync::Arc;

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client as S3Client;
use tokio::runtime::Handle;

use super::client::{CompletedPart, ObjectStoreClient, ObjectStoreConnector, RemoteObject};
use super::BucketTarget;
use crate::error::{CourierError, Result};

/// Connector producing `aws-sdk-s3` clients with static credentials.
///
/// Transfers run on blocking worker threads; requests are driven to completion
/// on the runtime behind `handle`.
#[derive(Debug, Clone)]
pub struct AwsObjectStore {
    handle: Handle,
}

impl AwsObjectStore {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Connector bound to the runtime of the calling async context
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| CourierError::Other(format!("No tokio runtime: {}", e)))
    }
}

impl ObjectStoreConnector for AwsObjectStore {
    fn connect(&self, target: &BucketTarget) -> Result<Arc<dyn ObjectStoreClient>> {
        let credentials = Credentials::new(
            &target.access_key,
            &target.secret,
            None,
            None,
            "s3-courier",
        );

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(target.region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(target.endpoint.as_str())
            .force_path_style(target.path_style)
            .build();

        Ok(Arc::new(AwsClient {
            s3_client: S3Client::from_conf(config),
            handle: self.handle.clone(),
        }))
    }
}

struct AwsClient {
    s3_client: S3Client,
    handle: Handle,
}

impl AwsClient {
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

fn sdk_error<E>(operation: &str, err: E) -> CourierError
where
    E: std::error::Error,
{
    CourierError::Transfer(format!("{} failed: {}", operation, DisplayErrorContext(err)))
}

fn read_body(body: &mut dyn Read, size: u64) -> Result<ByteStream> {
    let mut data = Vec::with_capacity(size as usize);
    body.read_to_end(&mut data)?;
    if data.len() as u64 != size {
        return Err(CourierError::Transfer(format!(
            "Read {} bytes but expected {}",
            data.len(),
            size
        )));
    }
    Ok(ByteStream::from(data))
}

impl ObjectStoreClient for AwsClient {
    fn head_object(&self, bucket: &str, key: &str) -> Result<Option<RemoteObject>> {
        let request = self.s3_client.head_object().bucket(bucket).key(key);

        match self.block_on(request.send()) {
            Ok(output) => {
                let metadata: HashMap<String, String> = output
                    .metadata()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();

                Ok(Some(RemoteObject {
                    size: output.content_length().map(|l| l as u64).unwrap_or(0),
                    metadata,
                }))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(sdk_error("HeadObject", service_err))
                }
            }
        }
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
        body: &mut dyn Read,
        size: u64,
    ) -> Result<()> {
        let body = read_body(body, size)?;

        let request = self
            .s3_client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .content_length(size as i64)
            .set_metadata(Some(metadata.clone()))
            .body(body);

        self.block_on(request.send())
            .map_err(|err| sdk_error("PutObject", err))?;
        Ok(())
    }

    fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        let request = self
            .s3_client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(metadata.clone()));

        let output = self
            .block_on(request.send())
            .map_err(|err| sdk_error("CreateMultipartUpload", err))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| CourierError::Transfer("CreateMultipartUpload returned no upload id".to_string()))
    }

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &mut dyn Read,
        size: u64,
    ) -> Result<String> {
        let body = read_body(body, size)?;

        let request = self
            .s3_client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .content_length(size as i64)
            .body(body);

        let output = self
            .block_on(request.send())
            .map_err(|err| sdk_error("UploadPart", err))?;

        output.e_tag().map(str::to_string).ok_or_else(|| {
            CourierError::Transfer(format!("UploadPart {} returned no entity tag", part_number))
        })
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let completed: Vec<S3CompletedPart> = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let request = self
            .s3_client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            );

        self.block_on(request.send())
            .map_err(|err| sdk_error("CompleteMultipartUpload", err))?;
        Ok(())
    }

    fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let request = self
            .s3_client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id);

        self.block_on(request.send())
            .map_err(|err| sdk_error("AbortMultipartUpload", err))?;
        Ok(())
    }
}
