//! Durable records: configurations, runs and their event logs.
//!
//! Everything goes through a [`RecordTransaction`]; writes become visible to other
//! transactions only after [`RecordTransaction::commit`].

mod sqlite;

pub use sqlite::SqliteRecordStore;

use crate::error::Result;
use crate::model::{
    BucketConfiguration, BucketReferenceName, Settings, UploadConfiguration, UploadEventNew,
    UploadEventRecord, UploadId, UploadName, UploadRecord,
};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecordListParameters {
    pub newer_than: DateTime<Utc>,
    pub limit: u32,
    pub name: Option<UploadName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEventListParameters {
    pub upload_id: UploadId,
    pub newer_than: DateTime<Utc>,
    pub limit: u32,
}

pub trait RecordStore: Send + Sync {
    fn transaction(&self) -> Result<Box<dyn RecordTransaction + '_>>;
}

/// A unit of work against the record store. Dropped without commit, it rolls back.
pub trait RecordTransaction {
    fn upload_record_create(
        &mut self,
        time_start: DateTime<Utc>,
        upload_name: &UploadName,
        reason: &str,
    ) -> Result<UploadRecord>;

    /// Replaces the whole record. Finished records cannot be replaced.
    fn upload_record_update(&mut self, record: &UploadRecord) -> Result<()>;

    fn upload_record_get(&mut self, id: UploadId) -> Result<Option<UploadRecord>>;

    fn upload_record_most_recent(&mut self, name: &UploadName) -> Result<Option<UploadRecord>>;

    fn upload_record_list(
        &mut self,
        parameters: &UploadRecordListParameters,
    ) -> Result<Vec<UploadRecord>>;

    /// Deletes runs (and their events) started before `time`
    fn upload_record_delete_older_than(&mut self, time: DateTime<Utc>) -> Result<usize>;

    /// Marks every run without a result as cancelled, ending at `time`
    fn upload_record_mark_unfinished_cancelled(&mut self, time: DateTime<Utc>) -> Result<usize>;

    fn upload_event_add(&mut self, event: &UploadEventNew) -> Result<UploadEventRecord>;

    fn upload_event_list(
        &mut self,
        parameters: &UploadEventListParameters,
    ) -> Result<Vec<UploadEventRecord>>;

    fn bucket_list(&mut self) -> Result<Vec<BucketConfiguration>>;

    fn bucket_get(&mut self, name: &BucketReferenceName) -> Result<Option<BucketConfiguration>>;

    fn bucket_put(&mut self, bucket: &BucketConfiguration) -> Result<()>;

    fn bucket_delete(&mut self, name: &BucketReferenceName) -> Result<bool>;

    fn upload_configuration_list(&mut self) -> Result<Vec<UploadConfiguration>>;

    fn upload_configuration_get(
        &mut self,
        name: &UploadName,
    ) -> Result<Option<UploadConfiguration>>;

    fn upload_configuration_put(&mut self, upload: &UploadConfiguration) -> Result<()>;

    fn upload_configuration_delete(&mut self, name: &UploadName) -> Result<bool>;

    fn settings_get(&mut self) -> Result<Settings>;

    fn settings_put(&mut self, settings: &Settings) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;
}
