//! Domain values shared by the record store, the upload task and the registry.

use crate::error::CourierError;
use crate::validation::{validate_bucket_name, validate_name};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use url::Url;

macro_rules! validated_name {
    ($(#[$meta:meta])* $name:ident, $check:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, CourierError> {
                let value = value.into();
                $check(&value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = CourierError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

validated_name!(
    /// Unique name of an upload configuration
    UploadName,
    |v: &str| validate_name("Upload name", v)
);

validated_name!(
    /// Unique reference name of a bucket configuration
    BucketReferenceName,
    |v: &str| validate_name("Bucket reference name", v)
);

validated_name!(
    /// Name of the bucket on the object store
    BucketName,
    validate_bucket_name
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessStyle {
    PathStyle,
    VirtualHostStyle,
}

impl AccessStyle {
    pub fn path_style(self) -> bool {
        matches!(self, AccessStyle::PathStyle)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfiguration {
    pub reference_name: BucketReferenceName,
    pub name: BucketName,
    pub region: String,
    pub access_key: String,
    pub secret: String,
    pub endpoint: Url,
    pub access_style: AccessStyle,
}

impl fmt::Debug for BucketConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketConfiguration")
            .field("reference_name", &self.reference_name)
            .field("name", &self.name)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret", &"<redacted>")
            .field("endpoint", &self.endpoint.as_str())
            .field("access_style", &self.access_style)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadSchedule {
    OnlyManually,
    OnlyOnTriggers,
    EveryFiveMinutes,
    EveryTenMinutes,
    EveryTwentyMinutes,
    EveryThirtyMinutes,
    EveryHour,
    EveryTwoHours,
    EveryFourHours,
    EveryEightHours,
    EveryTwelveHours,
    EveryTwentyFourHours,
}

impl UploadSchedule {
    /// Period between scheduled runs, `None` for non-periodic schedules
    pub fn period(self) -> Option<chrono::Duration> {
        use chrono::Duration;
        match self {
            UploadSchedule::OnlyManually | UploadSchedule::OnlyOnTriggers => None,
            UploadSchedule::EveryFiveMinutes => Some(Duration::minutes(5)),
            UploadSchedule::EveryTenMinutes => Some(Duration::minutes(10)),
            UploadSchedule::EveryTwentyMinutes => Some(Duration::minutes(20)),
            UploadSchedule::EveryThirtyMinutes => Some(Duration::minutes(30)),
            UploadSchedule::EveryHour => Some(Duration::hours(1)),
            UploadSchedule::EveryTwoHours => Some(Duration::hours(2)),
            UploadSchedule::EveryFourHours => Some(Duration::hours(4)),
            UploadSchedule::EveryEightHours => Some(Duration::hours(8)),
            UploadSchedule::EveryTwelveHours => Some(Duration::hours(12)),
            UploadSchedule::EveryTwentyFourHours => Some(Duration::hours(24)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadTrigger {
    WhenPhotoTaken,
    WhenNetworkAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPolicy {
    pub schedule: UploadSchedule,
    #[serde(default)]
    pub triggers: BTreeSet<UploadTrigger>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            schedule: UploadSchedule::OnlyManually,
            triggers: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfiguration {
    pub name: UploadName,
    pub source: Url,
    pub bucket: BucketReferenceName,
    pub policy: UploadPolicy,
}

/// Why a run was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadReason {
    Manual,
    Scheduled,
    Triggered(UploadTrigger),
}

impl UploadReason {
    pub fn reason_text(self) -> &'static str {
        match self {
            UploadReason::Manual => "Upload was triggered manually.",
            UploadReason::Scheduled => "Upload was triggered due to the time-based schedule.",
            UploadReason::Triggered(UploadTrigger::WhenPhotoTaken) => {
                "Upload was triggered because a photo was taken."
            }
            UploadReason::Triggered(UploadTrigger::WhenNetworkAvailable) => {
                "Upload was triggered because the network became available."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadResult {
    Succeeded,
    Failed,
    Cancelled,
}

impl UploadResult {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadResult::Succeeded => "SUCCEEDED",
            UploadResult::Failed => "FAILED",
            UploadResult::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "SUCCEEDED" => Some(UploadResult::Succeeded),
            "FAILED" => Some(UploadResult::Failed),
            "CANCELLED" => Some(UploadResult::Cancelled),
            _ => None,
        }
    }
}

pub type UploadId = i64;
pub type EventId = i64;

/// One run of an upload configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub id: UploadId,
    pub time_start: DateTime<Utc>,
    pub time_end: Option<DateTime<Utc>>,
    pub upload_name: UploadName,
    pub bucket: Option<BucketReferenceName>,
    pub reason: String,
    pub files_required: u64,
    pub files_skipped: u64,
    pub files_uploaded: u64,
    pub files_failed: u64,
    pub result: Option<UploadResult>,
}

/// Event to be appended to a run's log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEventNew {
    pub upload_id: UploadId,
    pub time: DateTime<Utc>,
    pub message: String,
    pub file: Option<String>,
    pub exception_trace: Option<String>,
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEventRecord {
    pub id: EventId,
    pub upload_id: UploadId,
    pub time: DateTime<Utc>,
    pub message: String,
    pub file: Option<String>,
    pub exception_trace: Option<String>,
    pub failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingSettings {
    pub upload_on_wifi: bool,
    pub upload_on_cellular: bool,
}

impl Default for NetworkingSettings {
    fn default() -> Self {
        Self {
            upload_on_wifi: true,
            upload_on_cellular: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub paused: bool,
    pub networking: NetworkingSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Unavailable,
    Wifi,
    Cellular,
}
