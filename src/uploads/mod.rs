mod service;
mod status;
mod task;

pub use service::{StartOutcome, UploadService};
pub use status::{StatusBoard, UploadStatus};
pub use task::{
    TaskServices, UploadTask, MESSAGE_CANCELLED, MESSAGE_FILE_SKIPPED, MESSAGE_FILE_UPLOADED,
    MESSAGE_NO_BUCKET, MESSAGE_NO_UPLOAD, MESSAGE_STARTED,
};
