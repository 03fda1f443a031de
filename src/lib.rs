// Library exports for the binary and integration tests

pub mod clock;
pub mod config;
pub mod content;
pub mod database;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;
pub mod object_store;
pub mod policy;
pub mod uploads;
pub mod validation;

pub use error::{CourierError, Result};
pub use uploads::{StartOutcome, UploadService, UploadStatus};
