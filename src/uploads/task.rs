//! One upload run, start to finish.
//!
//! Steps run in order: create the run record, resolve the configuration, list
//! files, upload them, finish. Cancellation is checked at the start of every step
//! and before every file, and surfaces as [`CourierError::Cancelled`], which the
//! top level turns into a cancelled run rather than a failed one.

use super::status::{StatusBoard, UploadStatus};
use crate::clock::Clock;
use crate::content::{ContentFile, ContentTreeFactory};
use crate::database::RecordStore;
use crate::error::{CourierError, Result};
use crate::logging::{log_debug, log_error, log_info, log_warn};
use crate::model::{
    BucketConfiguration, UploadConfiguration, UploadEventNew, UploadName, UploadReason,
    UploadRecord, UploadResult,
};
use crate::object_store::{
    BucketTarget, ObjectUploaderFactory, TransferCallbacks, TransferRequest, TransferStatistics,
    DEFAULT_CONTENT_TYPE,
};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub const MESSAGE_STARTED: &str = "Upload started.";
pub const MESSAGE_FILE_UPLOADED: &str = "File was successfully uploaded.";
pub const MESSAGE_FILE_SKIPPED: &str =
    "File has already been uploaded and so will not be uploaded again.";
pub const MESSAGE_CANCELLED: &str = "Upload was cancelled.";
pub const MESSAGE_NO_UPLOAD: &str = "No such upload configuration.";
pub const MESSAGE_NO_BUCKET: &str = "No such bucket configuration.";

const COMPONENT: &str = "upload-task";

/// Collaborators a task runs against
#[derive(Clone)]
pub struct TaskServices {
    pub store: Arc<dyn RecordStore>,
    pub content: Arc<dyn ContentTreeFactory>,
    pub uploader: Arc<dyn ObjectUploaderFactory>,
    pub clock: Arc<dyn Clock>,
    pub statuses: StatusBoard,
}

pub struct UploadTask {
    name: UploadName,
    reason: UploadReason,
    services: TaskServices,
    cancel: CancellationToken,
}

impl std::fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTask")
            .field("name", &self.name)
            .field("reason", &self.reason)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl UploadTask {
    pub fn new(name: UploadName, reason: UploadReason, services: TaskServices) -> Self {
        Self {
            name,
            reason,
            services,
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &UploadName {
        &self.name
    }

    pub fn reason(&self) -> UploadReason {
        self.reason
    }

    /// Request cancellation; honoured at the next checkpoint
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run to completion on the calling thread.
    ///
    /// Per-file failures and cancellation still return the finished record.
    /// Anything else fails the run and is returned as the error.
    pub fn run(&self) -> Result<UploadRecord> {
        let mut run = RunState::default();

        match self.execute_steps(&mut run) {
            Ok(record) => Ok(record),
            Err(CourierError::Cancelled) => self.set_cancelled(&run),
            Err(e) => {
                self.set_failed(&run, &e);
                Err(e)
            }
        }
    }

    fn execute_steps(&self, run: &mut RunState) -> Result<UploadRecord> {
        let recorder = self.step_create_record()?;
        run.recorder = Some(recorder.clone());

        let (upload, bucket) = self.step_resolve_configuration(&recorder)?;
        let files = self.step_list_files(&recorder, &upload)?;
        self.step_upload_files(run, &recorder, &bucket, &files)?;
        self.step_finish(run, &recorder)
    }

    fn begin_step(&self, description: &str, major_progress: f64) -> Result<()> {
        self.check_cancelled()?;
        log_debug(COMPONENT, &format!("[{}] {}", self.name, description)).unwrap_or_default();
        self.publish_running(description.to_string(), major_progress, None);
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(CourierError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn publish_running(&self, description: String, major_progress: f64, minor_progress: Option<f64>) {
        self.services.statuses.publish(
            &self.name,
            UploadStatus::Running {
                description,
                major_progress,
                minor_progress,
            },
        );
    }

    fn step_create_record(&self) -> Result<Arc<RunRecorder>> {
        self.begin_step("Creating upload record…", 0.0)?;

        let now = self.services.clock.now();
        let mut tx = self.services.store.transaction()?;
        let record = tx.upload_record_create(now, &self.name, self.reason.reason_text())?;
        tx.upload_event_add(&UploadEventNew {
            upload_id: record.id,
            time: now,
            message: MESSAGE_STARTED.to_string(),
            file: None,
            exception_trace: None,
            failed: false,
        })?;
        tx.commit()?;

        log_info(
            COMPONENT,
            &format!(
                "🚀 Upload {} started (run {}): {}",
                self.name,
                record.id,
                self.reason.reason_text()
            ),
        )
        .unwrap_or_default();

        Ok(Arc::new(RunRecorder {
            store: self.services.store.clone(),
            clock: self.services.clock.clone(),
            record: Mutex::new(record),
        }))
    }

    fn step_resolve_configuration(
        &self,
        recorder: &RunRecorder,
    ) -> Result<(UploadConfiguration, BucketConfiguration)> {
        self.begin_step("Resolving configuration…", 0.0)?;

        let mut tx = self.services.store.transaction()?;
        let upload = tx
            .upload_configuration_get(&self.name)?
            .ok_or_else(|| CourierError::Configuration(MESSAGE_NO_UPLOAD.to_string()))?;
        let bucket = tx
            .bucket_get(&upload.bucket)?
            .ok_or_else(|| CourierError::Configuration(MESSAGE_NO_BUCKET.to_string()))?;
        tx.commit()?;

        recorder.update(|record| record.bucket = Some(bucket.reference_name.clone()), None)?;
        Ok((upload, bucket))
    }

    fn step_list_files(
        &self,
        recorder: &RunRecorder,
        upload: &UploadConfiguration,
    ) -> Result<Vec<ContentFile>> {
        self.begin_step("Listing files…", 0.0)?;

        let root = self.services.content.create(&upload.source)?;
        let mut files = root.collect_files();
        // A file that keeps failing must not always block the same successors
        files.shuffle(&mut rand::thread_rng());

        let required = files.len() as u64;
        recorder.update(|record| record.files_required = required, None)?;

        log_info(
            COMPONENT,
            &format!("📁 Upload {}: {} files found in {}", self.name, required, upload.source),
        )
        .unwrap_or_default();

        Ok(files)
    }

    fn step_upload_files(
        &self,
        run: &mut RunState,
        recorder: &Arc<RunRecorder>,
        bucket: &BucketConfiguration,
        files: &[ContentFile],
    ) -> Result<()> {
        self.begin_step("Uploading files…", 0.0)?;

        let target = BucketTarget::from(bucket);
        let total = files.len();

        for (index, file) in files.iter().enumerate() {
            let key = file.path.as_object_key();
            let description = format!("Uploading {}…", key);
            let major_progress = index as f64 / total as f64;
            self.begin_step(&description, major_progress)?;

            let callbacks = Arc::new(FileCallbacks {
                name: self.name.clone(),
                statuses: self.services.statuses.clone(),
                recorder: recorder.clone(),
                key: key.clone(),
                description,
                major_progress,
                cancel: self.cancel.clone(),
                storage_failure: Mutex::new(None),
                error_reported: AtomicBool::new(false),
            });

            let request = TransferRequest {
                target: target.clone(),
                key: key.clone(),
                content_type: DEFAULT_CONTENT_TYPE.to_string(),
                size: file.size,
                streams: file.streams.clone(),
                callbacks: callbacks.clone(),
            };

            let result = self
                .services
                .uploader
                .create(request, self.services.clock.clone())
                .and_then(|mut transfer| transfer.execute());

            if let Err(e) = &result {
                run.any_file_failed = true;
                if !callbacks.error_reported.load(Ordering::SeqCst) {
                    callbacks.on_error(e);
                }
                log_warn(
                    COMPONENT,
                    &format!("⚠ Upload {}: {} failed: {}", self.name, key, e),
                )
                .unwrap_or_default();
            }

            // Losing the durable record is fatal
            if let Some(e) = callbacks.take_storage_failure() {
                return Err(e);
            }
        }

        Ok(())
    }

    fn step_finish(&self, run: &RunState, recorder: &RunRecorder) -> Result<UploadRecord> {
        self.begin_step("Finishing…", 1.0)?;

        let now = self.services.clock.now();
        let result = if run.any_file_failed {
            UploadResult::Failed
        } else {
            UploadResult::Succeeded
        };

        recorder.update(
            |record| {
                record.result = Some(result);
                record.time_end = Some(now);
            },
            None,
        )?;
        let record = recorder.snapshot();

        let status = match result {
            UploadResult::Failed => UploadStatus::Failed {
                time: now,
                message: format!("{} of {} files failed.", record.files_failed, record.files_required),
            },
            _ => UploadStatus::Succeeded { time: now },
        };
        self.services.statuses.publish(&self.name, status);

        log_info(
            COMPONENT,
            &format!(
                "✓ Upload {} finished ({}): {} required, {} uploaded, {} skipped, {} failed",
                self.name,
                result.as_str(),
                record.files_required,
                record.files_uploaded,
                record.files_skipped,
                record.files_failed
            ),
        )
        .unwrap_or_default();

        Ok(record)
    }

    fn set_cancelled(&self, run: &RunState) -> Result<UploadRecord> {
        let now = self.services.clock.now();
        self.services
            .statuses
            .publish(&self.name, UploadStatus::Cancelled { time: now });

        log_info(COMPONENT, &format!("⏹ Upload {} cancelled", self.name)).unwrap_or_default();

        let recorder = run.recorder.as_ref().ok_or(CourierError::Cancelled)?;
        recorder.update(
            |record| {
                record.result = Some(UploadResult::Cancelled);
                record.time_end = Some(now);
            },
            Some(EventText::plain(MESSAGE_CANCELLED)),
        )?;
        Ok(recorder.snapshot())
    }

    fn set_failed(&self, run: &RunState, error: &CourierError) {
        let now = self.services.clock.now();

        log_error(COMPONENT, &format!("❌ Upload {} failed: {}", self.name, error))
            .unwrap_or_default();

        if let Some(recorder) = &run.recorder {
            let written = recorder.update(
                |record| {
                    record.result = Some(UploadResult::Failed);
                    record.time_end = Some(now);
                },
                Some(EventText::failure(error, None)),
            );
            if let Err(e) = written {
                log_error(
                    COMPONENT,
                    &format!("❌ Upload {}: could not record failure: {}", self.name, e),
                )
                .unwrap_or_default();
            }
        }

        self.services.statuses.publish(
            &self.name,
            UploadStatus::Failed {
                time: now,
                message: error.to_string(),
            },
        );
    }
}

#[derive(Default)]
struct RunState {
    recorder: Option<Arc<RunRecorder>>,
    any_file_failed: bool,
}

/// Event text to append alongside a record update
struct EventText {
    message: String,
    file: Option<String>,
    exception_trace: Option<String>,
    failed: bool,
}

impl EventText {
    fn plain(message: &str) -> Self {
        Self {
            message: message.to_string(),
            file: None,
            exception_trace: None,
            failed: false,
        }
    }

    fn for_file(message: &str, file: &str) -> Self {
        Self {
            file: Some(file.to_string()),
            ..Self::plain(message)
        }
    }

    fn failure(error: &CourierError, file: Option<&str>) -> Self {
        Self {
            message: error.to_string(),
            file: file.map(str::to_string),
            exception_trace: Some(format!("{:?}", error)),
            failed: true,
        }
    }
}

/// Owns the run record and writes it back after every change
struct RunRecorder {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    record: Mutex<UploadRecord>,
}

impl RunRecorder {
    fn snapshot(&self) -> UploadRecord {
        match self.record.lock() {
            Ok(record) => record.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply `change` and persist it, with `event` in the same transaction
    fn update<F>(&self, change: F, event: Option<EventText>) -> Result<()>
    where
        F: FnOnce(&mut UploadRecord),
    {
        let mut record = self.record.lock()?;
        let mut updated = record.clone();
        change(&mut updated);

        let mut tx = self.store.transaction()?;
        tx.upload_record_update(&updated)?;
        if let Some(event) = event {
            tx.upload_event_add(&UploadEventNew {
                upload_id: updated.id,
                time: self.clock.now(),
                message: event.message,
                file: event.file,
                exception_trace: event.exception_trace,
                failed: event.failed,
            })?;
        }
        tx.commit()?;

        *record = updated;
        Ok(())
    }

    fn event(&self, event: EventText) -> Result<()> {
        let upload_id = self.snapshot().id;
        let mut tx = self.store.transaction()?;
        tx.upload_event_add(&UploadEventNew {
            upload_id,
            time: self.clock.now(),
            message: event.message,
            file: event.file,
            exception_trace: event.exception_trace,
            failed: event.failed,
        })?;
        tx.commit()
    }
}

/// Per-file bridge from transfer callbacks to the run record and live status
struct FileCallbacks {
    name: UploadName,
    statuses: StatusBoard,
    recorder: Arc<RunRecorder>,
    key: String,
    description: String,
    major_progress: f64,
    cancel: CancellationToken,
    storage_failure: Mutex<Option<CourierError>>,
    error_reported: AtomicBool,
}

impl FileCallbacks {
    fn remember(&self, result: Result<()>) {
        if let Err(e) = result {
            log_error(COMPONENT, &format!("❌ Upload {}: {}", self.name, e)).unwrap_or_default();
            if let Ok(mut failure) = self.storage_failure.lock() {
                failure.get_or_insert(e);
            }
        }
    }

    fn take_storage_failure(&self) -> Option<CourierError> {
        self.storage_failure.lock().ok().and_then(|mut f| f.take())
    }
}

impl TransferCallbacks for FileCallbacks {
    fn on_statistics(&self, statistics: TransferStatistics) {
        // Keep "Cancelling" visible until the next checkpoint picks it up
        if self.cancel.is_cancelled() {
            return;
        }
        self.statuses.publish(
            &self.name,
            UploadStatus::Running {
                description: self.description.clone(),
                major_progress: self.major_progress,
                minor_progress: Some(statistics.progress()),
            },
        );
    }

    fn on_informative_event(&self, message: &str) {
        self.remember(self.recorder.event(EventText::for_file(message, &self.key)));
    }

    fn on_error(&self, error: &CourierError) {
        self.error_reported.store(true, Ordering::SeqCst);
        self.remember(self.recorder.update(
            |record| record.files_failed += 1,
            Some(EventText::failure(error, Some(&self.key))),
        ));
    }

    fn on_file_skipped(&self) {
        self.remember(self.recorder.update(
            |record| record.files_skipped += 1,
            Some(EventText::for_file(MESSAGE_FILE_SKIPPED, &self.key)),
        ));
    }

    fn on_file_successfully_uploaded(&self) {
        self.remember(self.recorder.update(
            |record| record.files_uploaded += 1,
            Some(EventText::for_file(MESSAGE_FILE_UPLOADED, &self.key)),
        ));
    }
}
