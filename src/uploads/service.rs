//! Registry of running uploads.
//!
//! At most one task runs per upload name. Tasks execute on a dedicated worker
//! pool; the registry lock only guards bookkeeping and is never held across a run.

use super::status::{StatusBoard, UploadStatus};
use super::task::{TaskServices, UploadTask};
use crate::clock::Clock;
use crate::config::CourierConfig;
use crate::content::ContentTreeFactory;
use crate::database::{RecordStore, UploadEventListParameters, UploadRecordListParameters};
use crate::error::{CourierError, Result};
use crate::events::{StatusChanged, StatusReceiver, SubscriptionId};
use crate::logging::{log_error, log_info, log_warn};
use crate::model::{
    NetworkStatus, UploadEventRecord, UploadName, UploadReason, UploadRecord, UploadResult,
};
use crate::object_store::ObjectUploaderFactory;
use crate::policy;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

const COMPONENT: &str = "upload-service";

type TaskMap = Arc<Mutex<HashMap<UploadName, Arc<UploadTask>>>>;

/// How a call to [`UploadService::start`] resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A run for this name was already in flight; nothing new was started
    AlreadyRunning,
    /// The run this call started has finished (succeeded, failed per file, or cancelled)
    Finished(UploadRecord),
}

impl StartOutcome {
    pub fn record(&self) -> Option<&UploadRecord> {
        match self {
            StartOutcome::AlreadyRunning => None,
            StartOutcome::Finished(record) => Some(record),
        }
    }
}

/// Owns the worker runtime; shutting down never blocks the caller.
struct WorkerPool(Option<Runtime>);

impl WorkerPool {
    fn shutdown(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone)]
pub struct UploadService {
    config: Arc<CourierConfig>,
    services: TaskServices,
    tasks: TaskMap,
    last_ran: Arc<Mutex<HashMap<UploadName, DateTime<Utc>>>>,
    closed: Arc<AtomicBool>,
    handle: Handle,
    pool: Arc<Mutex<WorkerPool>>,
}

impl std::fmt::Debug for UploadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadService")
            .field("config", &self.config)
            .field("tasks", &"<running tasks>")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl UploadService {
    /// Build the service. Runs left unfinished by a previous process are marked cancelled.
    pub fn open(
        config: CourierConfig,
        store: Arc<dyn RecordStore>,
        content: Arc<dyn ContentTreeFactory>,
        uploader: Arc<dyn ObjectUploaderFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let mut tx = store.transaction()?;
        let abandoned = tx.upload_record_mark_unfinished_cancelled(clock.now())?;
        tx.commit()?;
        if abandoned > 0 {
            log_warn(
                COMPONENT,
                &format!("⚠ Marked {} unfinished upload runs as cancelled", abandoned),
            )
            .unwrap_or_default();
        }

        let runtime = Builder::new_multi_thread()
            .thread_name("courier-upload")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let statuses = StatusBoard::new(config.status_channel_capacity);

        log_info(COMPONENT, "✓ Upload service ready").unwrap_or_default();

        Ok(Self {
            config: Arc::new(config),
            services: TaskServices {
                store,
                content,
                uploader,
                clock,
                statuses,
            },
            tasks: Arc::new(Mutex::new(HashMap::new())),
            last_ran: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            handle,
            pool: Arc::new(Mutex::new(WorkerPool(Some(runtime)))),
        })
    }

    /// Start a run for `name` unless one is already in flight.
    ///
    /// The run is scheduled before this returns; dropping the future does not
    /// stop it. A run that gets as far as creating its record resolves to
    /// `Finished`, whether it succeeded, had failed files or was cancelled.
    /// A run cancelled before its record exists resolves to
    /// `Err(CourierError::Cancelled)`; other fatal errors resolve to that error.
    pub fn start(
        &self,
        name: &UploadName,
        reason: UploadReason,
    ) -> impl Future<Output = Result<StartOutcome>> + Send + 'static {
        let spawned = self.spawn(name, reason);

        async move {
            match spawned? {
                None => Ok(StartOutcome::AlreadyRunning),
                Some(handle) => match handle.await {
                    Ok(result) => result.map(StartOutcome::Finished),
                    Err(join_error) if join_error.is_cancelled() => Err(CourierError::Closed),
                    Err(join_error) => Err(CourierError::Other(format!(
                        "Upload task panicked: {}",
                        join_error
                    ))),
                },
            }
        }
    }

    fn spawn(
        &self,
        name: &UploadName,
        reason: UploadReason,
    ) -> Result<Option<JoinHandle<Result<UploadRecord>>>> {
        let mut tasks = self.tasks.lock()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(CourierError::Closed);
        }
        if tasks.contains_key(name) {
            log_info(
                COMPONENT,
                &format!("Upload {} is already running, ignoring start", name),
            )
            .unwrap_or_default();
            return Ok(None);
        }

        let task = Arc::new(UploadTask::new(name.clone(), reason, self.services.clone()));
        tasks.insert(name.clone(), task.clone());

        let registration = Registration {
            tasks: self.tasks.clone(),
            task: task.clone(),
        };
        let last_ran = self.last_ran.clone();
        let clock = self.services.clock.clone();

        Ok(Some(self.handle.spawn_blocking(move || {
            let _registration = registration;
            let result = task.run();
            if let Ok(record) = &result {
                record_completion(&last_ran, task.name(), record, clock.now());
            }
            result
        })))
    }

    /// Ask the run for `name` to stop at its next checkpoint
    pub fn cancel(&self, name: &UploadName) {
        self.services
            .statuses
            .publish(name, UploadStatus::Cancelling);

        let task = match self.tasks.lock() {
            Ok(tasks) => tasks.get(name).cloned(),
            Err(_) => None,
        };
        if let Some(task) = task {
            log_info(COMPONENT, &format!("Cancelling upload {}", name)).unwrap_or_default();
            task.cancel();
        }
    }

    pub fn status(&self, name: &UploadName) -> UploadStatus {
        self.services.statuses.status(name)
    }

    pub fn is_running(&self, name: &UploadName) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.contains_key(name))
            .unwrap_or(false)
    }

    pub fn running(&self) -> Vec<UploadName> {
        let mut names: Vec<UploadName> = match self.tasks.lock() {
            Ok(tasks) => tasks.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// When a run for `name` last completed (succeeded or failed per file) in this process
    pub fn last_ran(&self, name: &UploadName) -> Option<DateTime<Utc>> {
        self.last_ran
            .lock()
            .ok()
            .and_then(|last_ran| last_ran.get(name).copied())
    }

    pub fn most_recent(&self, name: &UploadName) -> Result<Option<UploadRecord>> {
        let mut tx = self.services.store.transaction()?;
        let record = tx.upload_record_most_recent(name)?;
        tx.commit()?;
        Ok(record)
    }

    pub fn history(&self, parameters: &UploadRecordListParameters) -> Result<Vec<UploadRecord>> {
        let mut tx = self.services.store.transaction()?;
        let records = tx.upload_record_list(parameters)?;
        tx.commit()?;
        Ok(records)
    }

    pub fn events(&self, parameters: &UploadEventListParameters) -> Result<Vec<UploadEventRecord>> {
        let mut tx = self.services.store.transaction()?;
        let events = tx.upload_event_list(parameters)?;
        tx.commit()?;
        Ok(events)
    }

    /// Delete runs (and their events) older than the retention period
    pub fn purge_history(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now.checked_sub_signed(self.config.retention()).ok_or_else(|| {
            CourierError::Config(format!(
                "retentionDays ({}) reaches before the earliest representable time",
                self.config.retention_days
            ))
        })?;
        let mut tx = self.services.store.transaction()?;
        let deleted = tx.upload_record_delete_older_than(cutoff)?;
        tx.commit()?;

        if deleted > 0 {
            log_info(
                COMPONENT,
                &format!("🧹 Purged {} upload runs started before {}", deleted, cutoff),
            )
            .unwrap_or_default();
        }
        Ok(deleted)
    }

    /// Start every configured upload whose policy says it should run now.
    ///
    /// Returns the names that were started; the runs continue in the background.
    pub fn start_all_as_necessary(
        &self,
        reason: UploadReason,
        network: NetworkStatus,
    ) -> Result<Vec<UploadName>> {
        let (uploads, settings) = {
            let mut tx = self.services.store.transaction()?;
            let uploads = tx.upload_configuration_list()?;
            let settings = tx.settings_get()?;
            tx.commit()?;
            (uploads, settings)
        };

        let now = self.services.clock.now();
        let mut started = Vec::new();
        for upload in uploads {
            let last_ran = self.last_ran(&upload.name);
            if !policy::should_run(&upload, reason, &settings, network, last_ran, now) {
                continue;
            }
            if self.spawn(&upload.name, reason)?.is_some() {
                started.push(upload.name);
            }
        }
        Ok(started)
    }

    pub fn subscribe(&self) -> StatusReceiver {
        self.services.statuses.subscribe()
    }

    pub fn subscribe_fn<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatusChanged) + Send + Sync + 'static,
    {
        self.services.statuses.subscribe_fn(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.services.statuses.unsubscribe(id)
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.services.store
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    /// Cancel every running task and stop the worker pool. Only the first call does anything.
    pub fn close(&self) {
        let tasks: Vec<Arc<UploadTask>> = {
            let tasks = match self.tasks.lock() {
                Ok(tasks) => tasks,
                Err(poisoned) => poisoned.into_inner(),
            };
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            tasks.values().cloned().collect()
        };

        for task in &tasks {
            task.cancel();
        }

        match self.pool.lock() {
            Ok(mut pool) => pool.shutdown(),
            Err(e) => {
                log_error(COMPONENT, &format!("Failed to stop worker pool: {}", e))
                    .unwrap_or_default();
            }
        }

        log_info(
            COMPONENT,
            &format!("Upload service closed ({} runs cancelled)", tasks.len()),
        )
        .unwrap_or_default();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Cancelled runs leave the previous time in place so the schedule retries them
fn record_completion(
    last_ran: &Mutex<HashMap<UploadName, DateTime<Utc>>>,
    name: &UploadName,
    record: &UploadRecord,
    now: DateTime<Utc>,
) {
    if !matches!(
        record.result,
        Some(UploadResult::Succeeded) | Some(UploadResult::Failed)
    ) {
        return;
    }
    match last_ran.lock() {
        Ok(mut last_ran) => {
            last_ran.insert(name.clone(), now);
        }
        Err(e) => {
            log_error(COMPONENT, &format!("Failed to record last run of {}: {}", name, e))
                .unwrap_or_default();
        }
    }
}

/// Removes a task from the registry when its run ends, however it ends
struct Registration {
    tasks: TaskMap,
    task: Arc<UploadTask>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        let ours = tasks
            .get(self.task.name())
            .is_some_and(|registered| Arc::ptr_eq(registered, &self.task));
        if ours {
            tasks.remove(self.task.name());
        }
    }
}
