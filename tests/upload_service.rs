use chrono::{Duration, TimeZone, Utc};
use s3_courier::clock::{Clock, ManualClock};
use s3_courier::config::CourierConfig;
use s3_courier::content::FilesystemContentTree;
use s3_courier::database::{
    RecordStore, SqliteRecordStore, UploadEventListParameters, UploadRecordListParameters,
};
use s3_courier::model::{
    AccessStyle, BucketConfiguration, BucketName, BucketReferenceName, NetworkStatus,
    UploadConfiguration, UploadName, UploadPolicy, UploadReason, UploadRecord, UploadResult,
    UploadSchedule,
};
use s3_courier::object_store::hashing::sha256_base64;
use s3_courier::object_store::{
    BucketTarget, CompletedPart, MemoryObjectStore, ObjectStoreClient, ObjectStoreConnector,
    RemoteObject, S3Uploader,
};
use s3_courier::{CourierError, StartOutcome, UploadService, UploadStatus};
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use tempfile::TempDir;
use url::Url;

const ACCESS_KEY: &str = "AKIACOURIERTEST";
const BUCKET: &str = "photos-backup";

struct Fixture {
    dir: TempDir,
    source: PathBuf,
    store: Arc<SqliteRecordStore>,
    objects: MemoryObjectStore,
    clock: Arc<ManualClock>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(&source).unwrap();

        Self {
            dir,
            source,
            store: Arc::new(SqliteRecordStore::open_in_memory().unwrap()),
            objects: MemoryObjectStore::with_access_keys([ACCESS_KEY]),
            clock: Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
            )),
        }
    }

    fn configure(&self, upload: &str, access_key: &str, schedule: UploadSchedule) {
        let mut tx = self.store.transaction().unwrap();
        tx.bucket_put(&BucketConfiguration {
            reference_name: BucketReferenceName::new("main").unwrap(),
            name: BucketName::new(BUCKET).unwrap(),
            region: "us-east-1".to_string(),
            access_key: access_key.to_string(),
            secret: "secret".to_string(),
            endpoint: Url::parse("http://localhost:9000").unwrap(),
            access_style: AccessStyle::PathStyle,
        })
        .unwrap();
        tx.upload_configuration_put(&UploadConfiguration {
            name: name(upload),
            source: Url::from_directory_path(&self.source).unwrap(),
            bucket: BucketReferenceName::new("main").unwrap(),
            policy: UploadPolicy {
                schedule,
                ..UploadPolicy::default()
            },
        })
        .unwrap();
        tx.commit().unwrap();
    }

    fn write_file(&self, relative: &str, contents: &[u8]) {
        let path = self.source.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn service(&self) -> UploadService {
        self.service_with(Arc::new(self.objects.clone()))
    }

    fn service_with(&self, connector: Arc<dyn ObjectStoreConnector>) -> UploadService {
        self.service_from(CourierConfig::with_data_directory(self.dir.path()), connector)
    }

    fn service_from(
        &self,
        config: CourierConfig,
        connector: Arc<dyn ObjectStoreConnector>,
    ) -> UploadService {
        let uploader = Arc::new(S3Uploader::new(connector, &config));
        UploadService::open(
            config,
            self.store.clone(),
            Arc::new(FilesystemContentTree::new()),
            uploader,
            self.clock.clone(),
        )
        .unwrap()
    }
}

fn name(value: &str) -> UploadName {
    UploadName::new(value).unwrap()
}

fn finished(outcome: StartOutcome) -> UploadRecord {
    match outcome {
        StartOutcome::Finished(record) => record,
        StartOutcome::AlreadyRunning => panic!("expected a finished run"),
    }
}

fn event_messages(service: &UploadService, upload_id: i64) -> Vec<String> {
    service
        .events(&UploadEventListParameters {
            upload_id,
            newer_than: Utc.timestamp_opt(0, 0).unwrap(),
            limit: 1000,
        })
        .unwrap()
        .into_iter()
        .map(|event| event.message)
        .collect()
}

async fn wait_until_idle(service: &UploadService, upload: &UploadName) {
    while service.is_running(upload) {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

fn local_hash(contents: &[u8]) -> String {
    sha256_base64(&mut Cursor::new(contents.to_vec())).unwrap().0
}

/// Wraps the in-memory store and runs a hook before every HEAD request
struct HookedConnector {
    inner: MemoryObjectStore,
    before_head: Arc<dyn Fn() -> s3_courier::Result<()> + Send + Sync>,
}

struct HookedClient {
    inner: Arc<dyn ObjectStoreClient>,
    before_head: Arc<dyn Fn() -> s3_courier::Result<()> + Send + Sync>,
}

impl ObjectStoreConnector for HookedConnector {
    fn connect(&self, target: &BucketTarget) -> s3_courier::Result<Arc<dyn ObjectStoreClient>> {
        Ok(Arc::new(HookedClient {
            inner: self.inner.connect(target)?,
            before_head: self.before_head.clone(),
        }))
    }
}

impl ObjectStoreClient for HookedClient {
    fn head_object(&self, bucket: &str, key: &str) -> s3_courier::Result<Option<RemoteObject>> {
        (self.before_head)()?;
        self.inner.head_object(bucket, key)
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
        body: &mut dyn Read,
        size: u64,
    ) -> s3_courier::Result<()> {
        self.inner
            .put_object(bucket, key, content_type, metadata, body, size)
    }

    fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> s3_courier::Result<String> {
        self.inner
            .create_multipart_upload(bucket, key, content_type, metadata)
    }

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &mut dyn Read,
        size: u64,
    ) -> s3_courier::Result<String> {
        self.inner
            .upload_part(bucket, key, upload_id, part_number, body, size)
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> s3_courier::Result<()> {
        self.inner
            .complete_multipart_upload(bucket, key, upload_id, parts)
    }

    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> s3_courier::Result<()> {
        self.inner.abort_multipart_upload(bucket, key, upload_id)
    }
}

#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
    }

    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

#[tokio::test]
async fn test_empty_source_succeeds_with_only_start_event() {
    let fixture = Fixture::new();
    fixture.configure("photos", ACCESS_KEY, UploadSchedule::OnlyManually);
    let service = fixture.service();

    let record = finished(service.start(&name("photos"), UploadReason::Manual).await.unwrap());

    assert_eq!(record.files_required, 0);
    assert_eq!(record.files_skipped, 0);
    assert_eq!(record.files_uploaded, 0);
    assert_eq!(record.files_failed, 0);
    assert_eq!(record.result, Some(UploadResult::Succeeded));
    assert!(record.time_end.is_some());
    assert_eq!(record.reason, "Upload was triggered manually.");

    assert_eq!(event_messages(&service, record.id), vec!["Upload started."]);
    assert!(matches!(
        service.status(&name("photos")),
        UploadStatus::Succeeded { .. }
    ));
    assert!(!service.is_running(&name("photos")));
}

#[tokio::test]
async fn test_unknown_configuration_fails() {
    let fixture = Fixture::new();
    let service = fixture.service();

    let error = service
        .start(&name("missing"), UploadReason::Manual)
        .await
        .unwrap_err();
    assert!(error.to_string().contains("No such upload configuration."));

    match service.status(&name("missing")) {
        UploadStatus::Failed { message, .. } => {
            assert_eq!(message, "No such upload configuration.")
        }
        other => panic!("unexpected status {:?}", other),
    }

    let record = service.most_recent(&name("missing")).unwrap().unwrap();
    assert_eq!(record.result, Some(UploadResult::Failed));
    assert_eq!(
        event_messages(&service, record.id),
        vec!["Upload started.", "No such upload configuration."]
    );
}

#[tokio::test]
async fn test_single_file_is_uploaded() {
    let fixture = Fixture::new();
    fixture.configure("photos", ACCESS_KEY, UploadSchedule::OnlyManually);
    fixture.write_file("DCIM/IMG_0001.jpg", b"not really a jpeg");
    let service = fixture.service();

    let record = finished(service.start(&name("photos"), UploadReason::Manual).await.unwrap());

    assert_eq!(record.files_required, 1);
    assert_eq!(record.files_uploaded, 1);
    assert_eq!(record.files_skipped, 0);
    assert_eq!(record.files_failed, 0);
    assert_eq!(record.result, Some(UploadResult::Succeeded));
    assert_eq!(record.bucket, Some(BucketReferenceName::new("main").unwrap()));

    let hash = local_hash(b"not really a jpeg");
    assert_eq!(
        event_messages(&service, record.id),
        vec![
            "Upload started.".to_string(),
            "Calculating local content hash.".to_string(),
            format!("Local content hash: {}", hash),
            "Fetching remote content hash.".to_string(),
            "Remote file does not exist. Upload is required.".to_string(),
            "Uploading file.".to_string(),
            "Uploading completed.".to_string(),
            "File was successfully uploaded.".to_string(),
        ]
    );

    assert_eq!(
        fixture.objects.object(BUCKET, "DCIM/IMG_0001.jpg"),
        Some(b"not really a jpeg".to_vec())
    );
}

#[tokio::test]
async fn test_second_run_skips_unchanged_file() {
    let fixture = Fixture::new();
    fixture.configure("photos", ACCESS_KEY, UploadSchedule::OnlyManually);
    fixture.write_file("IMG_0002.jpg", b"same bytes twice");
    let service = fixture.service();

    finished(service.start(&name("photos"), UploadReason::Manual).await.unwrap());
    fixture.clock.advance(Duration::minutes(5));
    let record = finished(service.start(&name("photos"), UploadReason::Manual).await.unwrap());

    assert_eq!(record.files_skipped, 1);
    assert_eq!(record.files_uploaded, 0);
    assert_eq!(record.result, Some(UploadResult::Succeeded));
    assert_eq!(fixture.objects.put_count(), 1);

    let events = event_messages(&service, record.id);
    let transfer_events: Vec<&String> = events
        .iter()
        .filter(|m| m.as_str() != "File has already been uploaded and so will not be uploaded again.")
        .collect();
    assert_eq!(
        transfer_events.last().map(|m| m.as_str()),
        Some("Hashes match, no upload is required.")
    );
    assert_eq!(
        events.last().map(String::as_str),
        Some("File has already been uploaded and so will not be uploaded again.")
    );

    let history = service
        .history(&UploadRecordListParameters {
            newer_than: Utc.timestamp_opt(0, 0).unwrap(),
            limit: 10,
            name: Some(name("photos")),
        })
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].id, record.id);
}

#[tokio::test]
async fn test_rejected_credentials_fail_the_file() {
    let fixture = Fixture::new();
    fixture.configure("photos", "AKIAWRONG", UploadSchedule::OnlyManually);
    fixture.write_file("IMG_0003.jpg", b"denied");
    let service = fixture.service();

    let record = finished(service.start(&name("photos"), UploadReason::Manual).await.unwrap());

    assert_eq!(record.files_required, 1);
    assert_eq!(record.files_failed, 1);
    assert_eq!(record.files_uploaded, 0);
    assert_eq!(record.result, Some(UploadResult::Failed));
    assert!(matches!(
        service.status(&name("photos")),
        UploadStatus::Failed { .. }
    ));

    let events = service
        .events(&UploadEventListParameters {
            upload_id: record.id,
            newer_than: Utc.timestamp_opt(0, 0).unwrap(),
            limit: 100,
        })
        .unwrap();
    let failure = events.iter().find(|e| e.failed).unwrap();
    assert!(failure.message.contains("Access Denied"));
    assert_eq!(failure.file.as_deref(), Some("IMG_0003.jpg"));
    assert!(failure.exception_trace.is_some());
}

#[tokio::test]
async fn test_concurrent_start_runs_once() {
    let fixture = Fixture::new();
    fixture.configure("photos", ACCESS_KEY, UploadSchedule::OnlyManually);
    fixture.write_file("IMG_0004.jpg", b"slow upload");

    let gate = Arc::new(Gate::default());
    let service = fixture.service_with(Arc::new(HookedConnector {
        inner: fixture.objects.clone(),
        before_head: {
            let gate = gate.clone();
            Arc::new(move || {
                gate.wait();
                Ok(())
            })
        },
    }));

    let first = service.start(&name("photos"), UploadReason::Manual);
    assert!(service.is_running(&name("photos")));

    let second = service
        .start(&name("photos"), UploadReason::Manual)
        .await
        .unwrap();
    assert_eq!(second, StartOutcome::AlreadyRunning);

    gate.release();
    let record = finished(first.await.unwrap());
    assert_eq!(record.files_uploaded, 1);
    assert!(!service.is_running(&name("photos")));

    let history = service
        .history(&UploadRecordListParameters {
            newer_than: Utc.timestamp_opt(0, 0).unwrap(),
            limit: 10,
            name: None,
        })
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(fixture.objects.put_count(), 1);
}

#[tokio::test]
async fn test_cancellation_wins_over_file_failures() {
    let fixture = Fixture::new();
    fixture.configure("photos", ACCESS_KEY, UploadSchedule::OnlyManually);
    fixture.write_file("IMG_0005.jpg", b"first");

    let service_slot: Arc<Mutex<Option<UploadService>>> = Arc::new(Mutex::new(None));
    let service = fixture.service_with(Arc::new(HookedConnector {
        inner: fixture.objects.clone(),
        before_head: {
            let service_slot = service_slot.clone();
            Arc::new(move || {
                if let Some(service) = service_slot.lock().unwrap().as_ref() {
                    service.cancel(&UploadName::new("photos").unwrap());
                }
                Err(CourierError::Transfer("Connection reset".to_string()))
            })
        },
    }));
    *service_slot.lock().unwrap() = Some(service.clone());

    let record = finished(service.start(&name("photos"), UploadReason::Manual).await.unwrap());
    service_slot.lock().unwrap().take();

    assert_eq!(record.files_failed, 1);
    assert_eq!(record.result, Some(UploadResult::Cancelled));
    assert!(record.time_end.is_some());
    assert!(matches!(
        service.status(&name("photos")),
        UploadStatus::Cancelled { .. }
    ));
    assert_eq!(
        event_messages(&service, record.id).last().map(String::as_str),
        Some("Upload was cancelled.")
    );
}

#[tokio::test]
async fn test_cancel_without_task_publishes_cancelling() {
    let fixture = Fixture::new();
    let service = fixture.service();

    service.cancel(&name("idle"));
    assert_eq!(service.status(&name("idle")), UploadStatus::Cancelling);
    assert_eq!(service.status(&name("never-seen")), UploadStatus::None);
}

#[tokio::test]
async fn test_start_after_close_is_rejected() {
    let fixture = Fixture::new();
    fixture.configure("photos", ACCESS_KEY, UploadSchedule::OnlyManually);
    let service = fixture.service();

    service.close();
    service.close();
    assert!(service.is_closed());

    let error = service
        .start(&name("photos"), UploadReason::Manual)
        .await
        .unwrap_err();
    assert!(matches!(error, CourierError::Closed));
}

#[tokio::test]
async fn test_open_marks_abandoned_runs_cancelled() {
    let fixture = Fixture::new();
    let abandoned = {
        let mut tx = fixture.store.transaction().unwrap();
        let record = tx
            .upload_record_create(
                fixture.clock.now(),
                &name("photos"),
                "Upload was triggered manually.",
            )
            .unwrap();
        tx.commit().unwrap();
        record
    };

    let service = fixture.service();
    let record = service.most_recent(&name("photos")).unwrap().unwrap();
    assert_eq!(record.id, abandoned.id);
    assert_eq!(record.result, Some(UploadResult::Cancelled));
    assert!(record.time_end.is_some());
}

#[tokio::test]
async fn test_status_changes_are_broadcast() {
    let fixture = Fixture::new();
    fixture.configure("photos", ACCESS_KEY, UploadSchedule::OnlyManually);
    fixture.write_file("IMG_0006.jpg", b"watched");
    let service = fixture.service();
    let mut receiver = service.subscribe();

    let seen = Arc::new(Mutex::new(0usize));
    {
        let seen = seen.clone();
        service.subscribe_fn(move |_| *seen.lock().unwrap() += 1);
    }

    finished(service.start(&name("photos"), UploadReason::Manual).await.unwrap());

    let mut notifications = Vec::new();
    while let Ok(changed) = receiver.try_recv() {
        notifications.push(changed);
    }
    assert!(!notifications.is_empty());
    assert!(notifications.iter().all(|c| c.name == name("photos")));
    assert!(notifications
        .windows(2)
        .all(|pair| pair[0].sequence < pair[1].sequence));
    assert_eq!(*seen.lock().unwrap(), notifications.len());
}

#[tokio::test]
async fn test_scheduled_runs_respect_last_run() {
    let fixture = Fixture::new();
    fixture.configure("photos", ACCESS_KEY, UploadSchedule::EveryHour);
    let service = fixture.service();

    let started = service
        .start_all_as_necessary(UploadReason::Scheduled, NetworkStatus::Wifi)
        .unwrap();
    assert_eq!(started, vec![name("photos")]);
    wait_until_idle(&service, &name("photos")).await;
    assert_eq!(service.last_ran(&name("photos")), Some(fixture.clock.now()));

    fixture.clock.advance(Duration::minutes(30));
    let started = service
        .start_all_as_necessary(UploadReason::Scheduled, NetworkStatus::Wifi)
        .unwrap();
    assert!(started.is_empty());

    let started = service
        .start_all_as_necessary(UploadReason::Scheduled, NetworkStatus::Unavailable)
        .unwrap();
    assert!(started.is_empty());
}

#[tokio::test]
async fn test_purge_history_uses_retention() {
    let fixture = Fixture::new();
    fixture.configure("photos", ACCESS_KEY, UploadSchedule::OnlyManually);
    let service = fixture.service();

    finished(service.start(&name("photos"), UploadReason::Manual).await.unwrap());
    let start = service.most_recent(&name("photos")).unwrap().unwrap().time_start;

    assert_eq!(service.purge_history(start + Duration::days(29)).unwrap(), 0);
    assert_eq!(service.purge_history(start + Duration::days(31)).unwrap(), 1);
    assert!(service.most_recent(&name("photos")).unwrap().is_none());
}

#[tokio::test]
async fn test_failed_scheduled_run_is_retried_next_tick() {
    let fixture = Fixture::new();
    {
        let mut tx = fixture.store.transaction().unwrap();
        tx.upload_configuration_put(&UploadConfiguration {
            name: name("photos"),
            source: Url::from_directory_path(&fixture.source).unwrap(),
            bucket: BucketReferenceName::new("gone").unwrap(),
            policy: UploadPolicy {
                schedule: UploadSchedule::EveryHour,
                ..UploadPolicy::default()
            },
        })
        .unwrap();
        tx.commit().unwrap();
    }
    let service = fixture.service();

    let started = service
        .start_all_as_necessary(UploadReason::Scheduled, NetworkStatus::Wifi)
        .unwrap();
    assert_eq!(started, vec![name("photos")]);
    wait_until_idle(&service, &name("photos")).await;

    match service.status(&name("photos")) {
        UploadStatus::Failed { message, .. } => {
            assert_eq!(message, "No such bucket configuration.")
        }
        other => panic!("unexpected status {:?}", other),
    }
    assert_eq!(service.last_ran(&name("photos")), None);

    fixture.clock.advance(Duration::minutes(5));
    let started = service
        .start_all_as_necessary(UploadReason::Scheduled, NetworkStatus::Wifi)
        .unwrap();
    assert_eq!(started, vec![name("photos")]);
    wait_until_idle(&service, &name("photos")).await;
}

#[tokio::test]
async fn test_file_failures_still_count_as_a_completed_run() {
    let fixture = Fixture::new();
    fixture.configure("photos", "AKIAWRONG", UploadSchedule::EveryHour);
    fixture.write_file("IMG_0007.jpg", b"denied again");
    let service = fixture.service();

    let record = finished(service.start(&name("photos"), UploadReason::Scheduled).await.unwrap());
    assert_eq!(record.result, Some(UploadResult::Failed));
    assert_eq!(service.last_ran(&name("photos")), Some(fixture.clock.now()));

    fixture.clock.advance(Duration::minutes(5));
    let started = service
        .start_all_as_necessary(UploadReason::Scheduled, NetworkStatus::Wifi)
        .unwrap();
    assert!(started.is_empty());
}

#[tokio::test]
async fn test_purge_history_rejects_unrepresentable_retention() {
    let fixture = Fixture::new();
    let mut config = CourierConfig::with_data_directory(fixture.dir.path());
    config.retention_days = u32::MAX;
    let service = fixture.service_from(config, Arc::new(fixture.objects.clone()));

    let error = service.purge_history(fixture.clock.now()).unwrap_err();
    assert!(matches!(error, CourierError::Config(_)));
}

#[tokio::test]
async fn test_progress_advances_file_by_file() {
    let fixture = Fixture::new();
    fixture.configure("photos", ACCESS_KEY, UploadSchedule::OnlyManually);
    for i in 0..4 {
        fixture.write_file(&format!("IMG_10{:02}.jpg", i), &vec![i as u8; 1024]);
    }

    let service = fixture.service();
    let service_slot: Arc<Mutex<Option<UploadService>>> = Arc::new(Mutex::new(None));
    let observed: Arc<Mutex<Vec<(f64, Option<f64>)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let service_slot = service_slot.clone();
        let observed = observed.clone();
        service.subscribe_fn(move |changed| {
            let slot = service_slot.lock().unwrap();
            if let Some(service) = slot.as_ref() {
                if let UploadStatus::Running {
                    major_progress,
                    minor_progress,
                    ..
                } = service.status(&changed.name)
                {
                    observed.lock().unwrap().push((major_progress, minor_progress));
                }
            }
        });
    }
    *service_slot.lock().unwrap() = Some(service.clone());

    let record = finished(service.start(&name("photos"), UploadReason::Manual).await.unwrap());
    service_slot.lock().unwrap().take();
    assert_eq!(record.files_uploaded, 4);

    let observed = observed.lock().unwrap().clone();
    let steps: Vec<f64> = (0..=4).map(|k| k as f64 / 4.0).collect();
    assert!(observed.iter().all(|(major, _)| steps.contains(major)));
    assert!(observed.windows(2).all(|pair| pair[0].0 <= pair[1].0));
    assert!(observed
        .iter()
        .filter_map(|(_, minor)| *minor)
        .all(|minor| (0.0..=1.0).contains(&minor)));
    assert!(observed.iter().any(|(_, minor)| *minor == Some(1.0)));

    // Within one file, minor progress only moves forward
    for pair in observed.windows(2) {
        if pair[0].0 == pair[1].0 {
            match (pair[0].1, pair[1].1) {
                (Some(_), None) => panic!("minor progress reset within {:?}", pair),
                (Some(a), Some(b)) => assert!(a <= b),
                _ => {}
            }
        }
    }
}
