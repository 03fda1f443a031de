/// Run one configured upload from the command line.
///
/// Usage: s3-courier [--config PATH] <upload-name>
use anyhow::{anyhow, bail, Context};
use s3_courier::clock::SystemClock;
use s3_courier::config::{default_config_file_path, load_config};
use s3_courier::content::FilesystemContentTree;
use s3_courier::database::SqliteRecordStore;
use s3_courier::logging::init_logging;
use s3_courier::model::{UploadName, UploadReason};
use s3_courier::object_store::{AwsObjectStore, S3Uploader};
use s3_courier::{StartOutcome, UploadService, UploadStatus};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

struct Arguments {
    config: Option<PathBuf>,
    upload: String,
}

fn parse_arguments() -> anyhow::Result<Arguments> {
    let mut config = None;
    let mut upload = None;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => bail!("usage: s3-courier [--config PATH] <upload-name>"),
            _ if upload.is_none() => upload = Some(arg),
            _ => bail!("unexpected argument: {}", arg),
        }
    }

    Ok(Arguments {
        config,
        upload: upload.ok_or_else(|| anyhow!("usage: s3-courier [--config PATH] <upload-name>"))?,
    })
}

async fn run() -> anyhow::Result<bool> {
    let arguments = parse_arguments()?;
    let config_path = match arguments.config {
        Some(path) => path,
        None => default_config_file_path()?,
    };
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if let Err(e) = init_logging(&config.logs_directory()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let store = Arc::new(SqliteRecordStore::open(&config.database_path())?);
    let uploader = Arc::new(S3Uploader::new(
        Arc::new(AwsObjectStore::current()?),
        &config,
    ));
    let service = UploadService::open(
        config,
        store,
        Arc::new(FilesystemContentTree::new()),
        uploader,
        Arc::new(SystemClock),
    )?;

    let name = UploadName::new(arguments.upload)?;
    let outcome = service.start(&name, UploadReason::Manual).await;
    let status = service.status(&name);
    service.close();

    match outcome? {
        StartOutcome::AlreadyRunning => println!("{} is already running", name),
        StartOutcome::Finished(record) => println!(
            "{}: {} required, {} uploaded, {} skipped, {} failed",
            name,
            record.files_required,
            record.files_uploaded,
            record.files_skipped,
            record.files_failed
        ),
    }

    match status {
        UploadStatus::Failed { message, .. } => {
            println!("Failed: {}", message);
            Ok(false)
        }
        UploadStatus::Cancelled { .. } => {
            println!("Cancelled");
            Ok(false)
        }
        _ => {
            println!("Succeeded");
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
