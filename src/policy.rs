//! Whether an upload should run for a given reason.

use crate::logging::log_debug;
use crate::model::{NetworkStatus, Settings, UploadConfiguration, UploadReason, UploadSchedule};
use chrono::{DateTime, Utc};

pub fn network_permitted(settings: &Settings, network: NetworkStatus) -> bool {
    match network {
        NetworkStatus::Unavailable => false,
        NetworkStatus::Wifi => settings.networking.upload_on_wifi,
        NetworkStatus::Cellular => settings.networking.upload_on_cellular,
    }
}

/// Manual runs always go ahead; everything else respects pause, network and policy.
pub fn should_run(
    upload: &UploadConfiguration,
    reason: UploadReason,
    settings: &Settings,
    network: NetworkStatus,
    last_ran: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if reason == UploadReason::Manual {
        return true;
    }
    if settings.paused || !network_permitted(settings, network) {
        log_debug(
            "policy",
            &format!(
                "Skipping {} (paused: {}, network: {:?})",
                upload.name, settings.paused, network
            ),
        )
        .unwrap_or_default();
        return false;
    }

    match reason {
        UploadReason::Manual => true,
        UploadReason::Scheduled => match upload.policy.schedule {
            UploadSchedule::OnlyManually | UploadSchedule::OnlyOnTriggers => false,
            schedule => match (schedule.period(), last_ran) {
                (Some(period), Some(last)) => last <= now - period,
                (Some(_), None) => true,
                (None, _) => false,
            },
        },
        UploadReason::Triggered(trigger) => upload.policy.triggers.contains(&trigger),
    }
}
