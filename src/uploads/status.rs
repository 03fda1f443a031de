//! Live upload status.
//!
//! The latest status per upload name lives in a concurrent map; every write is
//! followed by a change notification carrying only the name.

use crate::events::{StatusChanged, StatusNotifier, StatusReceiver, SubscriptionId};
use crate::model::UploadName;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadStatus {
    None,
    Running {
        description: String,
        /// 0..=1
        major_progress: f64,
        /// 0..=1, `None` when indeterminate
        minor_progress: Option<f64>,
    },
    Cancelling,
    Cancelled {
        time: DateTime<Utc>,
    },
    Succeeded {
        time: DateTime<Utc>,
    },
    Failed {
        time: DateTime<Utc>,
        message: String,
    },
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Cancelled { .. }
                | UploadStatus::Succeeded { .. }
                | UploadStatus::Failed { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct StatusBoard {
    statuses: Arc<RwLock<HashMap<UploadName, UploadStatus>>>,
    notifier: StatusNotifier,
}

impl StatusBoard {
    pub fn new(capacity: usize) -> Self {
        Self {
            statuses: Arc::new(RwLock::new(HashMap::new())),
            notifier: StatusNotifier::new(capacity),
        }
    }

    /// Store `status` as the latest for `name`, then notify
    pub fn publish(&self, name: &UploadName, status: UploadStatus) {
        if let Ok(mut statuses) = self.statuses.write() {
            statuses.insert(name.clone(), status);
        }
        self.notifier.notify(name);
    }

    pub fn status(&self, name: &UploadName) -> UploadStatus {
        self.statuses
            .read()
            .ok()
            .and_then(|statuses| statuses.get(name).cloned())
            .unwrap_or(UploadStatus::None)
    }

    pub fn remove(&self, name: &UploadName) {
        if let Ok(mut statuses) = self.statuses.write() {
            statuses.remove(name);
        }
        self.notifier.notify(name);
    }

    pub fn subscribe(&self) -> StatusReceiver {
        self.notifier.subscribe()
    }

    pub fn subscribe_fn<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatusChanged) + Send + Sync + 'static,
    {
        self.notifier.subscribe_fn(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }
}
