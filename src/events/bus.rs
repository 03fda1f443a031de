use super::types::{EventSequence, StatusChanged};
use crate::model::UploadName;
use chrono::Utc;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub type StatusReceiver = broadcast::Receiver<StatusChanged>;
pub type StatusSender = broadcast::Sender<StatusChanged>;

type Callback = Arc<dyn Fn(&StatusChanged) + Send + Sync>;

/// Handle returned by [`StatusNotifier::subscribe_fn`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Distributes status change notifications.
///
/// Async consumers take a broadcast receiver; synchronous consumers register a
/// callback that runs on the publishing thread, in registration order.
#[derive(Clone)]
pub struct StatusNotifier {
    sender: StatusSender,
    sequence: Arc<AtomicU64>,
    callbacks: Arc<Mutex<IndexMap<u64, Callback>>>,
    next_callback: Arc<AtomicU64>,
}

impl std::fmt::Debug for StatusNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusNotifier")
            .field("sequence", &self.sequence)
            .field("receivers", &self.sender.receiver_count())
            .field("callbacks", &"<callbacks>")
            .finish()
    }
}

impl StatusNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(1)),
            callbacks: Arc::new(Mutex::new(IndexMap::new())),
            next_callback: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Announce a change for `name` (returns sequence number)
    pub fn notify(&self, name: &UploadName) -> EventSequence {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);

        let event = StatusChanged {
            sequence,
            timestamp: Utc::now(),
            name: name.clone(),
        };

        // Nobody listening is not an error
        let _ = self.sender.send(event.clone());

        let callbacks: Vec<Callback> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for callback in callbacks {
            callback(&event);
        }

        sequence
    }

    pub fn subscribe(&self) -> StatusReceiver {
        self.sender.subscribe()
    }

    pub fn subscribe_fn<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatusChanged) + Send + Sync + 'static,
    {
        let id = self.next_callback.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.insert(id, Arc::new(callback));
        }
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.callbacks.lock() {
            Ok(mut callbacks) => callbacks.shift_remove(&id.0).is_some(),
            Err(_) => false,
        }
    }

    pub fn current_sequence(&self) -> EventSequence {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
