mod bus;
mod types;

pub use bus::{StatusNotifier, StatusReceiver, SubscriptionId};
pub use types::{EventSequence, StatusChanged};
