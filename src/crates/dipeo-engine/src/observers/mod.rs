//! Default observers: persistence mirroring and live streaming.

pub mod state_store;
pub mod streaming;

pub use state_store::StateStoreObserver;
pub use streaming::{StreamingObserver, Subscription};
