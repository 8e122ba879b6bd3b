//! Remote change notifications.

pub mod router;

pub use router::{channel, ChangeNotifier, ChangeRouter, DataChanged, RemoteChange};
