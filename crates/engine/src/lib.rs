pub mod config;
pub mod connectivity;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod realtime;
pub mod remote;
pub mod service;
pub mod sync;

pub use config::SyncConfig;
pub use connectivity::Connectivity;
pub use error::EngineError;
pub use ledger::{ChangeKind, DrainReport, PendingChange, PendingChanges};
pub use notify::Notifier;
pub use realtime::{
    ConnectionStatus, EventChannel, RealtimeBridge, RealtimeTransport, TransportError, TransportSignal,
};
pub use remote::{RemoteApi, RemoteError, RemoteStoreClient, UpdateOutcome, Versioned};
pub use service::{EventPublisher, HybridActivityService};
pub use sync::SyncCoordinator;
