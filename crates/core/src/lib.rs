pub mod activity;
pub mod approval;
pub mod clock;
pub mod error;
pub mod events;
pub mod ids;
pub mod merge;
pub mod patch;
pub mod sanitize;
pub mod settings;

pub use activity::*;
pub use clock::TimestampClock;
pub use error::CoreError;
pub use events::{InboundEvent, Notification, OutboundEvent, SyncStatus};
pub use ids::*;
pub use patch::ActivityPatch;
pub use settings::*;
