pub mod hub;
pub mod network;
pub mod remote;
pub mod session;

pub use hub::{HubTransport, RealtimeHub};
pub use network::TestNetwork;
pub use remote::{CallCounts, InMemoryRemote};
pub use session::{TestSession, test_config};
