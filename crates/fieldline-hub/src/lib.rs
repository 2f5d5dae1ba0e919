//! Live fanout: per-tenant connection registry, subject subscriptions, the
//! stream-to-connection bridge, and the client wire protocol.

pub mod bridge;
pub mod hub;
pub mod protocol;
pub mod subscriptions;
pub mod values;

pub use bridge::{RouteKind, StreamBridge};
pub use hub::{Connection, ConnectionHandle, Hub, SendOutcome};
pub use protocol::{ClientRequest, ServerMessage};
pub use subscriptions::SubscriptionIndex;
pub use values::LatestValues;
