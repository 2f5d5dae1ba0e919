//! Publish/subscribe transport seam for fieldline.
//!
//! Defines the byte-oriented transport contract shared by the internal bus
//! and the external device broker, plus an in-memory broker for tests and
//! single-process deployments.

pub mod broker;
pub mod filter;
pub mod pubsub;

pub use broker::InMemoryBroker;
pub use filter::topic_matches;
pub use pubsub::{FrameHandler, PubSubTransport, TransportError};
