//! Core fieldline primitives shared across crates.
//!
//! Includes identity newtypes, the opaque payload capability, the in-process
//! message, its wire envelope, and the inbound device frame.

pub mod envelope;
pub mod frame;
pub mod payload;
pub mod types;

pub use envelope::{now_millis, CodecError, DeliveryStatus, Message, WireEnvelope};
pub use frame::{DeviceFrame, FrameError};
pub use payload::{MapPayload, Payload, PayloadError};
pub use types::{BranchId, MessageId, TenantId, UserId};
