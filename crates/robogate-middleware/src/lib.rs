//! `robogate-middleware` – Transport plumbing
//!
//! Everything between a client socket and the safety pipeline that is not
//! itself a safety decision.
//!
//! # Modules
//!
//! - [`codec`] – MessagePack and JSON encoding of the
//!   [`Message`][robogate_types::Message] envelope, plus [`WireFormat`]
//!   selection.
//! - [`hub`] – [`Hub`][hub::Hub]: the serialized event loop that owns every
//!   client connection, its robot subscriptions and its bounded outbound
//!   queue.
//! - [`sink`] – [`PersistenceSink`][sink::PersistenceSink]: best-effort
//!   publication of sensor data and commands to an external store.

pub mod codec;
pub mod hub;
pub mod sink;

pub use codec::WireFormat;
pub use hub::{ClientHandle, ClientId, Hub, HubRunner, HubStats};
pub use sink::{HttpSink, NullSink, PersistenceSink};
