//! The outbound half of the engine: a resumable multi-subscriber event
//! buffer and the websocket gateway that exposes the engine's commands
//! and push events to front ends.

pub mod buffer;
pub mod commands;
pub mod connection;
pub mod gateway;
pub mod registry;

pub use buffer::{Buffered, EventBuffer, NotResumable, SubscriberId};
pub use commands::{CommandError, CommandHost};
pub use connection::{ResumeQuery, handle_connection};
pub use gateway::{CONTENT_VERSION, Gateway, GatewayConfig};
pub use registry::{RequestGuard, RequestRegistry};
