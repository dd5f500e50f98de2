//! Agent-to-agent messaging: mailboxes, the bus, and type-based routing.
//!
//! - `mailbox` -- bounded FIFO read end owned by one agent
//! - `bus` -- `MessageBus` with an ingress queue, dispatch loop and broadcast
//! - `router` -- `MessageRouter` fan-out keyed by message type
//! - `envelope` -- helper constructors for `AgentMessage`

pub mod bus;
pub mod envelope;
pub mod mailbox;
pub mod router;

pub use bus::{BusError, MessageBus};
pub use mailbox::Mailbox;
pub use router::MessageRouter;
