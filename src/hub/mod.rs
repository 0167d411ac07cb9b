//! Session hub: per-session state machines, turn serialization, fan-out and
//! lifecycle management.

mod error;
mod queue;
mod registry;
mod session;

pub use error::GatewayError;
pub use queue::{prompt_queue, PromptQueue};
pub use registry::SessionHub;
pub use session::{ChatSession, SessionInfo, SubscriberSender};
