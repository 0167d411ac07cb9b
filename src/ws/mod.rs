//! WebSocket frontend: frame schemas and the per-connection loop.

mod handler;
mod types;

pub use handler::ws_handler;
pub use types::{decode_command, ClientCommand, ServerEvent};
