//! Engine adapter: streams turns from the external code-assistant engine.

mod cli;
mod types;

pub use cli::{parse_engine_line, CliEngine, CliEngineConfig};
pub use types::{
    EngineAdapter, EngineError, EngineEvent, EngineResult, EventStream, PermissionMode,
    StreamOptions, TurnOutcome,
};
