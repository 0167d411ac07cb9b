//! Engine adapter backed by the code-assistant CLI.
//!
//! Spawns one CLI process per turn in streaming JSON mode and decodes its
//! stdout line by line into normalized [`EngineEvent`]s. Cancellation kills
//! the child process and terminates the stream promptly.

use log::{debug, warn};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::types::{
    EngineAdapter, EngineError, EngineEvent, EngineResult, EventStream, StreamOptions, TurnOutcome,
};

/// Buffer size for the per-turn event channel.
const EVENT_BUFFER_SIZE: usize = 64;

/// Configuration for the CLI engine.
#[derive(Debug, Clone)]
pub struct CliEngineConfig {
    /// Path to the engine executable (e.g. "claude").
    pub binary: String,
}

impl Default for CliEngineConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
        }
    }
}

/// Engine adapter that drives the assistant CLI as a subprocess.
#[derive(Debug, Clone)]
pub struct CliEngine {
    config: CliEngineConfig,
}

impl CliEngine {
    pub fn new(config: CliEngineConfig) -> Self {
        Self { config }
    }
}

impl EngineAdapter for CliEngine {
    fn stream(&self, prompt: String, options: StreamOptions) -> EventStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let config = self.config.clone();

        tokio::spawn(async move {
            run_turn(config, prompt, options, tx).await;
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

/// Run one CLI turn, forwarding decoded events into `tx`.
async fn run_turn(
    config: CliEngineConfig,
    prompt: String,
    options: StreamOptions,
    tx: mpsc::Sender<EngineResult<EngineEvent>>,
) {
    let mut cmd = Command::new(&config.binary);
    cmd.arg("-p")
        .arg(&prompt)
        .arg("--output-format")
        .arg("stream-json")
        .arg("--verbose")
        .arg("--model")
        .arg(&options.model)
        .arg("--max-turns")
        .arg(options.max_turns.to_string())
        .arg("--permission-mode")
        .arg(options.permission_mode.as_str());

    if let Some(ref token) = options.resume_token {
        cmd.arg("--resume").arg(token);
    }
    if let Some(ref tools) = options.allowed_tools {
        cmd.arg("--allowed-tools").arg(tools.join(","));
    }
    if let Some(ref suffix) = options.system_prompt_suffix {
        cmd.arg("--append-system-prompt").arg(suffix);
    }
    if let Some(ref servers) = options.mcp_servers {
        match serde_json::to_string(&serde_json::json!({ "mcpServers": servers })) {
            Ok(json) => {
                cmd.arg("--mcp-config").arg(json);
            }
            Err(e) => warn!("Failed to serialize MCP config, skipping: {}", e),
        }
    }

    cmd.current_dir(&options.cwd);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = tx.send(Err(EngineError::Spawn(e))).await;
            return;
        }
    };

    let stdout = child
        .stdout
        .take()
        .expect("child stdout is piped at spawn");
    let mut lines = BufReader::new(stdout).lines();
    let mut saw_terminal = false;

    loop {
        tokio::select! {
            _ = options.cancel.cancelled() => {
                debug!("Engine turn cancelled, killing child process");
                let _ = child.start_kill();
                let _ = tx.send(Err(EngineError::Cancelled)).await;
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_engine_line(line) {
                        Ok(events) => {
                            for event in events {
                                if matches!(event, EngineEvent::TurnResult { .. }) {
                                    saw_terminal = true;
                                }
                                if tx.send(Ok(event)).await.is_err() {
                                    // Receiver gone; stop the child and bail.
                                    let _ = child.start_kill();
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("Dropping undecodable engine line: {}", e);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = child.start_kill();
                    let _ = tx
                        .send(Err(EngineError::Failure(format!(
                            "reading engine output: {}",
                            e
                        ))))
                        .await;
                    return;
                }
            }
        }
    }

    // Stdout closed; reap the child and surface abnormal exits that did not
    // produce a terminal event.
    let stderr = match child.stderr.take() {
        Some(mut pipe) => {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf).await;
            buf
        }
        None => String::new(),
    };

    match child.wait().await {
        Ok(status) if status.success() || saw_terminal => {}
        Ok(status) => {
            let message = if stderr.trim().is_empty() {
                format!("engine exited with {}", status)
            } else {
                format!("engine exited with {}: {}", status, stderr.trim())
            };
            let _ = tx.send(Err(EngineError::Failure(message))).await;
        }
        Err(e) => {
            let _ = tx
                .send(Err(EngineError::Failure(format!(
                    "waiting for engine: {}",
                    e
                ))))
                .await;
        }
    }
}

/// Decode one stdout line into zero or more normalized events.
///
/// A single assistant message may carry several content blocks and therefore
/// expand to several events. Lines with an unknown `type` decode to an empty
/// vector and are logged by the caller's discretion here.
pub fn parse_engine_line(line: &str) -> EngineResult<Vec<EngineEvent>> {
    let value: Value = serde_json::from_str(line)?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let events = match kind.as_str() {
        "system" => parse_system(&value),
        "assistant" => parse_assistant(&value),
        "user" => parse_user(&value),
        "result" => parse_result(&value),
        other => {
            warn!("Dropping unknown engine event type: {:?}", other);
            Vec::new()
        }
    };

    Ok(events)
}

fn parse_system(value: &Value) -> Vec<EngineEvent> {
    let subtype = value.get("subtype").and_then(Value::as_str);
    if subtype != Some("init") {
        warn!("Dropping unknown system event subtype: {:?}", subtype);
        return Vec::new();
    }

    let Some(engine_session_id) = value.get("session_id").and_then(Value::as_str) else {
        warn!("Dropping system init event without session_id");
        return Vec::new();
    };

    vec![EngineEvent::SystemInit {
        engine_session_id: engine_session_id.to_string(),
        model: value
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string),
        cwd: value.get("cwd").and_then(Value::as_str).map(str::to_string),
        tools: value
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        mcp_servers: value
            .get("mcp_servers")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        permission_mode: value
            .get("permissionMode")
            .and_then(Value::as_str)
            .map(str::to_string),
    }]
}

fn parse_assistant(value: &Value) -> Vec<EngineEvent> {
    let mut events = Vec::new();

    let blocks = value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    events.push(EngineEvent::Assistant {
                        text: text.to_string(),
                    });
                }
            }
            Some("tool_use") => {
                let tool_name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let tool_id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                events.push(EngineEvent::ToolUse {
                    tool_name,
                    tool_id,
                    tool_input: block.get("input").cloned().unwrap_or(Value::Null),
                });
            }
            other => {
                debug!("Skipping assistant content block of type {:?}", other);
            }
        }
    }

    events
}

fn parse_user(value: &Value) -> Vec<EngineEvent> {
    let content = value.pointer("/message/content");

    // Tool results come back wrapped in a user message.
    if let Some(blocks) = content.and_then(Value::as_array) {
        let mut events = Vec::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("tool_result") => {
                    events.push(EngineEvent::ToolResult {
                        tool_use_id: block
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        content: block.get("content").map(content_to_text),
                        is_error: block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    });
                }
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        events.push(EngineEvent::UserEcho {
                            content: text.to_string(),
                        });
                    }
                }
                other => {
                    debug!("Skipping user content block of type {:?}", other);
                }
            }
        }
        return events;
    }

    if let Some(text) = content.and_then(Value::as_str) {
        return vec![EngineEvent::UserEcho {
            content: text.to_string(),
        }];
    }

    Vec::new()
}

fn parse_result(value: &Value) -> Vec<EngineEvent> {
    let subtype = value
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or("success");

    let outcome = if subtype == "success" {
        TurnOutcome::Success
    } else {
        TurnOutcome::Error(subtype.to_string())
    };

    vec![EngineEvent::TurnResult {
        outcome,
        total_cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
        duration_ms: value.get("duration_ms").and_then(Value::as_i64),
        result_text: value
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string),
    }]
}

/// Flatten a tool result `content` value (string or block list) into text.
fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
