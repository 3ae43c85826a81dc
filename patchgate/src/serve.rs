//! Line-delimited JSON driver.
//!
//! One request object per input line, one response object per output line.
//! Approvals arrive on the same channel but are a separate message type, so an
//! agent's tool calls can never approve anything by themselves.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{ErrorPayload, ToolError};
use crate::review::{Decision, ReviewOutcome, TokenGate};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    ToolCall {
        #[serde(default)]
        id: Option<Value>,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    Approval {
        token: String,
    },
    NewTurn,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    ToolResult {
        id: Option<Value>,
        name: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    ApprovalResult {
        decision: Decision,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<ReviewOutcome>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    TurnStarted,
    Error {
        message: String,
    },
}

/// Counters reported when the input ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeStats {
    pub tool_calls: u32,
    pub approvals: u32,
    pub malformed: u32,
}

/// Handle one inbound message.
pub fn handle(dispatcher: &mut Dispatcher, message: Inbound) -> Outbound {
    match message {
        Inbound::ToolCall {
            id,
            name,
            arguments,
        } => {
            let (ok, result, error) = split(dispatcher.dispatch(&name, arguments));
            Outbound::ToolResult {
                id,
                name,
                ok,
                result,
                error,
            }
        }
        Inbound::Approval { token } => {
            let gate = TokenGate::from_token(&token);
            let (ok, result, error) = split(dispatcher.review(&gate));
            Outbound::ApprovalResult {
                decision: gate.0,
                ok,
                result,
                error,
            }
        }
        Inbound::NewTurn => {
            dispatcher.new_turn();
            Outbound::TurnStarted
        }
    }
}

fn split<T>(result: Result<T, ToolError>) -> (bool, Option<T>, Option<ErrorPayload>) {
    match result {
        Ok(value) => (true, Some(value), None),
        Err(err) => (false, None, Some(err.to_payload())),
    }
}

/// Run until `input` is exhausted. Only transport I/O failures are errors.
pub fn serve<R: BufRead, W: Write>(
    dispatcher: &mut Dispatcher,
    input: R,
    mut output: W,
) -> Result<ServeStats> {
    let mut stats = ServeStats::default();
    info!(session = dispatcher.engine().session().id(), "serving");
    for line in input.lines() {
        let line = line.context("read request line")?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Inbound>(&line) {
            Ok(message) => {
                match &message {
                    Inbound::ToolCall { name, .. } => {
                        debug!(tool = %name, "tool call received");
                        stats.tool_calls += 1;
                    }
                    Inbound::Approval { .. } => stats.approvals += 1,
                    Inbound::NewTurn => {}
                }
                handle(dispatcher, message)
            }
            Err(err) => {
                warn!(err = %err, "malformed request line");
                stats.malformed += 1;
                Outbound::Error {
                    message: format!("malformed request: {err}"),
                }
            }
        };
        let mut payload = serde_json::to_string(&response).context("serialize response")?;
        payload.push('\n');
        output
            .write_all(payload.as_bytes())
            .context("write response line")?;
        output.flush().context("flush response")?;
    }
    info!(
        tool_calls = stats.tool_calls,
        approvals = stats.approvals,
        malformed = stats.malformed,
        "input closed"
    );
    Ok(stats)
}
