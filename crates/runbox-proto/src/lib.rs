//! Wire protocol for runbox execution sessions.
//!
//! One message is one JSON object, newline-delimited on the wire. Field
//! names are camelCase to match the protocol spoken by existing clients.

use serde::{Deserialize, Serialize};

/// Exit code reported when a run exceeds its wall-clock limit.
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code reported when a run is terminated by an explicit stop, or the
/// process died to a signal without reporting a code of its own.
pub const EXIT_STOPPED: i32 = 137;

/// Exit code reported when the isolated process could not be launched.
pub const EXIT_LAUNCH_FAILED: i32 = 126;

/// Messages sent by the client to drive a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Start a run for the given source, replacing any active run.
    Code {
        #[serde(rename = "userId", default)]
        user_id: String,
        code: String,
    },
    /// One line of text for the running process's standard input.
    Input { data: String },
    /// Terminate the active run.
    Stop {
        #[serde(rename = "userId", default)]
        user_id: String,
    },
}

/// Messages sent by the server back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Text chunk from the process's standard output.
    Output { data: String },
    /// Text chunk from the process's standard error, or a session-level
    /// error description.
    Error { data: String },
    /// The run terminated with the given exit status.
    Exit { code: i32 },
}

impl ClientMessage {
    pub fn code(user_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Code {
            user_id: user_id.into(),
            code: code.into(),
        }
    }

    pub fn input(data: impl Into<String>) -> Self {
        Self::Input { data: data.into() }
    }

    pub fn stop(user_id: impl Into<String>) -> Self {
        Self::Stop {
            user_id: user_id.into(),
        }
    }
}

impl ServerMessage {
    pub fn output(data: impl Into<String>) -> Self {
        Self::Output { data: data.into() }
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self::Error { data: data.into() }
    }

    pub fn exit(code: i32) -> Self {
        Self::Exit { code }
    }
}
