//! Client for the runbox session protocol.
//!
//! Used by the integration tests; also a reference for how a frontend
//! talks to the daemon.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use runbox_proto::{ClientMessage, ServerMessage};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("communication failed: {0}")]
    Communication(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One session's view of the daemon: send client messages, read server
/// messages, in order.
pub struct SessionClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl SessionClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| ClientError::Connection(format!("failed to connect to {addr}: {err}")))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        let mut payload = serde_json::to_string(message)
            .map_err(|err| ClientError::Protocol(format!("failed to encode message: {err}")))?;
        payload.push('\n');
        self.writer
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| ClientError::Communication(format!("failed to send message: {err}")))
    }

    /// Submit source code, starting (or replacing) the active run.
    pub async fn submit_code(&mut self, user_id: &str, code: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::code(user_id, code)).await
    }

    /// Send one line for the running process's standard input.
    pub async fn submit_input(&mut self, data: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::input(data)).await
    }

    /// Ask the daemon to terminate the active run.
    pub async fn request_stop(&mut self, user_id: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::stop(user_id)).await
    }

    /// Next message from the daemon, or `None` once the connection is
    /// closed.
    pub async fn next_message(&mut self) -> Result<Option<ServerMessage>, ClientError> {
        let line = self
            .lines
            .next_line()
            .await
            .map_err(|err| ClientError::Communication(format!("failed to read message: {err}")))?;
        match line {
            Some(line) => serde_json::from_str(&line)
                .map(Some)
                .map_err(|err| ClientError::Protocol(format!("invalid server message: {err}"))),
            None => Ok(None),
        }
    }
}
