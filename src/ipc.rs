// src/ipc.rs - Controller <-> runner message transport
//
// Messages are whole {command, data} values with per-direction FIFO
// delivery; the buffer's start/done ordering invariant depends on it.
// The wire format is one JSON object per line, which keeps framing
// trivial over child-process stdio.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::config::{RunnerSettings, SerialSettings};

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport closed")]
    Closed,
}

/// One IPC message: a dotted command name plus a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    pub command: String,
    #[serde(default)]
    pub data: Value,
}

impl IpcMessage {
    pub fn new(command: &str, data: Value) -> Self {
        Self {
            command: command.to_string(),
            data,
        }
    }

    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, IpcError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Runner-bound rendering of one buffer item: pure data only. Custom
/// and callback side effects stay controller-local and never cross
/// this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferItemPayload {
    pub hash: String,
    pub commands: Vec<String>,
    pub duration_ms: u64,
}

/// Payload for `serial.direct.command`: skip-buffer execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectCommandPayload {
    pub commands: Vec<String>,
    pub duration_ms: u64,
}

/// Payload for `runner.config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfigPayload {
    pub runner: RunnerSettings,
    pub serial: SerialSettings,
}

/// Payload for `serial.error` and `serial.connected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialErrorPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConnectedPayload {
    pub simulation: bool,
}

/// Ordered, asynchronous, bidirectional message channel.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, msg: IpcMessage) -> Result<(), IpcError>;
    /// Next inbound message; `None` means the peer is gone.
    async fn recv(&mut self) -> Option<IpcMessage>;
}

/// Newline-delimited JSON over any read/write pair. The controller
/// wraps the runner child's stdout/stdin; the runner wraps its own
/// stdin/stdout.
pub struct StdioTransport<R, W> {
    reader: BufReader<R>,
    writer: W,
    line: String,
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            line: String::new(),
        }
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: IpcMessage) -> Result<(), IpcError> {
        let mut frame = serde_json::to_string(&msg)?;
        frame.push('\n');
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<IpcMessage> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line).await {
                Ok(0) => return None,
                Ok(_) => {
                    let line = self.line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<IpcMessage>(line) {
                        Ok(msg) => return Some(msg),
                        Err(e) => {
                            // A malformed frame is a peer bug; skip it
                            // rather than tearing the link down.
                            tracing::warn!("Dropping malformed IPC frame: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("IPC read error: {}", e);
                    return None;
                }
            }
        }
    }
}

/// In-process transport over paired unbounded channels; used by tests
/// and by the in-process runner mode.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<IpcMessage>,
    rx: mpsc::UnboundedReceiver<IpcMessage>,
}

impl ChannelTransport {
    /// Build two cross-wired endpoints.
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport { tx: a_tx, rx: b_rx },
            ChannelTransport { tx: b_tx, rx: a_rx },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, msg: IpcMessage) -> Result<(), IpcError> {
        self.tx.send(msg).map_err(|_| IpcError::Closed)
    }

    async fn recv(&mut self) -> Option<IpcMessage> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_transport_fifo() {
        let (mut a, mut b) = ChannelTransport::pair();
        for i in 0..10 {
            a.send(IpcMessage::new("buffer.add", json!({ "seq": i })))
                .await
                .unwrap();
        }
        for i in 0..10 {
            let msg = b.recv().await.unwrap();
            assert_eq!(msg.command, "buffer.add");
            assert_eq!(msg.data["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_channel_transport_bidirectional() {
        let (mut a, mut b) = ChannelTransport::pair();
        a.send(IpcMessage::new("runner.config", Value::Null))
            .await
            .unwrap();
        b.send(IpcMessage::new("runner.ready", Value::Null))
            .await
            .unwrap();
        assert_eq!(b.recv().await.unwrap().command, "runner.config");
        assert_eq!(a.recv().await.unwrap().command, "runner.ready");
    }

    #[tokio::test]
    async fn test_stdio_transport_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let (c_read, c_write) = tokio::io::split(client);
        let (s_read, s_write) = tokio::io::split(server);
        let mut a = StdioTransport::new(c_read, c_write);
        let mut b = StdioTransport::new(s_read, s_write);

        a.send(IpcMessage::new(
            "buffer.add",
            json!({ "hash": "h1", "commands": ["SM,10,5,5"], "duration_ms": 10 }),
        ))
        .await
        .unwrap();
        let msg = b.recv().await.unwrap();
        assert_eq!(msg.command, "buffer.add");
        let payload: BufferItemPayload = msg.payload().unwrap();
        assert_eq!(payload.hash, "h1");
        assert_eq!(payload.duration_ms, 10);
    }

    #[tokio::test]
    async fn test_stdio_transport_skips_malformed_frames() {
        let (client, server) = tokio::io::duplex(4096);
        let (_c_read, mut c_write) = tokio::io::split(client);
        let (s_read, _s_write) = tokio::io::split(server);
        let mut b = StdioTransport::new(s_read, tokio::io::sink());

        c_write.write_all(b"this is not json\n").await.unwrap();
        c_write
            .write_all(b"{\"command\":\"runner.ready\",\"data\":null}\n")
            .await
            .unwrap();
        drop(_s_write);
        let msg = b.recv().await.unwrap();
        assert_eq!(msg.command, "runner.ready");
    }
}
