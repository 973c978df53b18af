// src/runner/serial.rs - Serial port manager with simulation fallback
//
// Owned by the runner process. Handles discovery, connect/reconnect
// with bounded fixed-interval retries, raw writes, and a simulation
// mode where every write completes after a minimal delay with an
// injected acknowledgment so duration-based scheduling runs unmodified.
use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use serial2_tokio::SerialPort;
use thiserror::Error;
use tokio::time::{sleep, timeout};

use crate::config::SerialSettings;

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("open failed: {0}")]
    Open(#[source] std::io::Error),
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("not connected")]
    NotConnected,
}

impl SerialError {
    /// Stable error type name reported over IPC as `serial.error{type}`.
    pub fn kind(&self) -> &'static str {
        match self {
            SerialError::Open(_) => "open",
            SerialError::Write(_) => "write",
            SerialError::NotConnected => "not_connected",
        }
    }
}

pub struct SerialManager {
    settings: SerialSettings,
    port: Option<SerialPort>,
    simulation: bool,
    /// Acks queued by simulated writes, drained by poll_incoming().
    sim_pending: VecDeque<String>,
    read_buf: Vec<u8>,
}

impl SerialManager {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
            simulation: false,
            sim_pending: VecDeque::new(),
            read_buf: Vec::new(),
        }
    }

    /// Force simulation mode without touching hardware.
    pub fn simulated(settings: SerialSettings) -> Self {
        let mut manager = Self::new(settings);
        manager.simulation = true;
        manager
    }

    pub fn is_simulation(&self) -> bool {
        self.simulation
    }

    pub fn is_connected(&self) -> bool {
        self.simulation || self.port.is_some()
    }

    /// Connect to the configured or autodetected port, retrying at a
    /// fixed interval for a bounded number of attempts before falling
    /// back to simulation. Returns true when real hardware is attached.
    pub async fn connect(&mut self) -> bool {
        if self.simulation {
            return false;
        }
        let attempts = self.settings.max_reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.open_port() {
                Ok(port) => {
                    tracing::info!("Serial port connected on attempt {}", attempt);
                    self.port = Some(port);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        "Serial connect attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                }
            }
            if attempt < attempts {
                sleep(Duration::from_millis(self.settings.reconnect_interval_ms)).await;
            }
        }
        tracing::warn!("No serial hardware reachable; falling back to simulation");
        self.simulation = true;
        false
    }

    fn open_port(&self) -> Result<SerialPort, SerialError> {
        let path = match &self.settings.port {
            Some(path) => path.clone(),
            None => self.autodetect()?,
        };
        tracing::debug!("Opening serial port {} at {} baud", path, self.settings.baud);
        SerialPort::open(&path, self.settings.baud).map_err(SerialError::Open)
    }

    fn autodetect(&self) -> Result<String, SerialError> {
        let ports = SerialPort::available_ports().map_err(SerialError::Open)?;
        ports
            .iter()
            .filter_map(|p| p.to_str().map(|s| s.to_string()))
            .find(|p| p.contains(&self.settings.port_hint))
            .ok_or_else(|| {
                SerialError::Open(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no port matching '{}'", self.settings.port_hint),
                ))
            })
    }

    /// Write one command and wait for it to physically drain. In
    /// simulation the write completes after a 1-5 ms delay and queues
    /// the configured acknowledgment string.
    pub async fn write(&mut self, command: &str) -> Result<(), SerialError> {
        if self.simulation {
            let delay = rand::rng().random_range(1..=5);
            sleep(Duration::from_millis(delay)).await;
            self.sim_pending.push_back(self.settings.ack.clone());
            tracing::trace!("Simulated write: {}", command);
            return Ok(());
        }
        // Take the port out so a failed write drops the handle and
        // leaves the manager disconnected.
        let Some(port) = self.port.take() else {
            return Err(SerialError::NotConnected);
        };
        let mut frame = command.as_bytes().to_vec();
        frame.push(b'\r');
        let mut written = 0;
        while written < frame.len() {
            match port.write(&frame[written..]).await {
                Ok(n) => written += n,
                Err(e) => return Err(SerialError::Write(e)),
            }
        }
        self.port = Some(port);
        tracing::trace!("Serial TX: {}", command);
        Ok(())
    }

    /// Non-blocking-ish poll for one line of incoming data (board acks
    /// and unsolicited messages). Returns at most one line per call.
    pub async fn poll_incoming(&mut self) -> Option<String> {
        if self.simulation {
            return self.sim_pending.pop_front();
        }
        if let Some(line) = self.extract_line() {
            return Some(line);
        }
        let mut chunk = [0u8; 256];
        let read = {
            let port = self.port.as_ref()?;
            timeout(Duration::from_millis(1), port.read(&mut chunk)).await
        };
        match read {
            Ok(Ok(0)) | Err(_) => None,
            Ok(Ok(n)) => {
                self.read_buf.extend_from_slice(&chunk[..n]);
                self.extract_line()
            }
            Ok(Err(e)) => {
                tracing::warn!("Serial read error: {}", e);
                None
            }
        }
    }

    fn extract_line(&mut self) -> Option<String> {
        let pos = self
            .read_buf
            .iter()
            .position(|&b| b == b'\n' || b == b'\r')?;
        let line: Vec<u8> = self.read_buf.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line).trim().to_string();
        if text.is_empty() {
            // Bare delimiter; try the rest of the buffer.
            return self.extract_line();
        }
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SerialSettings;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_simulated_write_completes_quickly_with_ack() {
        let mut manager = SerialManager::simulated(SerialSettings::default());
        let start = Instant::now();
        manager.write("SM,100,10,10").await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(manager.poll_incoming().await.as_deref(), Some("OK"));
        assert!(manager.poll_incoming().await.is_none());
    }

    #[tokio::test]
    async fn test_simulated_acks_are_fifo() {
        let mut manager = SerialManager::simulated(SerialSettings {
            ack: "ACK".to_string(),
            ..SerialSettings::default()
        });
        manager.write("a").await.unwrap();
        manager.write("b").await.unwrap();
        assert_eq!(manager.poll_incoming().await.as_deref(), Some("ACK"));
        assert_eq!(manager.poll_incoming().await.as_deref(), Some("ACK"));
    }

    #[tokio::test]
    async fn test_connect_falls_back_to_simulation() {
        let settings = SerialSettings {
            port: Some("/dev/does-not-exist-plotbot".to_string()),
            reconnect_interval_ms: 1,
            max_reconnect_attempts: 2,
            ..SerialSettings::default()
        };
        let mut manager = SerialManager::new(settings);
        let hardware = manager.connect().await;
        assert!(!hardware);
        assert!(manager.is_simulation());
        assert!(manager.is_connected());
        // Writes keep working unmodified.
        manager.write("EM,0,0").await.unwrap();
        assert!(manager.poll_incoming().await.is_some());
    }

    #[test]
    fn test_line_extraction_handles_crlf() {
        let mut manager = SerialManager::simulated(SerialSettings::default());
        manager.simulation = false;
        manager.read_buf.extend_from_slice(b"OK\r\nready\r\npartial");
        assert_eq!(manager.extract_line().as_deref(), Some("OK"));
        assert_eq!(manager.extract_line().as_deref(), Some("ready"));
        assert_eq!(manager.extract_line(), None);
        assert_eq!(manager.read_buf, b"partial");
    }
}
