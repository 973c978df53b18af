// src/runner/mod.rs - Runner execution engine
//
// Runs in its own process so synchronous bursts on the controller side
// never perturb hardware timing. Consumes buffer items FIFO, writes
// their command strings to the serial manager, paces each item by its
// physical duration, and reports lifecycle events back over IPC.
pub mod serial;

use std::collections::VecDeque;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::{Duration, MissedTickBehavior, interval, sleep};

use crate::config::{RunnerSettings, SerialSettings};
use crate::ipc::{
    BufferItemPayload, DirectCommandPayload, IpcError, IpcMessage, RunnerConfigPayload, Transport,
};
use serial::SerialManager;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
}

pub struct Runner<T: Transport> {
    transport: T,
    settings: RunnerSettings,
    serial: SerialManager,
    fifo: VecDeque<BufferItemPayload>,
    paused: bool,
    running_reported: bool,
    /// Set by the CLI: never touch hardware.
    force_simulation: bool,
}

impl<T: Transport> Runner<T> {
    pub fn new(transport: T, force_simulation: bool) -> Self {
        let serial_settings = SerialSettings::default();
        Self {
            transport,
            settings: RunnerSettings::default(),
            serial: if force_simulation {
                SerialManager::simulated(serial_settings)
            } else {
                SerialManager::new(serial_settings)
            },
            fifo: VecDeque::new(),
            paused: false,
            running_reported: false,
            force_simulation,
        }
    }

    /// Main loop: poll/wake every poll interval, multiplexed with the
    /// IPC stream. Returns Ok(()) when the controller goes away; any
    /// error is treated as an unrecoverable disconnection by the caller.
    pub async fn run(&mut self) -> Result<(), RunnerError> {
        self.transport
            .send(IpcMessage::new("runner.ready", Value::Null))
            .await?;

        let mut tick = interval(Duration::from_millis(self.settings.poll_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                // Control messages win over the poll tick so pause and
                // clear are seen before the next item is dispatched.
                biased;
                msg = self.transport.recv() => {
                    match msg {
                        Some(msg) => {
                            let reconfigured = self.handle_message(msg).await?;
                            if reconfigured {
                                tick = interval(Duration::from_millis(
                                    self.settings.poll_interval_ms.max(1),
                                ));
                                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                            }
                        }
                        None => {
                            tracing::info!("Controller link closed; runner exiting");
                            return Ok(());
                        }
                    }
                }
                _ = tick.tick() => {
                    self.service_queue().await?;
                    self.forward_serial_data().await?;
                }
            }
        }
    }

    /// Handle one controller message. Returns true when pacing settings
    /// changed and the poll interval must be rebuilt.
    async fn handle_message(&mut self, msg: IpcMessage) -> Result<bool, RunnerError> {
        match msg.command.as_str() {
            "runner.config" => match msg.payload::<RunnerConfigPayload>() {
                Ok(config) => {
                    self.settings = config.runner;
                    self.serial = if self.force_simulation {
                        SerialManager::simulated(config.serial)
                    } else {
                        SerialManager::new(config.serial)
                    };
                    tracing::info!("Runner configured");
                    return Ok(true);
                }
                Err(e) => tracing::warn!("Bad runner.config payload: {}", e),
            },
            "serial.connect" => {
                let hardware = self.serial.connect().await;
                self.transport
                    .send(IpcMessage::new(
                        "serial.connected",
                        json!({ "simulation": !hardware }),
                    ))
                    .await?;
            }
            "serial.direct.command" => match msg.payload::<DirectCommandPayload>() {
                Ok(direct) => {
                    // Skip-buffer work runs even while paused.
                    for command in &direct.commands {
                        self.write_command(command).await?;
                    }
                    let wait = direct
                        .duration_ms
                        .saturating_sub(self.settings.latency_offset_ms);
                    if wait > 0 {
                        sleep(Duration::from_millis(wait)).await;
                    }
                }
                Err(e) => tracing::warn!("Bad serial.direct.command payload: {}", e),
            },
            "serial.direct.write" => {
                if let Some(data) = msg.data.get("data").and_then(|v| v.as_str()) {
                    let data = data.to_string();
                    self.write_command(&data).await?;
                } else {
                    tracing::warn!("Bad serial.direct.write payload");
                }
            }
            "buffer.add" => match msg.payload::<BufferItemPayload>() {
                Ok(item) => self.fifo.push_back(item),
                Err(e) => tracing::warn!("Bad buffer.add payload: {}", e),
            },
            "buffer.pause" => {
                tracing::debug!("Runner paused");
                self.paused = true;
            }
            "buffer.resume" => {
                tracing::debug!("Runner resumed");
                self.paused = false;
            }
            "buffer.clear" => {
                tracing::debug!("Runner queue cleared ({} items dropped)", self.fifo.len());
                self.fifo.clear();
            }
            other => {
                tracing::warn!("Unknown IPC command '{}'", other);
            }
        }
        Ok(false)
    }

    /// Drain the FIFO as an explicit work loop with a step budget:
    /// fast items (whose pacing wait collapses to zero) chain
    /// immediately until the budget is spent; a timed item yields back
    /// to the select loop after its wait elapses.
    async fn service_queue(&mut self) -> Result<(), RunnerError> {
        if self.paused || self.fifo.is_empty() {
            self.report_running(false).await?;
            return Ok(());
        }
        self.report_running(true).await?;

        let mut budget = self.settings.step_budget.max(1);
        loop {
            if self.paused {
                break;
            }
            let Some(item) = self.fifo.pop_front() else {
                break;
            };
            let chained = self.execute_item(item).await?;
            if !chained {
                break;
            }
            budget -= 1;
            if budget == 0 {
                break;
            }
        }
        if self.fifo.is_empty() {
            self.report_running(false).await?;
        }
        Ok(())
    }

    /// Execute one item: start event, sequential awaited writes, then
    /// duration pacing offset by the configured latency. Returns true
    /// when the item was fast enough to chain the next one immediately.
    async fn execute_item(&mut self, item: BufferItemPayload) -> Result<bool, RunnerError> {
        self.transport
            .send(IpcMessage::new(
                "buffer.item.start",
                json!({ "hash": item.hash }),
            ))
            .await?;

        for command in &item.commands {
            self.write_command(command).await?;
        }

        let wait = item
            .duration_ms
            .saturating_sub(self.settings.latency_offset_ms);
        let chained = wait == 0;
        if wait > 0 {
            sleep(Duration::from_millis(wait)).await;
        }

        self.transport
            .send(IpcMessage::new(
                "buffer.item.done",
                json!({ "hash": item.hash }),
            ))
            .await?;
        Ok(chained)
    }

    /// Serial failures are contained: reported as serial.error, never
    /// fatal for the runner itself.
    async fn write_command(&mut self, command: &str) -> Result<(), RunnerError> {
        if command.is_empty() {
            return Ok(());
        }
        match self.serial.write(command).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!("Serial write failed: {}", e);
                self.transport
                    .send(IpcMessage::new(
                        "serial.error",
                        json!({ "type": e.kind(), "detail": e.to_string() }),
                    ))
                    .await?;
                if !self.serial.is_connected() {
                    self.transport
                        .send(IpcMessage::new("serial.disconnected", Value::Null))
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn forward_serial_data(&mut self) -> Result<(), RunnerError> {
        while let Some(line) = self.serial.poll_incoming().await {
            self.transport
                .send(IpcMessage::new("serial.data", json!({ "data": line })))
                .await?;
        }
        Ok(())
    }

    async fn report_running(&mut self, running: bool) -> Result<(), RunnerError> {
        if self.running_reported == running {
            return Ok(());
        }
        self.running_reported = running;
        self.transport
            .send(IpcMessage::new("buffer.running", json!(running)))
            .await?;
        Ok(())
    }
}
