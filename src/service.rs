// src/service.rs - Controller-side service facade
//
// One PlotterService is constructed per process and passed by handle
// to the API layers; there is no ambient global state. It owns the pen
// state bank and the command buffer, spawns the runner (child process
// over stdio, or in-process for tests), and bridges runner lifecycle
// events back into buffer bookkeeping.
use std::process::Stdio;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::time::{Duration, sleep};
use uuid::Uuid;

use crate::buffer::{Action, Buffer, BufferState, CallbackFn, render};
use crate::config::BotConfig;
use crate::ipc::{ChannelTransport, IpcMessage, RunnerConfigPayload, StdioTransport, Transport};
use crate::motion::Point;
use crate::pen::{HeightTarget, PenBank, PenState, StateEvent};
use crate::runner::Runner;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to spawn runner: {0}")]
    Spawn(#[from] std::io::Error),
}

struct Inner {
    buffer: Buffer,
    pen: PenBank,
}

/// Respawn accounting for the runner child. A session that reached
/// runner.ready earns the full attempt budget back; consecutive
/// failures burn it down until the service destroys itself.
struct RespawnBudget {
    attempts: u32,
    max_attempts: u32,
}

impl RespawnBudget {
    fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    /// Record the end of a session (or a failed spawn). Returns false
    /// once the attempt budget is exhausted.
    fn session_ended(&mut self, reached_ready: bool) -> bool {
        if reached_ready {
            self.attempts = 0;
        }
        self.attempts += 1;
        self.attempts <= self.max_attempts
    }
}

pub struct PlotterService {
    config: BotConfig,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<StateEvent>,
    ipc_tx: mpsc::UnboundedSender<IpcMessage>,
}

impl PlotterService {
    /// Full two-process mode: spawn the runner binary as a child and
    /// talk to it over stdio. The bridge task respawns it on exit, at a
    /// fixed interval with bounded attempts, before giving up with a
    /// Destroyed event.
    pub fn spawn(config: BotConfig, force_simulation: bool) -> Self {
        let (service, ipc_rx) = Self::build(config);
        service.spawn_child_bridge(ipc_rx, force_simulation);
        service
    }

    /// In-process mode: the runner runs as a task over a channel
    /// transport. Used by tests and the `--in-process` flag.
    pub fn spawn_in_process(config: BotConfig, force_simulation: bool) -> Self {
        let (service, ipc_rx) = Self::build(config);
        let (controller_side, runner_side) = ChannelTransport::pair();
        tokio::spawn(async move {
            let mut runner = Runner::new(runner_side, force_simulation);
            if let Err(e) = runner.run().await {
                tracing::error!("In-process runner failed: {}", e);
            }
        });
        service.spawn_session_bridge(controller_side, ipc_rx);
        service
    }

    fn build(config: BotConfig) -> (Self, mpsc::UnboundedReceiver<IpcMessage>) {
        let (events, _) = broadcast::channel(256);
        let (ipc_tx, ipc_rx) = mpsc::unbounded_channel();
        let pen = PenBank::new(&config, events.clone());
        let buffer = Buffer::new(config.clone(), events.clone(), ipc_tx.clone());
        (
            Self {
                config,
                inner: Arc::new(Mutex::new(Inner { buffer, pen })),
                events,
                ipc_tx,
            },
            ipc_rx,
        )
    }

    /// Enqueue one action through the hash-based lifecycle. Returns the
    /// item hash.
    pub async fn run(&self, action: Action) -> String {
        let mut guard = self.inner.lock().await;
        let Inner { buffer, pen } = &mut *guard;
        buffer.add_action(action, pen)
    }

    /// Pause at the next item boundary; the returned receiver resolves
    /// once nothing is in flight on the hardware side.
    pub async fn pause(&self) -> oneshot::Receiver<()> {
        let mut guard = self.inner.lock().await;
        let Inner { buffer, pen } = &mut *guard;
        buffer.pause(pen)
    }

    pub async fn resume(&self) {
        let mut guard = self.inner.lock().await;
        let Inner { buffer, pen } = &mut *guard;
        buffer.resume(pen);
    }

    pub async fn clear(&self) {
        let mut guard = self.inner.lock().await;
        let Inner { buffer, pen } = &mut *guard;
        buffer.clear(pen);
    }

    /// Manual/emergency repositioning outside FIFO order. Updates
    /// Actual directly, which is what the resume drift check keys on.
    pub async fn skip_buffer_move(&self, x: f64, y: f64) {
        let mut guard = self.inner.lock().await;
        let Inner { buffer, pen } = &mut *guard;
        let from = Point::new(pen.actual().x, pen.actual().y);
        let (commands, duration_ms) =
            render::render_direct_move(&self.config, from, Point::new(x, y));
        buffer.send_direct(commands, duration_ms);
        let mut moved = pen.actual().clone();
        moved.x = x;
        moved.y = y;
        moved.last_duration = duration_ms;
        pen.force_actual(moved);
    }

    /// Immediate pen height change outside FIFO order. Bypasses the
    /// state records entirely, same as any other direct command.
    pub async fn direct_height(&self, target: HeightTarget) {
        let mut guard = self.inner.lock().await;
        let Inner { buffer, pen } = &mut *guard;
        let from = pen.actual().height;
        buffer.direct_height(from, &target);
    }

    /// Import a batch of actions in the background. clear() cancels the
    /// remainder by bumping the buffer's batch generation.
    pub async fn import_batch(&self, actions: Vec<Action>) -> Uuid {
        let job = Uuid::new_v4();
        let inner = self.inner.clone();
        let generation = {
            let guard = inner.lock().await;
            guard.buffer.batch_generation()
        };
        tokio::spawn(async move {
            let mut added = 0usize;
            for action in actions {
                {
                    let mut guard = inner.lock().await;
                    if guard.buffer.batch_generation() != generation {
                        tracing::info!("Batch {} cancelled after {} items", job, added);
                        return;
                    }
                    let Inner { buffer, pen } = &mut *guard;
                    buffer.add_action(action, pen);
                    added += 1;
                }
                tokio::task::yield_now().await;
            }
            tracing::debug!("Batch {} imported {} items", job, added);
        });
        job
    }

    pub async fn register_callback(&self, name: &str, callback: CallbackFn) {
        let mut guard = self.inner.lock().await;
        guard.buffer.register_callback(name, callback);
    }

    pub async fn target(&self) -> PenState {
        self.inner.lock().await.pen.target().clone()
    }

    pub async fn actual(&self) -> PenState {
        self.inner.lock().await.pen.actual().clone()
    }

    pub async fn buffer_state(&self) -> BufferState {
        self.inner.lock().await.buffer.state()
    }

    pub async fn pending(&self) -> usize {
        self.inner.lock().await.buffer.pending()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Bridge one live transport session: forward outbound messages,
    /// dispatch inbound ones. Ends when either side closes.
    fn spawn_session_bridge<T: Transport + 'static>(
        &self,
        mut transport: T,
        mut ipc_rx: mpsc::UnboundedReceiver<IpcMessage>,
    ) {
        let inner = self.inner.clone();
        let events = self.events.clone();
        let ipc_tx = self.ipc_tx.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    out = ipc_rx.recv() => match out {
                        Some(msg) => {
                            if transport.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    inbound = transport.recv() => match inbound {
                        Some(msg) => {
                            dispatch(msg, &inner, &events, &ipc_tx, &config).await;
                        }
                        None => break,
                    },
                }
            }
            tracing::info!("Runner bridge ended");
        });
    }

    /// Bridge with child-process lifecycle: spawn, run a session, and
    /// respawn on exit until the attempt budget runs out.
    fn spawn_child_bridge(
        &self,
        mut ipc_rx: mpsc::UnboundedReceiver<IpcMessage>,
        force_simulation: bool,
    ) {
        let inner = self.inner.clone();
        let events = self.events.clone();
        let ipc_tx = self.ipc_tx.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let mut budget = RespawnBudget::new(config.runner.max_respawn_attempts);
            loop {
                let mut child = match spawn_runner_child(force_simulation) {
                    Ok(child) => child,
                    Err(e) => {
                        tracing::error!("Failed to spawn runner: {}", e);
                        if !budget.session_ended(false) {
                            tracing::error!("Runner respawn budget exhausted; destroying");
                            let _ = events.send(StateEvent::Destroyed);
                            return;
                        }
                        sleep(Duration::from_millis(config.runner.respawn_interval_ms)).await;
                        continue;
                    }
                };
                let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take())
                else {
                    tracing::error!("Runner child has no piped stdio");
                    let _ = child.kill().await;
                    let _ = events.send(StateEvent::Destroyed);
                    return;
                };
                let mut transport = StdioTransport::new(stdout, stdin);

                let mut session_ready = false;
                loop {
                    tokio::select! {
                        out = ipc_rx.recv() => match out {
                            Some(msg) => {
                                if transport.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                // Service dropped; take the runner down.
                                let _ = child.kill().await;
                                return;
                            }
                        },
                        inbound = transport.recv() => match inbound {
                            Some(msg) => {
                                if msg.command == "runner.ready" {
                                    session_ready = true;
                                }
                                dispatch(msg, &inner, &events, &ipc_tx, &config).await;
                            }
                            None => break,
                        },
                    }
                }

                let _ = child.kill().await;
                let _ = events.send(StateEvent::SerialDisconnected);
                if !budget.session_ended(session_ready) {
                    tracing::error!("Runner respawn budget exhausted; destroying");
                    let _ = events.send(StateEvent::Destroyed);
                    return;
                }
                tracing::warn!("Runner exited; respawn attempt {}", budget.attempts);
                sleep(Duration::from_millis(config.runner.respawn_interval_ms)).await;
            }
        });
    }
}

/// Route one runner message into buffer bookkeeping and observer events.
async fn dispatch(
    msg: IpcMessage,
    inner: &Arc<Mutex<Inner>>,
    events: &broadcast::Sender<StateEvent>,
    ipc_tx: &mpsc::UnboundedSender<IpcMessage>,
    config: &BotConfig,
) {
    match msg.command.as_str() {
        "runner.ready" => {
            tracing::info!("Runner ready; sending configuration");
            let payload = serde_json::to_value(RunnerConfigPayload {
                runner: config.runner.clone(),
                serial: config.serial.clone(),
            })
            .unwrap_or(Value::Null);
            let _ = ipc_tx.send(IpcMessage::new("runner.config", payload));
            let _ = ipc_tx.send(IpcMessage::new("serial.connect", Value::Null));
        }
        "buffer.item.start" => {
            if let Some(hash) = msg.data.get("hash").and_then(|v| v.as_str()) {
                let hash = hash.to_string();
                let mut guard = inner.lock().await;
                let Inner { buffer, pen } = &mut *guard;
                buffer.start_item(&hash, pen);
            }
        }
        "buffer.item.done" => {
            if let Some(hash) = msg.data.get("hash").and_then(|v| v.as_str()) {
                let hash = hash.to_string();
                let mut guard = inner.lock().await;
                let Inner { buffer, pen } = &mut *guard;
                buffer.remove_item(&hash, pen);
            }
        }
        "buffer.running" => {
            let running = msg.data.as_bool().unwrap_or(false);
            let _ = events.send(StateEvent::BufferRunning(running));
        }
        "serial.connected" => {
            let simulation = msg
                .data
                .get("simulation")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if simulation {
                tracing::warn!("Serial link is simulated; no hardware attached");
            }
            {
                let mut guard = inner.lock().await;
                let mut actual = guard.pen.actual().clone();
                actual.simulation = simulation;
                guard.pen.force_actual(actual);
                if guard.buffer.pending() == 0 {
                    guard.pen.reset_target_to_actual();
                }
            }
            let _ = events.send(StateEvent::SerialConnected { simulation });
        }
        "serial.disconnected" => {
            let _ = events.send(StateEvent::SerialDisconnected);
        }
        "serial.error" => {
            let kind = msg
                .data
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let detail = msg
                .data
                .get("detail")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            tracing::warn!("Serial error from runner: {} ({})", kind, detail);
            let _ = events.send(StateEvent::SerialError { kind, detail });
        }
        "serial.data" => {
            if let Some(data) = msg.data.get("data").and_then(|v| v.as_str()) {
                let _ = events.send(StateEvent::SerialData(data.to_string()));
            }
        }
        other => {
            tracing::warn!("Unknown runner message '{}'", other);
        }
    }
}

fn spawn_runner_child(force_simulation: bool) -> std::io::Result<tokio::process::Child> {
    let exe = std::env::current_exe()?;
    let runner = exe
        .parent()
        .map(|dir| dir.join("plotbot-runner"))
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no executable directory")
        })?;
    let mut command = Command::new(runner);
    if force_simulation {
        command.arg("--simulation");
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pen::StateEvent;

    async fn wait_for_actual(
        events: &mut broadcast::Receiver<StateEvent>,
        predicate: impl Fn(&PenState) -> bool,
    ) -> PenState {
        loop {
            match events.recv().await.expect("event stream closed") {
                StateEvent::ActualChanged(state) if predicate(&state) => return state,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_in_process_move_reaches_actual() {
        let service = PlotterService::spawn_in_process(BotConfig::default(), true);
        let mut events = service.subscribe();
        let hash = service.run(Action::Move { x: 120.0, y: 40.0 }).await;
        let state = wait_for_actual(&mut events, |s| s.x == 120.0).await;
        assert_eq!(state.y, 40.0);
        assert_eq!(state.buffer_hash, hash);
        // Buffer drained: target collapsed into actual.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if service.pending().await == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(service.target().await, service.actual().await);
    }

    #[test]
    fn test_respawn_budget_exhausts_after_max_failures() {
        let mut budget = RespawnBudget::new(3);
        assert!(budget.session_ended(false));
        assert!(budget.session_ended(false));
        assert!(budget.session_ended(false));
        assert!(!budget.session_ended(false));
    }

    #[test]
    fn test_ready_session_restores_respawn_budget() {
        let mut budget = RespawnBudget::new(2);
        assert!(budget.session_ended(false));
        // A session that got to runner.ready resets the counter, so the
        // next failures get the full budget again.
        assert!(budget.session_ended(true));
        assert!(budget.session_ended(false));
        assert!(!budget.session_ended(false));
    }

    #[test]
    fn test_zero_budget_destroys_on_first_failure() {
        let mut budget = RespawnBudget::new(0);
        assert!(!budget.session_ended(false));
    }

    #[tokio::test]
    async fn test_clear_cancels_batch_import() {
        let service = PlotterService::spawn_in_process(BotConfig::default(), true);
        // Pause first so nothing drains while we race the clear.
        let _ = service.pause().await;
        let actions: Vec<Action> = (0..500)
            .map(|i| Action::Move {
                x: i as f64,
                y: 0.0,
            })
            .collect();
        let _job = service.import_batch(actions).await;
        tokio::task::yield_now().await;
        service.clear().await;
        let after_clear = service.pending().await;
        // Give the batch task time to run into the generation check.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = service.pending().await;
        assert_eq!(
            after_clear, settled,
            "batch import kept adding items after clear()"
        );
        assert_eq!(settled, 0);
    }
}
