// src/buffer/mod.rs - Command buffer / queue manager
//
// Hash-indexed ordered queue of pending action items. Owns the
// pause/resume/clear protocol and the Target-side bookkeeping; the
// runner's start/done notifications drive Actual promotion and item
// removal. Side effects embedded in items fire only when the item
// reaches the real hardware queue head, never at enqueue time.
pub mod render;

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::BotConfig;
use crate::ipc::{BufferItemPayload, DirectCommandPayload, IpcMessage};
use crate::motion::Point;
use crate::pen::{HeightTarget, PenBank, PenPatch, PenState, StateEvent};

/// Controller-local closure carried by a Custom action. Never crosses
/// the runner IPC boundary.
pub type CustomFn = Box<dyn FnOnce(&mut PenBank) + Send>;

/// Controller-local named callback registered with the buffer.
pub type CallbackFn = Box<dyn Fn(&mut PenBank) + Send>;

/// A drawing intent. Closed union so rendering and side-effect
/// triggering are statically exhaustive.
pub enum Action {
    /// Absolute move in steps.
    Move { x: f64, y: f64 },
    /// Pen height change, preset or continuum.
    Height(HeightTarget),
    /// Broadcast a message to observers when this item completes.
    Message(String),
    /// Fire a registered named callback when this item completes.
    CallbackName(String),
    /// Run an in-process closure when this item completes.
    Custom(CustomFn),
    /// Raw command string (or template name) passed through verbatim.
    Special(String),
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Move { x, y } => write!(f, "Move({x}, {y})"),
            Action::Height(t) => write!(f, "Height({t:?})"),
            Action::Message(m) => write!(f, "Message({m:?})"),
            Action::CallbackName(n) => write!(f, "CallbackName({n:?})"),
            Action::Custom(_) => write!(f, "Custom(..)"),
            Action::Special(c) => write!(f, "Special({c:?})"),
        }
    }
}

impl Action {
    /// Serializable descriptor fed to the item hash.
    fn describe(&self) -> Value {
        match self {
            Action::Move { x, y } => json!({ "type": "move", "x": x, "y": y }),
            Action::Height(t) => json!({ "type": "height", "target": t }),
            Action::Message(m) => json!({ "type": "message", "message": m }),
            Action::CallbackName(n) => json!({ "type": "callbackname", "name": n }),
            Action::Custom(_) => json!({ "type": "custom" }),
            Action::Special(c) => json!({ "type": "special", "command": c }),
        }
    }
}

/// Completion side effect held back until the runner reports done.
enum SideEffect {
    Message(String),
    Callback(String),
    Custom(CustomFn),
}

/// One hash-identified unit of enqueued work.
pub struct ActionItem {
    pub hash: String,
    /// Runner-bound rendered commands; pure data.
    pub commands: Vec<String>,
    pub duration_ms: u64,
    /// Target state captured at enqueue; promoted into Actual when the
    /// runner starts this item.
    pub target_snapshot: PenState,
    side_effect: Option<SideEffect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Idle,
    Running,
    Paused,
}

/// The queue manager. Owned by the controller-side service; never
/// shared with the runner process.
pub struct Buffer {
    config: BotConfig,
    state: BufferState,
    order: VecDeque<String>,
    items: HashMap<String, ActionItem>,
    /// Monotonic counter folded into every hash so duplicate content
    /// still gets a unique identity.
    seq: u64,
    /// Hash the runner has started but not yet completed.
    in_flight: Option<String>,
    pause_capture: Option<PenState>,
    pause_waiters: Vec<oneshot::Sender<()>>,
    /// Bumped by clear(); in-flight batch imports check it between items.
    batch_generation: u64,
    callbacks: HashMap<String, CallbackFn>,
    events: broadcast::Sender<StateEvent>,
    ipc: mpsc::UnboundedSender<IpcMessage>,
}

impl Buffer {
    pub fn new(
        config: BotConfig,
        events: broadcast::Sender<StateEvent>,
        ipc: mpsc::UnboundedSender<IpcMessage>,
    ) -> Self {
        Self {
            config,
            state: BufferState::Idle,
            order: VecDeque::new(),
            items: HashMap::new(),
            seq: 0,
            in_flight: None,
            pause_capture: None,
            pause_waiters: Vec::new(),
            batch_generation: 0,
            callbacks: HashMap::new(),
            events,
            ipc,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn pending(&self) -> usize {
        self.order.len()
    }

    pub fn batch_generation(&self) -> u64 {
        self.batch_generation
    }

    pub fn register_callback(&mut self, name: &str, callback: CallbackFn) {
        self.callbacks.insert(name.to_string(), callback);
    }

    /// Enqueue an action: mutate Target, render, store, forward the
    /// rendered payload to the runner, notify observers. Returns the
    /// item hash.
    pub fn add_action(&mut self, action: Action, pen: &mut PenBank) -> String {
        let hash = self.next_hash(&action.describe());

        let (commands, duration_ms, side_effect) = match action {
            Action::Move { x, y } => {
                let from = Point::new(pen.target().x, pen.target().y);
                let to = Point::new(x, y);
                let pen_down = pen.target().is_down();
                let (commands, duration) =
                    render::render_move(&self.config, from, to, pen_down);
                let mut patch = PenPatch {
                    x: Some(x),
                    y: Some(y),
                    off_canvas: Some(!self.config.area.contains(x, y)),
                    last_duration: Some(duration),
                    buffer_hash: Some(hash.clone()),
                    ..PenPatch::default()
                };
                if pen_down {
                    patch.distance_counter =
                        Some(pen.target().distance_counter + from.distance_to(&to));
                }
                pen.set_target(patch);
                (commands, duration, None)
            }
            Action::Height(target) => {
                let (commands, duration, servo_pos, state) =
                    render::render_height_target(&self.config, pen.target().height, &target);
                pen.set_target(PenPatch {
                    height: Some(servo_pos),
                    state: Some(state),
                    last_duration: Some(duration),
                    buffer_hash: Some(hash.clone()),
                    ..PenPatch::default()
                });
                (commands, duration, None)
            }
            Action::Message(message) => (Vec::new(), 1, Some(SideEffect::Message(message))),
            Action::CallbackName(name) => (Vec::new(), 1, Some(SideEffect::Callback(name))),
            Action::Custom(callback) => (Vec::new(), 1, Some(SideEffect::Custom(callback))),
            Action::Special(command) => {
                let rendered = match self.config.template(&command) {
                    Some(template) => template.to_string(),
                    None => command,
                };
                (vec![rendered], 1, None)
            }
        };
        let duration_ms = duration_ms.max(1);

        let item = ActionItem {
            hash: hash.clone(),
            commands: commands.clone(),
            duration_ms,
            target_snapshot: pen.target().clone(),
            side_effect,
        };
        self.items.insert(hash.clone(), item);
        self.order.push_back(hash.clone());

        self.send(IpcMessage::new(
            "buffer.add",
            serde_json::to_value(BufferItemPayload {
                hash: hash.clone(),
                commands,
                duration_ms,
            })
            .unwrap_or(Value::Null),
        ));
        self.notify_buffer_changed();

        if self.state == BufferState::Idle {
            self.state = BufferState::Running;
        }
        hash
    }

    /// Runner notification: an item reached the hardware queue head.
    /// Its captured future state becomes the present state.
    pub fn start_item(&mut self, hash: &str, pen: &mut PenBank) {
        match self.items.get(hash) {
            Some(item) => {
                pen.promote_to_actual(item.target_snapshot.clone());
                self.in_flight = Some(hash.to_string());
            }
            None => {
                tracing::warn!("Invariant violation: start for unknown buffer hash {}", hash);
            }
        }
    }

    /// Runner notification: an item's commands fully drained. Removes
    /// the item and fires any embedded side effect now, preserving
    /// ordering with the serial work.
    pub fn remove_item(&mut self, hash: &str, pen: &mut PenBank) {
        let Some(item) = self.items.remove(hash) else {
            tracing::warn!("Invariant violation: done for unknown buffer hash {}", hash);
            return;
        };
        self.order.retain(|h| h != hash);
        if self.in_flight.as_deref() == Some(hash) {
            self.in_flight = None;
        }

        match item.side_effect {
            Some(SideEffect::Message(message)) => {
                let _ = self.events.send(StateEvent::Message(message));
            }
            Some(SideEffect::Callback(name)) => match self.callbacks.get(&name) {
                Some(callback) => callback(pen),
                None => tracing::warn!("No callback registered under '{}'", name),
            },
            Some(SideEffect::Custom(callback)) => callback(pen),
            None => {}
        }

        self.notify_buffer_changed();

        if self.order.is_empty() {
            pen.reset_target_to_actual();
            if self.state == BufferState::Running {
                self.state = BufferState::Idle;
            }
        }
        if self.state == BufferState::Paused && self.in_flight.is_none() {
            self.resolve_pause_waiters();
        }
    }

    /// Pause dequeuing at the next item boundary. Captures Actual at
    /// request time and issues a safety pen-up outside the buffer. The
    /// returned receiver resolves once nothing is in flight.
    pub fn pause(&mut self, pen: &PenBank) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.state == BufferState::Paused {
            if self.in_flight.is_none() {
                let _ = tx.send(());
            } else {
                self.pause_waiters.push(tx);
            }
            return rx;
        }

        self.state = BufferState::Paused;
        // Request-time capture: the in-flight item may still promote
        // Actual past this; resume()'s drift check repairs that.
        self.pause_capture = Some(pen.actual().clone());
        self.direct_height(pen.actual().height, &HeightTarget::preset("up"));
        self.send(IpcMessage::new("buffer.pause", Value::Null));

        if self.in_flight.is_none() {
            let _ = tx.send(());
        } else {
            self.pause_waiters.push(tx);
        }
        rx
    }

    /// Resume dequeuing. If Actual drifted from the pause capture (a
    /// skip-buffer move happened while paused), replay pen-up, travel
    /// back to the capture point and restore the height first.
    pub fn resume(&mut self, pen: &mut PenBank) {
        if self.state != BufferState::Paused {
            return;
        }
        if let Some(capture) = self.pause_capture.take() {
            if !pen.actual().same_pose(&capture) {
                tracing::info!(
                    "Actual drifted during pause; replaying motion back to ({}, {})",
                    capture.x,
                    capture.y
                );
                self.direct_height(pen.actual().height, &HeightTarget::preset("up"));
                let from = Point::new(pen.actual().x, pen.actual().y);
                let to = Point::new(capture.x, capture.y);
                let (commands, duration_ms) =
                    render::render_direct_move(&self.config, from, to);
                self.send_direct(commands, duration_ms);
                let (commands, duration_ms) =
                    render::render_height(&self.config, pen.actual().height, capture.height);
                self.send_direct(commands, duration_ms);
                pen.force_actual(capture);
            }
        }
        self.send(IpcMessage::new("buffer.resume", Value::Null));
        self.state = if self.order.is_empty() {
            BufferState::Idle
        } else {
            BufferState::Running
        };
    }

    /// Discard all pending items, reset Target to Actual and cancel any
    /// in-flight batch import. The runner's own queue is authoritative
    /// for what was already dispatched.
    pub fn clear(&mut self, pen: &mut PenBank) {
        self.send(IpcMessage::new("buffer.clear", Value::Null));
        self.order.clear();
        self.items.clear();
        self.in_flight = None;
        self.batch_generation += 1;
        pen.reset_target_to_actual();
        if self.state == BufferState::Running {
            self.state = BufferState::Idle;
        }
        self.notify_buffer_changed();
    }

    /// Send a skip-buffer height change; used for the pause safety
    /// pen-up and resume replay. Does not touch the state records.
    pub fn direct_height(&mut self, from_height: u32, target: &HeightTarget) {
        let (commands, duration_ms, _, _) =
            render::render_height_target(&self.config, from_height, target);
        self.send_direct(commands, duration_ms);
    }

    /// Send a raw skip-buffer command batch to the runner.
    pub fn send_direct(&mut self, commands: Vec<String>, duration_ms: u64) {
        if commands.is_empty() {
            return;
        }
        self.send(IpcMessage::new(
            "serial.direct.command",
            serde_json::to_value(DirectCommandPayload {
                commands,
                duration_ms,
            })
            .unwrap_or(Value::Null),
        ));
    }

    fn next_hash(&mut self, descriptor: &Value) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        descriptor.to_string().hash(&mut hasher);
        self.seq.hash(&mut hasher);
        self.seq += 1;
        format!("{:016x}", hasher.finish())
    }

    fn resolve_pause_waiters(&mut self) {
        for waiter in self.pause_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn notify_buffer_changed(&self) {
        let _ = self.events.send(StateEvent::BufferChanged {
            pending: self.order.len(),
        });
    }

    fn send(&self, msg: IpcMessage) {
        if self.ipc.send(msg).is_err() {
            tracing::warn!("Runner IPC channel closed; dropping outbound message");
        }
    }
}
