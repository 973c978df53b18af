// src/pen.rs - Target and Actual pen state records
//
// Target is the intended state at the tip of the buffer and mutates
// synchronously on enqueue. Actual is the confirmed physical state and
// mutates only from runner notifications. Only Actual changes are
// broadcast to observers.
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::{BotConfig, ServoSettings};

/// One pen state record, in motor steps and servo units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenState {
    pub x: f64,
    pub y: f64,
    /// Raw servo position.
    pub height: u32,
    /// Continuum position, 0 = up .. 1 = down.
    pub state: f64,
    pub tool: String,
    pub implement: String,
    pub off_canvas: bool,
    /// Steps of pen-down travel accumulated this session.
    pub distance_counter: f64,
    /// Duration of the last scheduled item, ms.
    pub last_duration: u64,
    /// Hash of the buffer item this state belongs to.
    pub buffer_hash: String,
    pub simulation: bool,
}

impl Default for PenState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            height: 0,
            state: 0.0,
            tool: "color0".to_string(),
            implement: "pen".to_string(),
            off_canvas: false,
            distance_counter: 0.0,
            last_duration: 0,
            buffer_hash: String::new(),
            simulation: false,
        }
    }
}

impl PenState {
    /// Parked state at origin with the pen raised.
    pub fn parked(config: &BotConfig) -> Self {
        let (height, state) = state_to_height(&HeightTarget::preset("up"), &config.servo);
        Self {
            height,
            state,
            ..Self::default()
        }
    }

    pub fn is_down(&self) -> bool {
        self.state > 0.5
    }

    /// Position/height equality used for pause drift detection; ignores
    /// bookkeeping fields like buffer_hash and counters.
    pub fn same_pose(&self, other: &PenState) -> bool {
        self.x == other.x && self.y == other.y && self.height == other.height
    }
}

/// Partial update merged into Target; only known keys exist by
/// construction, so unknown input cannot leak in.
#[derive(Debug, Clone, Default)]
pub struct PenPatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub height: Option<u32>,
    pub state: Option<f64>,
    pub tool: Option<String>,
    pub implement: Option<String>,
    pub off_canvas: Option<bool>,
    pub distance_counter: Option<f64>,
    pub last_duration: Option<u64>,
    pub buffer_hash: Option<String>,
    pub simulation: Option<bool>,
}

impl PenPatch {
    fn apply_to(&self, state: &mut PenState) {
        if let Some(x) = self.x {
            state.x = x;
        }
        if let Some(y) = self.y {
            state.y = y;
        }
        if let Some(height) = self.height {
            state.height = height;
        }
        if let Some(s) = self.state {
            state.state = s;
        }
        if let Some(ref tool) = self.tool {
            state.tool = tool.clone();
        }
        if let Some(ref implement) = self.implement {
            state.implement = implement.clone();
        }
        if let Some(off_canvas) = self.off_canvas {
            state.off_canvas = off_canvas;
        }
        if let Some(distance) = self.distance_counter {
            state.distance_counter = distance;
        }
        if let Some(d) = self.last_duration {
            state.last_duration = d;
        }
        if let Some(ref hash) = self.buffer_hash {
            state.buffer_hash = hash.clone();
        }
        if let Some(simulation) = self.simulation {
            state.simulation = simulation;
        }
    }
}

/// Requested pen height: a named preset or a 0..1 continuum value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeightTarget {
    Preset(String),
    Continuum(f64),
}

impl HeightTarget {
    pub fn preset(name: &str) -> Self {
        Self::Preset(name.to_string())
    }
}

/// Map a height request to (servo units, 0..1 state).
///
/// Named presets span the full servo range; continuum values map into
/// the sub-range between the `up` and `draw` preset percentages. An
/// unknown preset name falls back to `up` with a warning rather than
/// erroring across the process boundary.
pub fn state_to_height(target: &HeightTarget, servo: &ServoSettings) -> (u32, f64) {
    let up_pct = servo.preset_pct("up").unwrap_or(70.0);
    let draw_pct = servo.preset_pct("draw").unwrap_or(30.0);
    let pct = match target {
        HeightTarget::Preset(name) => match servo.preset_pct(name) {
            Some(pct) => pct,
            None => {
                tracing::warn!("Unknown height preset '{}', using 'up'", name);
                up_pct
            }
        },
        HeightTarget::Continuum(value) => {
            let value = value.clamp(0.0, 1.0);
            up_pct + (draw_pct - up_pct) * value
        }
    };
    let height = servo.min as f64 + servo.range() * (pct / 100.0);
    let span = draw_pct - up_pct;
    let state = if span.abs() < f64::EPSILON {
        0.0
    } else {
        ((pct - up_pct) / span).clamp(0.0, 1.0)
    };
    (height.round() as u32, state)
}

/// Events pushed to live-state observers.
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// Confirmed physical state changed.
    ActualChanged(PenState),
    /// Pending buffer length changed.
    BufferChanged { pending: usize },
    /// Runner reported whether its queue is actively draining.
    BufferRunning(bool),
    /// A message action reached the hardware queue head.
    Message(String),
    /// A named callback action reached the hardware queue head.
    Callback(String),
    SerialConnected { simulation: bool },
    SerialDisconnected,
    SerialError { kind: String, detail: String },
    SerialData(String),
    /// Runner could not be respawned; the session is over.
    Destroyed,
}

/// Owns the Target/Actual pair and the observer channel.
///
/// Single-writer discipline: Target is written by the controller's
/// enqueue path only, Actual by the runner-notification handler only.
pub struct PenBank {
    target: PenState,
    actual: PenState,
    events: broadcast::Sender<StateEvent>,
}

impl PenBank {
    pub fn new(config: &BotConfig, events: broadcast::Sender<StateEvent>) -> Self {
        let parked = PenState::parked(config);
        Self {
            target: parked.clone(),
            actual: parked,
            events,
        }
    }

    pub fn target(&self) -> &PenState {
        &self.target
    }

    pub fn actual(&self) -> &PenState {
        &self.actual
    }

    /// Merge a patch into Target. Does not notify observers; only
    /// confirmed physical state is broadcast live.
    pub fn set_target(&mut self, patch: PenPatch) {
        patch.apply_to(&mut self.target);
    }

    /// Emergency reconciliation path bypassing the normal enqueue flow.
    pub fn force_target(&mut self, state: PenState) {
        self.target = state;
    }

    /// Emergency reconciliation of Actual; notifies observers.
    pub fn force_actual(&mut self, state: PenState) {
        self.actual = state;
        self.notify_actual();
    }

    /// Runner-notification path: a buffer item reached the hardware, so
    /// its captured future state becomes the present state.
    pub fn promote_to_actual(&mut self, snapshot: PenState) {
        self.actual = snapshot;
        self.notify_actual();
    }

    /// Collapse Target into Actual; called when the buffer drains.
    pub fn reset_target_to_actual(&mut self) {
        self.target = self.actual.clone();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> broadcast::Sender<StateEvent> {
        self.events.clone()
    }

    fn notify_actual(&self) {
        // Send failures just mean nobody is listening right now.
        let _ = self
            .events
            .send(StateEvent::ActualChanged(self.actual.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;

    fn bank() -> PenBank {
        let (tx, _) = broadcast::channel(16);
        PenBank::new(&BotConfig::default(), tx)
    }

    #[test]
    fn test_parked_state_is_up() {
        let config = BotConfig::default();
        let parked = PenState::parked(&config);
        assert_eq!(parked.x, 0.0);
        assert_eq!(parked.y, 0.0);
        assert!(!parked.is_down());
        assert_eq!(parked.state, 0.0);
    }

    #[test]
    fn test_preset_height_mapping() {
        let servo = ServoSettings::default();
        // draw preset: 30% of 7500..24500 = 7500 + 0.3 * 17000 = 12600
        let (height, state) = state_to_height(&HeightTarget::preset("draw"), &servo);
        assert_eq!(height, 12600);
        assert!((state - 1.0).abs() < 1e-9);
        let (height, state) = state_to_height(&HeightTarget::preset("up"), &servo);
        assert_eq!(height, 19400);
        assert_eq!(state, 0.0);
    }

    #[test]
    fn test_continuum_maps_between_up_and_draw() {
        let servo = ServoSettings::default();
        let (h_up, _) = state_to_height(&HeightTarget::preset("up"), &servo);
        let (h_draw, _) = state_to_height(&HeightTarget::preset("draw"), &servo);
        let (h_mid, state) = state_to_height(&HeightTarget::Continuum(0.5), &servo);
        assert_eq!(h_mid, (h_up + h_draw) / 2);
        assert!((state - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_preset_falls_back_to_up() {
        let servo = ServoSettings::default();
        let (height, state) = state_to_height(&HeightTarget::preset("nonsense"), &servo);
        let (up, _) = state_to_height(&HeightTarget::preset("up"), &servo);
        assert_eq!(height, up);
        assert_eq!(state, 0.0);
    }

    #[test]
    fn test_target_mutation_does_not_broadcast() {
        let mut bank = bank();
        let mut rx = bank.subscribe();
        bank.set_target(PenPatch {
            x: Some(50.0),
            ..PenPatch::default()
        });
        assert_eq!(bank.target().x, 50.0);
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn test_actual_promotion_broadcasts() {
        let mut bank = bank();
        let mut rx = bank.subscribe();
        let mut snapshot = bank.actual().clone();
        snapshot.x = 123.0;
        snapshot.buffer_hash = "abc".to_string();
        bank.promote_to_actual(snapshot.clone());
        assert_eq!(bank.actual().x, 123.0);
        match rx.try_recv() {
            Ok(StateEvent::ActualChanged(state)) => assert_eq!(state, snapshot),
            other => panic!("expected ActualChanged, got {:?}", other),
        }
    }

    #[test]
    fn test_reset_target_to_actual() {
        let mut bank = bank();
        bank.set_target(PenPatch {
            x: Some(900.0),
            y: Some(900.0),
            ..PenPatch::default()
        });
        assert_ne!(bank.target().x, bank.actual().x);
        bank.reset_target_to_actual();
        assert_eq!(bank.target(), bank.actual());
    }
}
