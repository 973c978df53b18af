// src/lib.rs - plotbot: pen-plotter motion host
//
// Controller and runner halves of a dual-process plotting engine:
// drawing intents go in, precisely timed serial command strings come
// out. See the binaries for process entry points.
pub mod buffer;
pub mod config;
pub mod ipc;
pub mod motion;
pub mod pen;
pub mod runner;
pub mod service;

pub use buffer::{Action, Buffer, BufferState};
pub use config::{BotConfig, ConfigError, load_config};
pub use ipc::{BufferItemPayload, ChannelTransport, IpcMessage, StdioTransport, Transport};
pub use motion::{MotionSegment, Point, plan_segments};
pub use pen::{HeightTarget, PenBank, PenPatch, PenState, StateEvent};
pub use runner::Runner;
pub use service::PlotterService;
