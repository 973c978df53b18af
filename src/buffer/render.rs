// src/buffer/render.rs - Structured actions to bot command strings
//
// Templates come from the bot config and use `%`-placeholders:
// `%d` duration ms, `%x`/`%y` step deltas, `%z` servo position.
// A missing template renders to no commands (logged), never an error
// across the process boundary.
use crate::config::BotConfig;
use crate::motion::{Point, plan_segments};
use crate::pen::{HeightTarget, state_to_height};

/// Placeholder values for one command.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateVars {
    pub duration_ms: u64,
    pub x: i64,
    pub y: i64,
    pub z: u32,
}

pub fn substitute(template: &str, vars: &TemplateVars) -> String {
    template
        .replace("%d", &vars.duration_ms.to_string())
        .replace("%x", &vars.x.to_string())
        .replace("%y", &vars.y.to_string())
        .replace("%z", &vars.z.to_string())
}

fn template_or_empty<'a>(config: &'a BotConfig, name: &str) -> Option<&'a str> {
    match config.template(name) {
        Some(tpl) => Some(tpl),
        None => {
            tracing::warn!("No '{}' command template for bot '{}'", name, config.name);
            None
        }
    }
}

/// Render a buffered move through the acceleration planner: one command
/// per micro-segment, total duration = sum of segment durations.
pub fn render_move(
    config: &BotConfig,
    from: Point,
    to: Point,
    pen_down: bool,
) -> (Vec<String>, u64) {
    let segments = plan_segments(from, to, pen_down, &config.speed, &config.axis);
    if segments.is_empty() {
        return (Vec::new(), 0);
    }
    let total: u64 = segments.iter().map(|s| s.duration_ms).sum();
    let Some(template) = template_or_empty(config, "move") else {
        return (Vec::new(), total);
    };
    let commands = segments
        .iter()
        .map(|seg| {
            substitute(
                template,
                &TemplateVars {
                    duration_ms: seg.duration_ms,
                    x: seg.dx,
                    y: seg.dy,
                    z: 0,
                },
            )
        })
        .collect();
    (commands, total)
}

/// Render a skip-buffer move as a single constant-rate command, used for
/// manual repositioning and pause replay.
pub fn render_direct_move(config: &BotConfig, from: Point, to: Point) -> (Vec<String>, u64) {
    let distance = from.distance_to(&to);
    if distance <= 0.0 {
        return (Vec::new(), 0);
    }
    let duration = (distance / config.speed.active_steps_per_ms(false)).ceil() as u64;
    let duration = duration.max(1);
    let Some(template) = template_or_empty(config, "move") else {
        return (Vec::new(), duration);
    };
    let mut dx = (to.x - from.x).round() as i64;
    let mut dy = (to.y - from.y).round() as i64;
    if config.axis.invert_x {
        dx = -dx;
    }
    if config.axis.invert_y {
        dy = -dy;
    }
    if config.axis.swap_motors {
        std::mem::swap(&mut dx, &mut dy);
    }
    let command = substitute(
        template,
        &TemplateVars {
            duration_ms: duration,
            x: dx,
            y: dy,
            z: 0,
        },
    );
    (vec![command], duration)
}

/// Render a height change. Physical duration scales with how far the
/// servo travels across its range.
pub fn render_height(config: &BotConfig, from_height: u32, to_height: u32) -> (Vec<String>, u64) {
    let travel = (from_height as i64 - to_height as i64).unsigned_abs() as f64;
    let range = config.servo.range().max(1.0);
    let duration = ((travel / range) * config.servo.duration_ms as f64).ceil() as u64;
    let duration = duration.max(1);
    let Some(template) = template_or_empty(config, "height") else {
        return (Vec::new(), duration);
    };
    let command = substitute(
        template,
        &TemplateVars {
            duration_ms: duration,
            x: 0,
            y: 0,
            z: to_height,
        },
    );
    (vec![command], duration)
}

/// Render a height change to a named preset or continuum value against
/// the current height; returns the commands, duration and the resolved
/// (servo, state) pair.
pub fn render_height_target(
    config: &BotConfig,
    from_height: u32,
    target: &HeightTarget,
) -> (Vec<String>, u64, u32, f64) {
    let (servo_pos, state) = state_to_height(target, &config.servo);
    let (commands, duration) = render_height(config, from_height, servo_pos);
    (commands, duration, servo_pos, state)
}
