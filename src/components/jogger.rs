use super::feed_profile::FeedProfile;
use super::motion::{MotionCalculator, Timing};
use crate::api::Grbl;
use crate::config::ReverseAxes;
use crate::model::{ActiveState, Axis};
use log::{debug, info};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Largest shuttle magnitude; also the top index of the feed ladder.
pub const SHUTTLE_MAX: i8 = 7;

const EVENT_CAPACITY: usize = 16;

/// What a display needs to redraw the jog line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JogEvent {
    AxisChanged(Axis),
    StepChanged(f64),
}

struct JogState {
    axis: Axis,
    step_index: usize,
    current_shuttle: i8,
    last_shuttle: i8,
    // Running shuttle loop, at most one
    repeat: Option<JoinHandle<()>>,
}

pub struct Jogger {
    grbl: Arc<Grbl>,
    feeds: Arc<FeedProfile>,
    timing: Timing,
    steps: Vec<f64>,
    reverse: ReverseAxes,
    inner: Mutex<JogState>,
    events: broadcast::Sender<JogEvent>,
}

impl Jogger {
    /// `steps` must not be empty; the config loader rejects an empty list.
    pub fn new(
        grbl: Arc<Grbl>,
        feeds: Arc<FeedProfile>,
        timing: Timing,
        steps: Vec<f64>,
        reverse: ReverseAxes,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            grbl,
            feeds,
            timing,
            steps,
            reverse,
            inner: Mutex::new(JogState {
                axis: Axis::X,
                step_index: 0,
                current_shuttle: 0,
                last_shuttle: 0,
                repeat: None,
            }),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JogState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JogEvent> {
        self.events.subscribe()
    }

    pub fn axis(&self) -> Axis {
        self.lock().axis
    }

    pub fn step(&self) -> f64 {
        self.steps.get(self.lock().step_index).copied().unwrap_or(0.0)
    }

    pub fn is_shuttling(&self) -> bool {
        self.lock().repeat.is_some()
    }

    /// Changes the jog axis. Only allowed while the machine is Idle.
    pub fn select_axis(&self, axis: Axis) -> bool {
        let active = self.grbl.state().active_state();
        if active != ActiveState::Idle {
            debug!("Ignoring axis change to {} while {}", axis, active);
            return false;
        }
        let mut inner = self.lock();
        if inner.axis != axis {
            inner.axis = axis;
            info!("Jog axis {}", axis);
            let _ = self.events.send(JogEvent::AxisChanged(axis));
        }
        true
    }

    /// Advances to the next step distance, wrapping to the first.
    pub fn next_step(&self) -> f64 {
        let mut inner = self.lock();
        inner.step_index = (inner.step_index + 1) % self.steps.len().max(1);
        self.publish_step(&inner)
    }

    pub fn reset_step(&self) -> f64 {
        let mut inner = self.lock();
        inner.step_index = 0;
        self.publish_step(&inner)
    }

    fn publish_step(&self, inner: &JogState) -> f64 {
        let step = self.steps.get(inner.step_index).copied().unwrap_or(0.0);
        debug!("Jog step {}", step);
        let _ = self.events.send(JogEvent::StepChanged(step));
        step
    }

    /// One step jog on the current axis at the top feed of its ladder.
    pub fn jog(&self, direction: i8) {
        if direction == 0 {
            return;
        }
        let inner = self.lock();
        let axis = inner.axis;
        let step = self.steps.get(inner.step_index).copied().unwrap_or(0.0);
        let sign = f64::from(direction.signum()) * self.reverse.direction(axis);
        let feed = self.feeds.table().max_feed(axis);
        if feed <= 0.0 {
            debug!("No feed for {} yet, ignoring jog", axis);
            return;
        }
        self.grbl.jog(axis, step * sign, feed);
    }

    /// New shuttle position in -7..=7. Starts the repeat loop when it is not
    /// already running; a running loop picks the value up on its next tick.
    pub fn set_shuttle(self: &Arc<Self>, value: i8) {
        let value = value.clamp(-SHUTTLE_MAX, SHUTTLE_MAX);
        let mut inner = self.lock();
        if inner.current_shuttle == value {
            return;
        }
        debug!("Shuttle {}", value);
        inner.current_shuttle = value;

        if inner.repeat.is_some() {
            return;
        }
        if self.tick(&mut inner) {
            let this = Arc::clone(self);
            inner.repeat = Some(tokio::spawn(async move { this.shuttle_loop().await }));
        }
    }

    async fn shuttle_loop(self: Arc<Self>) {
        let interval = self.timing.interval();
        loop {
            tokio::time::sleep(interval).await;
            let mut inner = self.lock();
            if !self.tick(&mut inner) {
                inner.repeat = None;
                return;
            }
        }
    }

    /// Issues the move for one shuttle period, or a cancel once the shuttle
    /// is back at rest. Returns whether the loop should keep going.
    fn tick(&self, inner: &mut JogState) -> bool {
        let current = inner.current_shuttle;
        if current == 0 {
            inner.last_shuttle = 0;
            self.grbl.jog_cancel();
            return false;
        }

        let axis = inner.axis;
        let table = self.feeds.table();
        let calc = MotionCalculator::new(&table, self.timing);
        let target = usize::from(current.unsigned_abs());
        let distance =
            calc.shuttle_distance(axis, usize::from(inner.last_shuttle.unsigned_abs()), target);
        let sign = f64::from(current.signum()) * self.reverse.direction(axis);

        self.grbl.jog(axis, distance * sign, table.ladder(axis).get(target));
        inner.last_shuttle = current;
        true
    }

    /// Drops any shuttle session without sending anything.
    pub fn on_connection_lost(&self) {
        let mut inner = self.lock();
        if let Some(repeat) = inner.repeat.take() {
            debug!("Shuttle aborted");
            repeat.abort();
        }
        inner.current_shuttle = 0;
        inner.last_shuttle = 0;
    }
}
