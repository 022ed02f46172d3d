use super::settings::SettingsStore;
use crate::api::is_homing_command;
use crate::model::{ActiveState, MachineState, ModelError, Position};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};

const EVENT_CAPACITY: usize = 256;

/// Change notifications, one per logical field plus the derived ones.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    ActiveStateChanged(ActiveState),
    MposChanged(Option<Position>),
    WposChanged(Option<Position>),
    // Active state, positions, or anything else in the status sub-report
    StatusChanged(Arc<MachineState>),
    ParserStateChanged(Value),
    // Sent last, whenever any of the above was
    Changed(Arc<MachineState>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Homing {
    #[default]
    Idle,
    // $H was sent; the firmware may still report stale Idle/Alarm
    Requested,
    // The firmware has reported Home
    Running,
}

struct Tracker {
    needs_reset: bool,
    needs_homing: bool,
    homing: Homing,
    // Last snapshot that changed something
    baseline: Arc<MachineState>,
}

impl Tracker {
    fn synthesize(&mut self, raw: ActiveState, homing_enabled: bool) -> ActiveState {
        if raw == ActiveState::Empty {
            self.needs_reset = true;
            self.needs_homing = false;
            self.homing = Homing::Idle;
            return ActiveState::Empty;
        }

        if self.needs_reset {
            self.needs_reset = false;
            if homing_enabled && raw == ActiveState::Alarm {
                info!("Homing required");
                self.needs_homing = true;
            }
        }

        match (self.homing, raw) {
            (Homing::Requested, ActiveState::Idle | ActiveState::Alarm) => {
                return ActiveState::HomingInProgress
            }
            (Homing::Requested | Homing::Running, ActiveState::Home) => {
                self.homing = Homing::Running;
                return ActiveState::HomingInProgress;
            }
            (Homing::Running, ActiveState::Idle) => {
                info!("Homing complete");
                self.homing = Homing::Idle;
                self.needs_homing = false;
            }
            (Homing::Requested | Homing::Running, other) => {
                warn!("Homing interrupted by {:?}", other);
                self.homing = Homing::Idle;
            }
            (Homing::Idle, _) => {}
        }

        if self.needs_homing {
            if raw == ActiveState::Idle {
                self.needs_homing = false;
            } else {
                return ActiveState::HomingRequired;
            }
        }

        raw
    }

    fn diff(&mut self, new: &Arc<MachineState>) -> Vec<StateEvent> {
        let old = &self.baseline;
        let mut events = Vec::new();
        let mut status_changed = false;

        if old.active_state != new.active_state {
            events.push(StateEvent::ActiveStateChanged(new.active_state));
            status_changed = true;
        }
        if old.mpos != new.mpos {
            events.push(StateEvent::MposChanged(new.mpos));
            status_changed = true;
        }
        if old.wpos != new.wpos {
            events.push(StateEvent::WposChanged(new.wpos));
            status_changed = true;
        }
        if status_changed || old.status != new.status {
            events.push(StateEvent::StatusChanged(new.clone()));
            status_changed = true;
        }
        let parser_changed = old.parser_state != new.parser_state;
        if parser_changed {
            events.push(StateEvent::ParserStateChanged(new.parser_state.clone()));
        }

        // Identical snapshots never move the baseline
        if status_changed || parser_changed {
            events.push(StateEvent::Changed(new.clone()));
            self.baseline = new.clone();
        }
        events
    }
}

/// Turns the raw status stream into a clean machine state, hiding the
/// firmware's flicker around reset and homing.
pub struct StateTracker {
    settings: Arc<SettingsStore>,
    inner: Mutex<Tracker>,
    current: RwLock<Arc<MachineState>>,
    events: broadcast::Sender<StateEvent>,
}

impl StateTracker {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            inner: Mutex::new(Tracker {
                needs_reset: true,
                needs_homing: false,
                homing: Homing::Idle,
                baseline: Arc::new(MachineState::default()),
            }),
            current: RwLock::new(Arc::new(MachineState::default())),
            events,
        }
    }

    pub fn on_status(&self, raw: &Value) -> Result<(), ModelError> {
        let state = MachineState::from_raw(raw)?;
        self.apply(state);
        Ok(())
    }

    /// Applies a snapshot whose active state is still the raw firmware value.
    pub fn apply(&self, mut state: MachineState) {
        let homing_enabled = self.settings.snapshot().homing_enabled();
        let mut tracker = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.active_state = tracker.synthesize(state.active_state, homing_enabled);
        self.publish(&mut tracker, Arc::new(state));
    }

    /// Watches lines written to the firmware for the start of a homing cycle.
    pub fn on_command_echo(&self, line: &str) {
        if is_homing_command(line) {
            info!("Homing started");
            let mut tracker = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            tracker.homing = Homing::Requested;
        }
    }

    /// Back to the just-connected baseline.
    pub fn on_connection_closed(&self) {
        info!("Connection closed, waiting for reset");
        let mut tracker = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        tracker.needs_reset = true;
        tracker.needs_homing = false;
        tracker.homing = Homing::Idle;
        self.publish(&mut tracker, Arc::new(MachineState::default()));
    }

    fn publish(&self, tracker: &mut Tracker, state: Arc<MachineState>) {
        let events = tracker.diff(&state);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = state;
        for event in events {
            if let StateEvent::ActiveStateChanged(active) = &event {
                debug!("Active state -> {:?}", active);
            }
            // No receivers is fine
            let _ = self.events.send(event);
        }
    }

    pub fn current(&self) -> Arc<MachineState> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn active_state(&self) -> ActiveState {
        self.current().active_state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Resolves once a snapshot satisfying `predicate` has been applied
    /// (immediately if the current one does). No timeout.
    pub async fn wait_for<F>(&self, predicate: F)
    where
        F: Fn(&MachineState) -> bool,
    {
        let mut rx = self.subscribe();
        if predicate(&self.current()) {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(StateEvent::Changed(state)) if predicate(&state) => return,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if predicate(&self.current()) {
                        return;
                    }
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    pub async fn wait_for_active_state(&self, target: ActiveState) {
        debug!("Waiting for {:?}", target);
        self.wait_for(|state| state.active_state == target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Settings;
    use serde_json::json;
    use std::time::Duration;

    fn tracker(homing_enabled: bool) -> StateTracker {
        let settings = Arc::new(SettingsStore::new());
        let value = if homing_enabled { 1.0 } else { 0.0 };
        settings.update([("$22", value)].into_iter().collect::<Settings>());
        StateTracker::new(settings)
    }

    fn snapshot(active: &str) -> Value {
        json!({
            "status": {
                "activeState": active,
                "mpos": { "x": "0.000", "y": "0.000", "z": "0.000" },
                "wpos": { "x": "0.000", "y": "0.000", "z": "0.000" }
            },
            "parserstate": {}
        })
    }

    fn drain(rx: &mut broadcast::Receiver<StateEvent>) -> Vec<StateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn presented(events: &[StateEvent]) -> Vec<ActiveState> {
        events
            .iter()
            .filter_map(|e| match e {
                StateEvent::ActiveStateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn alarm_after_reset_requires_homing() {
        let tracker = tracker(true);
        let mut rx = tracker.subscribe();
        tracker.on_status(&snapshot("")).unwrap();
        tracker.on_status(&snapshot("Alarm")).unwrap();
        assert_eq!(tracker.active_state(), ActiveState::HomingRequired);

        let states = presented(&drain(&mut rx));
        assert!(!states.contains(&ActiveState::Alarm));
        assert_eq!(states.last(), Some(&ActiveState::HomingRequired));

        // Still Alarm: still homing required
        tracker.on_status(&snapshot("Alarm")).unwrap();
        assert_eq!(tracker.active_state(), ActiveState::HomingRequired);
        // Unlocked without homing
        tracker.on_status(&snapshot("Idle")).unwrap();
        assert_eq!(tracker.active_state(), ActiveState::Idle);
    }

    #[test]
    fn alarm_is_raw_when_homing_disabled() {
        let tracker = tracker(false);
        tracker.on_status(&snapshot("")).unwrap();
        tracker.on_status(&snapshot("Alarm")).unwrap();
        assert_eq!(tracker.active_state(), ActiveState::Alarm);
    }

    #[test]
    fn only_first_state_after_reset_is_checked() {
        let tracker = tracker(true);
        tracker.on_status(&snapshot("")).unwrap();
        tracker.on_status(&snapshot("Idle")).unwrap();
        tracker.on_status(&snapshot("Alarm")).unwrap();
        assert_eq!(tracker.active_state(), ActiveState::Alarm);
    }

    #[test]
    fn homing_masks_idle_flicker() {
        let tracker = tracker(true);
        tracker.on_status(&snapshot("Idle")).unwrap();
        tracker.on_command_echo("$H");

        let mut seen = Vec::new();
        for raw in ["Idle", "Home", "Idle"] {
            tracker.on_status(&snapshot(raw)).unwrap();
            seen.push(tracker.active_state());
        }
        assert_eq!(
            seen,
            vec![
                ActiveState::HomingInProgress,
                ActiveState::HomingInProgress,
                ActiveState::Idle
            ]
        );
    }

    #[test]
    fn homing_from_required_clears_requirement() {
        let tracker = tracker(true);
        tracker.on_status(&snapshot("")).unwrap();
        tracker.on_status(&snapshot("Alarm")).unwrap();
        tracker.on_command_echo("$H");
        tracker.on_status(&snapshot("Alarm")).unwrap();
        assert_eq!(tracker.active_state(), ActiveState::HomingInProgress);
        tracker.on_status(&snapshot("Home")).unwrap();
        tracker.on_status(&snapshot("Idle")).unwrap();
        assert_eq!(tracker.active_state(), ActiveState::Idle);
        tracker.on_status(&snapshot("Run")).unwrap();
        assert_eq!(tracker.active_state(), ActiveState::Run);
    }

    #[test]
    fn unexpected_state_clears_homing_mask() {
        let tracker = tracker(true);
        tracker.on_status(&snapshot("Idle")).unwrap();
        tracker.on_command_echo("$H");
        tracker.on_status(&snapshot("Door:1")).unwrap();
        assert_eq!(tracker.active_state(), ActiveState::Door);
        tracker.on_status(&snapshot("Idle")).unwrap();
        assert_eq!(tracker.active_state(), ActiveState::Idle);
    }

    #[test]
    fn failed_homing_falls_back_to_required() {
        let tracker = tracker(true);
        tracker.on_status(&snapshot("")).unwrap();
        tracker.on_status(&snapshot("Alarm")).unwrap();
        tracker.on_command_echo("$H");
        tracker.on_status(&snapshot("Home")).unwrap();
        tracker.on_status(&snapshot("Alarm")).unwrap();
        assert_eq!(tracker.active_state(), ActiveState::HomingRequired);
    }

    #[test]
    fn per_field_notifications() {
        let tracker = tracker(false);
        tracker.on_status(&snapshot("Idle")).unwrap();
        let mut rx = tracker.subscribe();

        // Duplicate: nothing
        tracker.on_status(&snapshot("Idle")).unwrap();
        assert!(drain(&mut rx).is_empty());

        // Position only
        let mut moved = snapshot("Idle");
        moved["status"]["mpos"]["x"] = json!("1.000");
        tracker.on_status(&moved).unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            StateEvent::MposChanged(Some(Position::new(1.0, 0.0, 0.0)))
        );
        assert!(matches!(events[1], StateEvent::StatusChanged(_)));
        assert!(matches!(events[2], StateEvent::Changed(_)));

        // Parser state only: no status notification
        let mut modal = moved.clone();
        modal["parserstate"] = json!({ "modal": { "distance": "G91" } });
        tracker.on_status(&modal).unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StateEvent::ParserStateChanged(_)));
        assert!(matches!(events[1], StateEvent::Changed(_)));

        // Other status fields still count as a status change
        let mut feed = modal.clone();
        feed["status"]["feedrate"] = json!(500);
        tracker.on_status(&feed).unwrap();
        let events = drain(&mut rx);
        assert!(matches!(events[0], StateEvent::StatusChanged(_)));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn connection_loss_resynchronizes() {
        let tracker = tracker(true);
        tracker.on_status(&snapshot("")).unwrap();
        tracker.on_status(&snapshot("Idle")).unwrap();
        tracker.on_connection_closed();
        assert_eq!(tracker.active_state(), ActiveState::Empty);
        assert_eq!(tracker.current().mpos, None);
        tracker.on_status(&snapshot("Alarm")).unwrap();
        assert_eq!(tracker.active_state(), ActiveState::HomingRequired);
    }

    #[test]
    fn malformed_snapshot_is_rejected() {
        let tracker = tracker(false);
        assert!(tracker.on_status(&json!("Idle")).is_err());
        assert!(tracker
            .on_status(&json!({ "status": { "activeState": "Bogus" } }))
            .is_err());
        assert_eq!(tracker.active_state(), ActiveState::Empty);
    }

    #[tokio::test]
    async fn wait_for_active_state_sees_transient_states() {
        let tracker = Arc::new(tracker(false));
        tracker.on_status(&snapshot("Idle")).unwrap();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_active_state(ActiveState::Run).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Run is replaced before the waiter gets to look at the current state
        tracker.on_status(&snapshot("Run")).unwrap();
        tracker.on_status(&snapshot("Idle")).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_resolves_immediately_when_already_there() {
        let tracker = tracker(false);
        tracker.on_status(&snapshot("Idle")).unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            tracker.wait_for_active_state(ActiveState::Idle),
        )
        .await
        .expect("already idle");
    }
}
