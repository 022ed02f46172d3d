use super::state::StateTracker;
use crate::config::ButtonConfig;
use crate::model::{ActiveState, Axis};
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ButtonRole {
    Axis(Axis),
    Probe,
    Step,
}

/// Receives the debounced actions. Taps are only delivered while the machine
/// is Idle; holds always are.
pub trait ButtonHandler: Send + Sync {
    fn on_tap(&self, role: ButtonRole);
    fn on_hold(&self, role: ButtonRole);
}

struct Press {
    generation: u64,
    held: bool,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Presses {
    generation: u64,
    by_id: HashMap<u8, Press>,
}

/// Splits raw button edges into taps and holds. A press that outlives the
/// hold time fires a hold and its release is swallowed; anything shorter is
/// a tap on release.
pub struct ButtonDebouncer {
    config: ButtonConfig,
    state: Arc<StateTracker>,
    handler: Arc<dyn ButtonHandler>,
    presses: Mutex<Presses>,
}

impl ButtonDebouncer {
    pub fn new(
        config: ButtonConfig,
        state: Arc<StateTracker>,
        handler: Arc<dyn ButtonHandler>,
    ) -> Self {
        Self {
            config,
            state,
            handler,
            presses: Mutex::new(Presses::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Presses> {
        self.presses.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn press(self: &Arc<Self>, id: u8) {
        let Some(role) = self.config.role(id) else {
            debug!("Unassigned button {}", id);
            return;
        };
        let mut presses = self.lock();
        if presses.by_id.contains_key(&id) {
            trace!("Button {} already down", id);
            return;
        }
        presses.generation += 1;
        let generation = presses.generation;

        let this = Arc::clone(self);
        let hold = self.config.hold();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            this.hold_elapsed(id, generation, role);
        });
        presses.by_id.insert(
            id,
            Press {
                generation,
                held: false,
                timer,
            },
        );
    }

    fn hold_elapsed(&self, id: u8, generation: u64, role: ButtonRole) {
        {
            let mut presses = self.lock();
            match presses.by_id.get_mut(&id) {
                Some(press) if press.generation == generation && !press.held => press.held = true,
                _ => return,
            }
        }
        debug!("Button {} held ({:?})", id, role);
        self.handler.on_hold(role);
    }

    pub fn release(&self, id: u8) {
        let Some(press) = self.lock().by_id.remove(&id) else {
            return;
        };
        press.timer.abort();
        if press.held {
            return;
        }
        let Some(role) = self.config.role(id) else {
            return;
        };
        let active = self.state.active_state();
        if active != ActiveState::Idle {
            debug!("Ignoring tap on button {} while {}", id, active);
            return;
        }
        debug!("Button {} tapped ({:?})", id, role);
        self.handler.on_tap(role);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::SettingsStore;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum Action {
        Tap(ButtonRole),
        Hold(ButtonRole),
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Action>>);

    impl Recorder {
        fn take(&self) -> Vec<Action> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl ButtonHandler for Recorder {
        fn on_tap(&self, role: ButtonRole) {
            self.0.lock().unwrap().push(Action::Tap(role));
        }

        fn on_hold(&self, role: ButtonRole) {
            self.0.lock().unwrap().push(Action::Hold(role));
        }
    }

    fn rig(active: &str) -> (Arc<ButtonDebouncer>, Arc<Recorder>, Arc<StateTracker>) {
        let state = Arc::new(StateTracker::new(Arc::new(SettingsStore::new())));
        state
            .on_status(&json!({ "status": { "activeState": active } }))
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let debouncer = Arc::new(ButtonDebouncer::new(
            ButtonConfig::default(),
            state.clone(),
            recorder.clone(),
        ));
        (debouncer, recorder, state)
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn short_press_is_a_tap() {
        let (buttons, recorder, _) = rig("Idle");
        buttons.press(1);
        advance(500).await;
        buttons.release(1);
        advance(1000).await;
        assert_eq!(recorder.take(), vec![Action::Tap(ButtonRole::Axis(Axis::X))]);
    }

    #[tokio::test(start_paused = true)]
    async fn long_press_is_a_hold_only() {
        let (buttons, recorder, _) = rig("Idle");
        buttons.press(4);
        advance(1100).await;
        assert_eq!(recorder.take(), vec![Action::Hold(ButtonRole::Probe)]);
        buttons.release(4);
        advance(10).await;
        assert!(recorder.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn taps_are_ignored_unless_idle() {
        let (buttons, recorder, state) = rig("Run");
        buttons.press(5);
        advance(200).await;
        buttons.release(5);
        assert!(recorder.take().is_empty());

        // Holds still go through
        buttons.press(3);
        advance(1001).await;
        buttons.release(3);
        assert_eq!(recorder.take(), vec![Action::Hold(ButtonRole::Axis(Axis::Z))]);

        state
            .on_status(&json!({ "status": { "activeState": "Idle" } }))
            .unwrap();
        buttons.press(5);
        buttons.release(5);
        assert_eq!(recorder.take(), vec![Action::Tap(ButtonRole::Step)]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_down_keeps_first_press() {
        let (buttons, recorder, _) = rig("Idle");
        buttons.press(2);
        advance(600).await;
        buttons.press(2);
        advance(500).await;
        assert_eq!(recorder.take(), vec![Action::Hold(ButtonRole::Axis(Axis::Y))]);
        buttons.release(2);
        assert!(recorder.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_buttons_are_ignored() {
        let (buttons, recorder, _) = rig("Idle");
        buttons.press(42);
        advance(2000).await;
        buttons.release(42);
        buttons.release(1);
        assert!(recorder.take().is_empty());
    }
}
