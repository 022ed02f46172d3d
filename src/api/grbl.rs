use super::g_code::{self, parse_ack, Ack};
use super::transport::Transport;
use crate::components::{SettingsStore, StateTracker};
use crate::model::{ActiveState, Axis, Outbound};
use log::{debug, warn};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};

const ACK_CAPACITY: usize = 256;

/// Facade over the firmware connection: outbound commands plus the waits
/// that depend on what comes back.
pub struct Grbl {
    settings: Arc<SettingsStore>,
    state: Arc<StateTracker>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    acks: broadcast::Sender<Ack>,
}

impl Grbl {
    pub fn new(settings: Arc<SettingsStore>, state: Arc<StateTracker>) -> Self {
        let (acks, _) = broadcast::channel(ACK_CAPACITY);
        Self {
            settings,
            state,
            transport: RwLock::new(None),
            acks,
        }
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn state(&self) -> &Arc<StateTracker> {
        &self.state
    }

    pub fn attach(&self, transport: Arc<dyn Transport>) {
        *self.transport.write().unwrap_or_else(|e| e.into_inner()) = Some(transport);
    }

    pub fn detach(&self) {
        self.transport
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn send(&self, command: Outbound) {
        let transport = self
            .transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match transport {
            Some(transport) => transport.send(command),
            None => debug!("Not connected, dropping {:?}", command),
        }
    }

    pub fn gcode(&self, code: impl Into<String>) {
        self.send(Outbound::Gcode { code: code.into() });
    }

    /// Relative jog; a distance of exactly 0 cancels jogging instead.
    pub fn jog(&self, axis: Axis, distance: f64, feed: f64) {
        debug!("jog {} {} F{}", axis, distance, feed);
        if distance == 0.0 {
            self.jog_cancel();
        } else {
            self.send(Outbound::Jog {
                axis,
                distance,
                feed,
            });
        }
    }

    pub fn jog_cancel(&self) {
        debug!("jog cancel");
        self.send(Outbound::JogCancel);
    }

    pub fn feedhold(&self) {
        self.send(Outbound::Feedhold);
    }

    pub fn reset(&self) {
        self.send(Outbound::Reset);
    }

    /// Response line from the firmware. Errors and alarms are logged as-is.
    pub fn on_ack(&self, line: &str) {
        let ack = match parse_ack(line) {
            Ok(ack) => ack,
            Err(e) => {
                debug!("Ignoring response {:?}: {}", line, e);
                return;
            }
        };
        match &ack {
            Ack::Error(code) => warn!("Firmware rejected command: error:{}", code),
            Ack::Alarm(code) => warn!("Firmware alarm: ALARM:{}", code),
            _ => {}
        }
        let _ = self.acks.send(ack);
    }

    async fn next_ok(acks: &mut broadcast::Receiver<Ack>) {
        loop {
            match acks.recv().await {
                Ok(Ack::Ok) => return,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
        }
    }

    /// Sends a synchronizing dwell and resolves on the next `ok`.
    pub async fn sync(&self) {
        let mut acks = self.acks.subscribe();
        self.gcode(g_code::SYNC);
        Self::next_ok(&mut acks).await;
    }

    /// Waits for queued motion to start and finish: Run, then Idle, then at
    /// least `planner_blocks` free planner blocks, then a synchronizing
    /// round trip. Unbounded; firmware liveness is assumed.
    pub async fn wait(&self, planner_blocks: u32) {
        self.state.wait_for_active_state(ActiveState::Run).await;
        self.state.wait_for_active_state(ActiveState::Idle).await;
        self.state
            .wait_for(|s| s.planner_free.map_or(true, |free| free >= planner_blocks))
            .await;
        self.sync().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CommandLog;
    use serde_json::json;
    use std::time::Duration;

    fn grbl() -> (Arc<Grbl>, Arc<CommandLog>) {
        let settings = Arc::new(SettingsStore::new());
        let state = Arc::new(StateTracker::new(settings.clone()));
        let grbl = Arc::new(Grbl::new(settings, state));
        let log = CommandLog::new();
        grbl.attach(log.clone());
        (grbl, log)
    }

    fn status(active: &str, planner: u32) -> serde_json::Value {
        json!({ "status": { "activeState": active, "buf": { "planner": planner } } })
    }

    #[test]
    fn zero_distance_jog_cancels() {
        let (grbl, log) = grbl();
        grbl.jog(Axis::X, 0.0, 900.0);
        grbl.jog(Axis::Y, -1.5, 900.0);
        assert_eq!(
            log.commands(),
            vec![
                Outbound::JogCancel,
                Outbound::Jog {
                    axis: Axis::Y,
                    distance: -1.5,
                    feed: 900.0
                }
            ]
        );
    }

    #[test]
    fn commands_are_dropped_without_transport() {
        let (grbl, log) = grbl();
        grbl.detach();
        assert!(!grbl.is_connected());
        grbl.gcode("G90");
        grbl.feedhold();
        assert!(log.commands().is_empty());
    }

    #[tokio::test]
    async fn wait_follows_run_idle_planner_and_ok() {
        let (grbl, log) = grbl();
        grbl.state().on_status(&status("Idle", 15)).unwrap();

        let waiter = {
            let grbl = grbl.clone();
            tokio::spawn(async move { grbl.wait(15).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        grbl.state().on_status(&status("Run", 10)).unwrap();
        grbl.state().on_status(&status("Idle", 12)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Planner not drained yet: no sync sent
        assert!(log.gcode().is_empty());

        grbl.state().on_status(&status("Idle", 15)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(log.gcode(), vec![g_code::SYNC.to_string()]);
        assert!(!waiter.is_finished());

        grbl.on_ack("error:20");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        grbl.on_ack("ok");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should finish on ok")
            .unwrap();
    }
}
