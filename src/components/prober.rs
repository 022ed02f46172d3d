use crate::api::{probe_sequence, return_to_z, Grbl};
use crate::config::ProbeConfig;
use crate::model::{ActiveState, Axis};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

// Z travel used when the firmware has no $132
const DEFAULT_Z_TRAVEL: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Probing,
    Aborting,
}

struct ProbeSession {
    // Machine Z before probing, where the tool goes back to
    starting_z: f64,
    phase: Phase,
    // Wakes the probe out of its wait
    abort: Arc<Notify>,
    // Wakes a running halt when the connection goes away
    lost: Arc<Notify>,
}

/// Touch-plate Z probing. At most one session at a time; a second request
/// while one is in flight is ignored.
pub struct Prober {
    grbl: Arc<Grbl>,
    config: ProbeConfig,
    session: Mutex<Option<ProbeSession>>,
}

impl Prober {
    pub fn new(grbl: Arc<Grbl>, config: ProbeConfig) -> Self {
        Self {
            grbl,
            config,
            session: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ProbeSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_probing(&self) -> bool {
        self.lock().is_some()
    }

    /// Clears the session if it is still the one identified by `abort`.
    fn finish(&self, abort: &Arc<Notify>) {
        let mut session = self.lock();
        if session
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(&s.abort, abort))
        {
            *session = None;
        }
    }

    /// End of a probe that was not halted. A halt that raced the wait keeps
    /// the session until it is done.
    fn complete(&self, abort: &Arc<Notify>) {
        let mut session = self.lock();
        match session.as_ref() {
            Some(s) if Arc::ptr_eq(&s.abort, abort) && s.phase == Phase::Probing => {
                info!("Probe complete");
                *session = None;
            }
            _ => debug!("Probe wait finished during halt"),
        }
    }

    /// Runs the whole probe cycle and resolves once the machine is back at
    /// its starting Z with an empty planner, or once the probe is halted.
    pub async fn probe(&self) {
        if !self.grbl.is_connected() {
            debug!("Not connected, ignoring probe");
            return;
        }
        let Some(mpos) = self.grbl.state().current().mpos else {
            debug!("Position unknown, ignoring probe");
            return;
        };

        let settings = self.grbl.settings().snapshot();
        let mut travel = settings.max_travel(Axis::Z);
        if travel == 0.0 {
            travel = DEFAULT_Z_TRAVEL;
        }
        // Stay inside the machine, and off the limit switch when homing
        travel += mpos.z;
        if settings.homing_enabled() {
            travel -= settings.homing_pulloff();
        }
        if travel <= 0.0 {
            warn!("No Z travel left below {:.3}, ignoring probe", mpos.z);
            return;
        }

        let abort = {
            let mut session = self.lock();
            if session.is_some() {
                debug!("Probe already running");
                return;
            }
            let abort = Arc::new(Notify::new());
            *session = Some(ProbeSession {
                starting_z: mpos.z,
                phase: Phase::Probing,
                abort: abort.clone(),
                lost: Arc::new(Notify::new()),
            });
            abort
        };

        info!("Probing Z from {:.3}, travel {:.3}", mpos.z, travel);
        for line in probe_sequence(
            travel,
            self.config.feed_rate,
            self.config.fine_feed_rate,
            self.config.plate_thickness,
            mpos.z,
        ) {
            self.grbl.gcode(line);
        }

        tokio::select! {
            _ = self.grbl.wait(self.config.planner_blocks) => self.complete(&abort),
            // The halt path owns the session from here
            _ = abort.notified() => {
                debug!("Probe wait abandoned");
            }
        }
    }

    /// Stops a running probe: feed hold, reset, then back to the starting Z.
    /// Does nothing unless a probe is in flight.
    pub async fn halt(&self) {
        let (starting_z, abort, lost) = {
            let mut session = self.lock();
            match session.as_mut() {
                Some(s) if s.phase == Phase::Probing => {
                    s.phase = Phase::Aborting;
                    (s.starting_z, s.abort.clone(), s.lost.clone())
                }
                _ => return,
            }
        };
        warn!("Halting probe");
        abort.notify_one();

        let state = self.grbl.state();
        let halted = async {
            self.grbl.feedhold();
            state.wait_for_active_state(ActiveState::Hold).await;
            self.grbl.reset();
            state.wait_for_active_state(ActiveState::Idle).await;
            self.grbl.gcode(return_to_z(starting_z));
        };
        tokio::select! {
            _ = halted => info!("Probe halted, returning to Z {:.3}", starting_z),
            _ = lost.notified() => debug!("Halt abandoned"),
        }
        self.finish(&abort);
    }

    /// The in-flight session, if any, is over; nothing is sent.
    pub fn on_connection_lost(&self) {
        if let Some(session) = self.lock().take() {
            debug!("Probe aborted by connection loss");
            session.abort.notify_one();
            session.lost.notify_one();
        }
    }
}
