use crate::api::{zero_axis, Grbl, Transport};
use crate::components::*;
use crate::config::PendantConfig;
use crate::model::InboundEvent;
use log::{debug, info, trace, warn};
use std::sync::Arc;

/// What the pendant buttons do.
pub struct Controls {
    grbl: Arc<Grbl>,
    jogger: Arc<Jogger>,
    prober: Arc<Prober>,
}

impl ButtonHandler for Controls {
    fn on_tap(&self, role: ButtonRole) {
        match role {
            ButtonRole::Axis(axis) => {
                self.jogger.select_axis(axis);
            }
            ButtonRole::Step => {
                self.jogger.next_step();
            }
            ButtonRole::Probe => debug!("Probe button needs a hold"),
        }
    }

    fn on_hold(&self, role: ButtonRole) {
        match role {
            ButtonRole::Axis(axis) => {
                info!("Zeroing {}", axis);
                self.grbl.gcode(zero_axis(axis));
            }
            ButtonRole::Step => {
                self.jogger.reset_step();
            }
            ButtonRole::Probe => {
                let prober = self.prober.clone();
                // A second hold while probing stops it
                if prober.is_probing() {
                    tokio::spawn(async move { prober.halt().await });
                } else {
                    tokio::spawn(async move { prober.probe().await });
                }
            }
        }
    }
}

/// One pendant session: every component wired to the same machine.
pub struct Pendant {
    settings: Arc<SettingsStore>,
    feeds: Arc<FeedProfile>,
    state: Arc<StateTracker>,
    grbl: Arc<Grbl>,
    jogger: Arc<Jogger>,
    prober: Arc<Prober>,
    buttons: Arc<ButtonDebouncer>,
}

impl Pendant {
    pub fn new(config: PendantConfig) -> Self {
        let settings = Arc::new(SettingsStore::new());
        let feeds = Arc::new(FeedProfile::new(config.motion.latency));
        {
            let feeds = feeds.clone();
            settings.on_updated(move |s| feeds.recompute(s));
        }
        let state = Arc::new(StateTracker::new(settings.clone()));
        let grbl = Arc::new(Grbl::new(settings.clone(), state.clone()));
        let jogger = Arc::new(Jogger::new(
            grbl.clone(),
            feeds.clone(),
            config.motion,
            config.step_distances,
            config.reverse,
        ));
        let prober = Arc::new(Prober::new(grbl.clone(), config.probe));
        let controls = Arc::new(Controls {
            grbl: grbl.clone(),
            jogger: jogger.clone(),
            prober: prober.clone(),
        });
        let buttons = Arc::new(ButtonDebouncer::new(
            config.buttons,
            state.clone(),
            controls,
        ));

        Self {
            settings,
            feeds,
            state,
            grbl,
            jogger,
            prober,
            buttons,
        }
    }

    pub fn attach(&self, transport: Arc<dyn Transport>) {
        info!("Transport attached");
        self.grbl.attach(transport);
    }

    /// Releases the transport; anything issued afterwards is dropped.
    pub fn detach(&self) {
        info!("Transport detached");
        self.grbl.detach();
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn feeds(&self) -> &Arc<FeedProfile> {
        &self.feeds
    }

    pub fn state(&self) -> &Arc<StateTracker> {
        &self.state
    }

    pub fn grbl(&self) -> &Arc<Grbl> {
        &self.grbl
    }

    pub fn jogger(&self) -> &Arc<Jogger> {
        &self.jogger
    }

    pub fn prober(&self) -> &Arc<Prober> {
        &self.prober
    }

    /// Must be called inside a tokio runtime: shuttle and button events
    /// start timer tasks.
    pub fn on_event(&self, event: InboundEvent) {
        trace!("{:?}", event);
        match event {
            InboundEvent::Settings(raw) => self.settings.update_raw(&raw),
            InboundEvent::Status(raw) => {
                if let Err(e) = self.state.on_status(&raw) {
                    warn!("Bad status report: {}", e);
                }
            }
            InboundEvent::ConnectionClosed => {
                self.state.on_connection_closed();
                self.jogger.on_connection_lost();
                self.prober.on_connection_lost();
            }
            InboundEvent::CommandEcho(line) => self.state.on_command_echo(&line),
            InboundEvent::CommandAck(line) => self.grbl.on_ack(&line),
            InboundEvent::ButtonDown(id) => self.buttons.press(id),
            InboundEvent::ButtonUp(id) => self.buttons.release(id),
            InboundEvent::Shuttle(value) => self.jogger.set_shuttle(value),
            InboundEvent::Jog(direction) => self.jogger.jog(direction),
        }
    }
}
