use crate::model::Settings;
use log::debug;
use serde_json::Value;
use std::sync::{Arc, RwLock};

type Observer = Box<dyn Fn(&Settings) + Send + Sync>;

/// Cache of the firmware's `$` settings. Every report replaces the cache
/// wholesale and notifies the registered observers.
#[derive(Default)]
pub struct SettingsStore {
    current: RwLock<Arc<Settings>>,
    observers: RwLock<Vec<Observer>>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, settings: Settings) {
        let settings = Arc::new(settings);
        debug!("Settings updated ({} values)", settings.len());
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = settings.clone();

        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
        for observer in observers.iter() {
            observer(&settings);
        }
    }

    pub fn update_raw(&self, raw: &Value) {
        self.update(Settings::from_raw(raw));
    }

    /// Cached value, 0 when the firmware never reported it.
    pub fn get(&self, name: &str) -> f64 {
        self.snapshot().get(name)
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Called after every update with the new settings.
    pub fn on_updated(&self, observer: impl Fn(&Settings) + Send + Sync + 'static) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(observer));
    }
}
