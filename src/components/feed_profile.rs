use crate::model::{Axis, Settings};
use log::debug;
use std::sync::{Arc, RwLock};

pub const LADDER_LEN: usize = 8;

// Feed (mm/min) and acceleration (mm/s^2) read from the machine are capped at these values
pub const HARD_MAX_FEED: [f64; 3] = [1000.0, 1000.0, 250.0];
pub const HARD_MAX_ACC: [f64; 3] = [75.0, 75.0, 75.0];

// The first three jog speeds are fixed at 1, 2 and 3 mm/s
const FIXED_FEEDS: [f64; 3] = [60.0, 120.0, 180.0];

/// Jog feed rates in mm/min for one axis. Index 0 is stationary, index 7 the
/// fastest usable feed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FeedLadder(pub [f64; LADDER_LEN]);

impl FeedLadder {
    /// Feed at `index`, clamped to the top of the ladder.
    pub fn get(&self, index: usize) -> f64 {
        self.0[index.min(LADDER_LEN - 1)]
    }

    pub fn top(&self) -> f64 {
        self.0[LADDER_LEN - 1]
    }
}

/// Ladders for all axes together with the acceleration each was built from.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeedTable {
    ladders: [FeedLadder; 3],
    acceleration: [f64; 3],
}

impl FeedTable {
    /// `latency` is the longest acceptable delay (s) between a jog cancel and
    /// the machine standing still; it bounds the top feed to what the axis
    /// can decelerate from in that time.
    pub fn compute(settings: &Settings, latency: f64) -> Self {
        let mut table = Self::default();
        for axis in Axis::ALL {
            let i = axis.index();
            let cap_feed = settings.max_feed(axis).min(HARD_MAX_FEED[i]);
            let cap_acc = settings.acceleration(axis).min(HARD_MAX_ACC[i]);
            let max_feed = (cap_acc * latency * 60.0).min(cap_feed);

            let mut ladder = [0.0; LADDER_LEN];
            for (rung, fixed) in FIXED_FEEDS.iter().enumerate() {
                ladder[rung + 1] = fixed.min(max_feed);
            }
            // Remaining four rungs climb linearly to the maximum
            let step = (max_feed - ladder[3]) / 4.0;
            for rung in 4..LADDER_LEN {
                ladder[rung] = ladder[rung - 1] + step;
            }

            table.ladders[i] = FeedLadder(ladder);
            table.acceleration[i] = cap_acc;
        }
        table
    }

    pub fn ladder(&self, axis: Axis) -> &FeedLadder {
        &self.ladders[axis.index()]
    }

    /// The acceleration the ladder for `axis` was computed with.
    pub fn acceleration(&self, axis: Axis) -> f64 {
        self.acceleration[axis.index()]
    }

    pub fn max_feed(&self, axis: Axis) -> f64 {
        self.ladder(axis).top()
    }
}

/// Current feed table, rebuilt in full on every settings update.
pub struct FeedProfile {
    latency: f64,
    table: RwLock<Arc<FeedTable>>,
}

impl FeedProfile {
    pub fn new(latency: f64) -> Self {
        Self {
            latency,
            table: RwLock::new(Arc::new(FeedTable::compute(&Settings::default(), latency))),
        }
    }

    pub fn recompute(&self, settings: &Settings) {
        let table = FeedTable::compute(settings, self.latency);
        debug!(
            "Feed rates X={:?} Y={:?} Z={:?}",
            table.ladder(Axis::X).0,
            table.ladder(Axis::Y).0,
            table.ladder(Axis::Z).0
        );
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
    }

    pub fn table(&self) -> Arc<FeedTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn latency(&self) -> f64 {
        self.latency
    }
}
