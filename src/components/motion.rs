use super::feed_profile::FeedTable;
use crate::model::Axis;
use std::time::Duration;

/// Timing constants shared by the feed ladder and the shuttle loop.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Timing {
    // Seconds between issuing a jog cancel and the machine standing still.
    // Also the shuttle repeat period.
    pub latency: f64,
    // Seconds of extra travel added to cover delays in our own loop
    pub stopping_bonus: f64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            latency: 0.2,
            stopping_bonus: 0.1,
        }
    }
}

impl Timing {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.latency)
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Distance and time calculations for a feed table. Pure: the same table and
/// inputs always give the same answer.
pub struct MotionCalculator<'a> {
    table: &'a FeedTable,
    timing: Timing,
}

impl<'a> MotionCalculator<'a> {
    pub fn new(table: &'a FeedTable, timing: Timing) -> Self {
        Self { table, timing }
    }

    /// Distance (mm) and time (s) to change between two feeds given in mm/s.
    /// Always computed as an acceleration from the lower feed, so the
    /// result does not depend on argument order.
    pub fn accel_distance(&self, axis: Axis, f1: f64, f2: f64) -> (f64, f64) {
        let accel = self.table.acceleration(axis);
        if accel <= 0.0 {
            return (0.0, 0.0);
        }
        let lo = f1.min(f2);
        let hi = f1.max(f2);
        let time = (hi - lo) / accel;
        let distance = lo * time + 0.5 * accel * time * time;
        (distance, time)
    }

    /// Travel (mm, 3 decimals) to command for one shuttle period when moving
    /// from ladder index `current` to `target`.
    pub fn shuttle_distance(&self, axis: Axis, current: usize, target: usize) -> f64 {
        let ladder = self.table.ladder(axis);
        let f1 = ladder.get(current) / 60.0;
        let f2 = ladder.get(target) / 60.0;
        let bonus = self.timing.stopping_bonus;
        let mut distance = 0.0;
        let mut time = 0.0;

        // Starting a shuttle: the planner begins decelerating as soon as it
        // sees the end of the move, so ask for enough extra to stop from the
        // target feed, plus a little for our own loop delay.
        if current == 0 {
            let (d, _) = self.accel_distance(axis, f2, 0.0);
            distance += d + f2 * bonus;
        }

        if f1 != f2 {
            let (d, t) = self.accel_distance(axis, f1, f2);
            distance += d;
            time += t;
            if f1 < f2 {
                distance += (f2 - f1) * bonus;
            } else {
                distance -= (f1 - f2) * bonus;
            }
        }

        // Rest of the period at constant feed
        if self.timing.latency - time > 0.0 {
            distance += f2 * (self.timing.latency - time);
        }

        round3(distance)
    }
}
