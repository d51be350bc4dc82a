use chrono::{DateTime, FixedOffset};
use log::{debug, warn};

use crate::event::{EventMode, Schedule, WaterEvent, SCHEDULE_SLOTS};

/// Upper bound on interval triggers emitted for one slot in a single tick.
const MAX_CATCH_UP: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub slot: usize,
    pub duration_secs: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotTracker {
    /// Copy of the event the tracker was built for; a change resets the tracker.
    event: Option<WaterEvent>,
    /// Interval mode: epoch second at which the next trigger is due.
    next_due: Option<i64>,
    /// Day/time mode: epoch minute of the last trigger.
    last_fired_minute: Option<i64>,
}

/// Evaluates the schedule once per tick. Slots are visited in index order.
#[derive(Debug, Default)]
pub struct Scheduler {
    trackers: [SlotTracker; SCHEDULE_SLOTS],
}

impl Scheduler {
    pub fn tick(&mut self, schedule: &Schedule, now: DateTime<FixedOffset>) -> Vec<Trigger> {
        let epoch = now.timestamp();
        let mut triggers = Vec::new();

        for (slot, event) in schedule.slots().iter().enumerate() {
            let tracker = &mut self.trackers[slot];

            if !event.enabled {
                *tracker = SlotTracker::default();
                continue;
            }
            if tracker.event != Some(*event) {
                *tracker = SlotTracker {
                    event: Some(*event),
                    ..SlotTracker::default()
                };
            }

            match event.mode() {
                EventMode::Interval { every_secs } => {
                    let fired = Self::interval_due(tracker, every_secs, epoch);
                    for _ in 0..fired {
                        triggers.push(Trigger {
                            slot,
                            duration_secs: event.duration_seconds,
                        });
                    }
                }
                EventMode::DayTime { .. } => {
                    let minute = epoch.div_euclid(60);
                    if event.matches_wall_clock(&now) && tracker.last_fired_minute != Some(minute) {
                        tracker.last_fired_minute = Some(minute);
                        triggers.push(Trigger {
                            slot,
                            duration_secs: event.duration_seconds,
                        });
                    }
                }
            }
        }

        if !triggers.is_empty() {
            debug!("tick at {now}: {} trigger(s)", triggers.len());
        }
        triggers
    }

    /// Returns how many due instants elapsed since the last tick and advances `next_due`
    /// past `epoch`. Due instants are epoch multiples of `every_secs`.
    fn interval_due(tracker: &mut SlotTracker, every_secs: u32, epoch: i64) -> u32 {
        let every = i64::from(every_secs);
        let mut next_due = tracker
            .next_due
            .unwrap_or_else(|| next_multiple_at_or_after(epoch, every));

        let mut fired = 0;
        while next_due <= epoch && fired < MAX_CATCH_UP {
            fired += 1;
            next_due += every;
        }

        if next_due <= epoch {
            let skipped = (epoch - next_due) / every + 1;
            warn!("interval event skipped {skipped} overdue trigger(s) after a clock jump");
            next_due = next_multiple_at_or_after(epoch + 1, every);
        }

        tracker.next_due = Some(next_due);
        fired
    }

    pub fn next_due(&self, slot: usize) -> Option<i64> {
        self.trackers.get(slot).and_then(|tracker| tracker.next_due)
    }
}

fn next_multiple_at_or_after(epoch: i64, every: i64) -> i64 {
    let remainder = epoch.rem_euclid(every);
    if remainder == 0 {
        epoch
    } else {
        epoch + (every - remainder)
    }
}
