use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{IrrigationError, Result};

pub const SCHEDULE_SLOTS: usize = 5;

/// Bit `i` is weekday `i`, Sunday = 0.
pub const ALL_DAYS_MASK: u8 = 0b0111_1111;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WaterEvent {
    pub enabled: bool,
    pub hour: u8,
    pub minute: u8,
    #[serde(rename = "skipSeconds")]
    pub skip_seconds: u32,
    #[serde(rename = "daysMask")]
    pub days_mask: u8,
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// Fires every `skip_seconds`, aligned to the epoch.
    Interval { every_secs: u32 },
    /// Fires at `hour:minute` on the days in `days_mask` (0 = every day).
    DayTime { hour: u8, minute: u8, days_mask: u8 },
}

impl WaterEvent {
    /// Validates caller input and normalizes it into a stored, enabled event.
    pub fn new(
        hour: u8,
        minute: u8,
        skip_seconds: u32,
        days_mask: u8,
        duration_seconds: u32,
    ) -> Result<Self> {
        if hour > 23 {
            return Err(IrrigationError::validation(
                "hour",
                format!("{hour} is outside 0..=23"),
            ));
        }
        if minute > 59 {
            return Err(IrrigationError::validation(
                "minute",
                format!("{minute} is outside 0..=59"),
            ));
        }
        if days_mask > ALL_DAYS_MASK {
            return Err(IrrigationError::validation(
                "daysMask",
                format!("{days_mask} is outside 0..=127"),
            ));
        }
        if duration_seconds == 0 {
            return Err(IrrigationError::validation(
                "durationSeconds",
                "must be at least one second",
            ));
        }

        let mut event = Self {
            enabled: true,
            hour,
            minute,
            skip_seconds,
            days_mask,
            duration_seconds,
        };
        event.normalize();
        Ok(event)
    }

    /// Interval events ignore the day/time fields, and a full week is the "every day" sentinel.
    pub fn normalize(&mut self) {
        if self.skip_seconds > 0 {
            self.hour = 0;
            self.minute = 0;
            self.days_mask = 0;
        } else if self.days_mask == ALL_DAYS_MASK {
            self.days_mask = 0;
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.hour <= 23
            && self.minute <= 59
            && self.days_mask <= ALL_DAYS_MASK
            && self.duration_seconds > 0
    }

    pub fn mode(&self) -> EventMode {
        if self.skip_seconds > 0 {
            EventMode::Interval {
                every_secs: self.skip_seconds,
            }
        } else {
            EventMode::DayTime {
                hour: self.hour,
                minute: self.minute,
                days_mask: self.days_mask,
            }
        }
    }

    pub fn runs_on(&self, weekday_from_sunday: u32) -> bool {
        self.days_mask == 0 || self.days_mask & (1 << weekday_from_sunday) != 0
    }

    /// Exact hour/minute match on an allowed day. Interval events never match here.
    pub fn matches_wall_clock(&self, now: &DateTime<FixedOffset>) -> bool {
        match self.mode() {
            EventMode::Interval { .. } => false,
            EventMode::DayTime { hour, minute, .. } => {
                self.runs_on(now.weekday().num_days_from_sunday())
                    && now.hour() == u32::from(hour)
                    && now.minute() == u32::from(minute)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Schedule {
    slots: [WaterEvent; SCHEDULE_SLOTS],
}

impl Schedule {
    pub fn slots(&self) -> &[WaterEvent; SCHEDULE_SLOTS] {
        &self.slots
    }

    pub fn get(&self, index: usize) -> Option<&WaterEvent> {
        self.slots.get(index)
    }

    pub fn first_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| !slot.enabled)
    }

    pub fn enabled(&self) -> impl Iterator<Item = (usize, &WaterEvent)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, event)| event.enabled)
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled().count()
    }

    pub(crate) fn set(&mut self, index: usize, event: WaterEvent) {
        self.slots[index] = event;
    }
}
