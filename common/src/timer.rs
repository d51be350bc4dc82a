use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TimerId {
    Tick,
    ValveOff,
    ConnectTimeout,
    Reconnect,
    Restart,
}

impl TimerId {
    pub const ALL: [TimerId; 5] = [
        TimerId::Tick,
        TimerId::ValveOff,
        TimerId::ConnectTimeout,
        TimerId::Reconnect,
        TimerId::Restart,
    ];

    fn index(self) -> usize {
        match self {
            Self::Tick => 0,
            Self::ValveOff => 1,
            Self::ConnectTimeout => 2,
            Self::Reconnect => 3,
            Self::Restart => 4,
        }
    }
}

/// Identifies one arming of a timer. An expiry carrying a stale generation is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub id: TimerId,
    pub generation: u32,
}

/// Countdown backend. Expiries are delivered back to `Device::on_timer` on the dispatch context.
pub trait TimerService: Send {
    fn start_once(&mut self, token: TimerToken, after: Duration) -> anyhow::Result<()>;
    fn start_periodic(&mut self, token: TimerToken, period: Duration) -> anyhow::Result<()>;
    fn stop(&mut self, id: TimerId);
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    generation: u32,
    armed: bool,
    periodic: bool,
}

/// Generation bookkeeping for every timer the core owns.
#[derive(Debug, Default)]
pub struct Timers {
    slots: [Slot; TimerId::ALL.len()],
}

impl Timers {
    pub fn arm(&mut self, id: TimerId, periodic: bool) -> TimerToken {
        let slot = &mut self.slots[id.index()];
        slot.generation = slot.generation.wrapping_add(1);
        slot.armed = true;
        slot.periodic = periodic;
        TimerToken {
            id,
            generation: slot.generation,
        }
    }

    /// Returns whether the timer was armed.
    pub fn disarm(&mut self, id: TimerId) -> bool {
        let slot = &mut self.slots[id.index()];
        let was_armed = slot.armed;
        slot.armed = false;
        slot.generation = slot.generation.wrapping_add(1);
        was_armed
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.slots[id.index()].armed
    }

    /// Accepts an expiry. One-shot timers disarm on acceptance.
    pub fn accept(&mut self, token: TimerToken) -> bool {
        let slot = &mut self.slots[token.id.index()];
        if !slot.armed || slot.generation != token.generation {
            return false;
        }
        if !slot.periodic {
            slot.armed = false;
        }
        true
    }
}
