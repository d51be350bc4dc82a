use std::{collections::VecDeque, time::Duration};

use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveAction {
    Open,
    Close,
    ArmOffTimer(Duration),
    CancelOffTimer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Started,
    Queued,
    Dropped,
}

/// Valve session bookkeeping. Only one session runs at a time; triggers that arrive
/// while the valve is open wait in a bounded queue.
#[derive(Debug)]
pub struct Actuator {
    valve_open: bool,
    started_ms: Option<u64>,
    started_epoch: Option<i64>,
    last_duration_secs: u32,
    pending: VecDeque<u32>,
    queue_capacity: usize,
}

impl Actuator {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            valve_open: false,
            started_ms: None,
            started_epoch: None,
            last_duration_secs: 0,
            pending: VecDeque::with_capacity(queue_capacity),
            queue_capacity,
        }
    }

    pub fn is_open(&self) -> bool {
        self.valve_open
    }

    pub fn started_epoch(&self) -> Option<i64> {
        self.started_epoch
    }

    pub fn last_duration_secs(&self) -> u32 {
        self.last_duration_secs
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    pub fn open(
        &mut self,
        duration_secs: u32,
        now_ms: u64,
        now_epoch: Option<i64>,
    ) -> (OpenOutcome, Vec<ValveAction>) {
        if !self.valve_open {
            let mut actions = Vec::new();
            self.start_session(duration_secs, now_ms, now_epoch, &mut actions);
            return (OpenOutcome::Started, actions);
        }

        if self.pending.len() >= self.queue_capacity {
            warn!(
                "watering session queue full ({}); dropping {duration_secs}s trigger",
                self.queue_capacity
            );
            return (OpenOutcome::Dropped, Vec::new());
        }

        self.pending.push_back(duration_secs);
        info!(
            "valve busy; queued {duration_secs}s session ({} waiting)",
            self.pending.len()
        );
        (OpenOutcome::Queued, Vec::new())
    }

    /// Ends the current session and starts the next queued one, if any.
    /// Safe to call with no session open.
    pub fn close(&mut self, now_ms: u64, now_epoch: Option<i64>) -> Vec<ValveAction> {
        let mut actions = vec![ValveAction::Close, ValveAction::CancelOffTimer];

        if !self.valve_open {
            return actions;
        }

        let elapsed_ms = self
            .started_ms
            .map(|start| now_ms.saturating_sub(start))
            .unwrap_or(0);
        self.last_duration_secs = u32::try_from((elapsed_ms + 500) / 1000).unwrap_or(u32::MAX);
        self.valve_open = false;
        self.started_ms = None;
        self.started_epoch = None;
        info!("valve closed after {}s", self.last_duration_secs);

        if let Some(next) = self.pending.pop_front() {
            self.start_session(next, now_ms, now_epoch, &mut actions);
        }

        actions
    }

    /// Explicit "off now": drops anything queued, then closes.
    pub fn force_off(&mut self, now_ms: u64, now_epoch: Option<i64>) -> Vec<ValveAction> {
        if !self.pending.is_empty() {
            info!("dropping {} queued watering sessions", self.pending.len());
            self.pending.clear();
        }
        self.close(now_ms, now_epoch)
    }

    fn start_session(
        &mut self,
        duration_secs: u32,
        now_ms: u64,
        now_epoch: Option<i64>,
        actions: &mut Vec<ValveAction>,
    ) {
        self.valve_open = true;
        self.started_ms = Some(now_ms);
        self.started_epoch = now_epoch;
        actions.push(ValveAction::Open);
        actions.push(ValveAction::ArmOffTimer(Duration::from_secs(u64::from(
            duration_secs,
        ))));
        info!("valve opened for {duration_secs}s");
    }
}
