use log::{info, warn};

use crate::{
    error::{IrrigationError, Result},
    event::{Schedule, WaterEvent, SCHEDULE_SLOTS},
};

/// Persistent key-value collaborator (NVS on the device, a JSON file on the host).
pub trait KvStore: Send {
    fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    fn set_blob(&mut self, key: &str, value: &[u8]) -> anyhow::Result<()>;
    fn get_str(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set_str(&mut self, key: &str, value: &str) -> anyhow::Result<()>;
}

pub fn slot_key(index: usize) -> String {
    format!("event{index}")
}

/// Fixed-capacity event table with write-through persistence, one slot per write.
pub struct EventStore {
    schedule: Schedule,
}

impl EventStore {
    /// Reads every slot. Missing or undecodable slots come back disabled.
    pub fn load(store: &dyn KvStore) -> Self {
        let mut schedule = Schedule::default();

        for index in 0..SCHEDULE_SLOTS {
            let key = slot_key(index);
            let event = match store.get_blob(&key) {
                Ok(Some(raw)) => match serde_json::from_slice::<WaterEvent>(&raw) {
                    Ok(mut event) if event.is_well_formed() => {
                        event.normalize();
                        event
                    }
                    Ok(_) => {
                        warn!("schedule slot {index} holds out-of-range values; treating as disabled");
                        WaterEvent::default()
                    }
                    Err(err) => {
                        warn!("schedule slot {index} is corrupt ({err}); treating as disabled");
                        WaterEvent::default()
                    }
                },
                Ok(None) => WaterEvent::default(),
                Err(err) => {
                    warn!("failed to read schedule slot {index}: {err:#}");
                    WaterEvent::default()
                }
            };
            schedule.set(index, event);
        }

        info!(
            "loaded schedule: {}/{} slots enabled",
            schedule.enabled_count(),
            SCHEDULE_SLOTS
        );
        Self { schedule }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Writes into the lowest disabled slot. Memory only changes after the slot is persisted.
    pub fn add(&mut self, store: &mut dyn KvStore, event: WaterEvent) -> Result<usize> {
        let Some(index) = self.schedule.first_free_slot() else {
            return Err(IrrigationError::Capacity {
                capacity: SCHEDULE_SLOTS,
            });
        };

        let event = WaterEvent {
            enabled: true,
            ..event
        };
        persist_slot(store, index, &event)?;
        self.schedule.set(index, event);

        info!("schedule slot {index} added: {event:?}");
        Ok(index)
    }

    pub fn remove(&mut self, store: &mut dyn KvStore, index: usize) -> Result<()> {
        let Some(current) = self.schedule.get(index).copied() else {
            return Err(IrrigationError::NotFound { index });
        };
        if !current.enabled {
            return Ok(());
        }

        let disabled = WaterEvent {
            enabled: false,
            ..current
        };
        persist_slot(store, index, &disabled)?;
        self.schedule.set(index, disabled);

        info!("schedule slot {index} removed");
        Ok(())
    }
}

fn persist_slot(store: &mut dyn KvStore, index: usize, event: &WaterEvent) -> Result<()> {
    let payload = serde_json::to_vec(event).map_err(|err| IrrigationError::Storage(err.into()))?;
    store
        .set_blob(&slot_key(index), &payload)
        .map_err(IrrigationError::Storage)
}
