pub mod actuator;
pub mod config;
pub mod connectivity;
pub mod device;
pub mod error;
pub mod event;
pub mod ports;
pub mod scheduler;
pub mod store;
pub mod timer;
pub mod types;
pub mod update;

#[cfg(test)]
pub(crate) mod testing;

pub use actuator::{Actuator, OpenOutcome, ValveAction};
pub use config::{ControllerConfig, NetworkConfig};
pub use connectivity::{
    ConnectivityManager, ConnectivityState, DisconnectReason, NetAction, NetEvent,
};
pub use device::{Device, DeviceParts};
pub use error::{IrrigationError, Result};
pub use event::{EventMode, Schedule, WaterEvent, ALL_DAYS_MASK, SCHEDULE_SLOTS};
pub use ports::{
    Clock, IndicatorPattern, NetworkPort, Restarter, ServiceHost, StatusIndicator, ValveOutput,
};
pub use scheduler::{Scheduler, Trigger};
pub use store::{EventStore, KvStore};
pub use timer::{TimerId, TimerService, TimerToken, Timers};
pub use types::{
    AddEventRequest, AddEventResponse, DeviceStatus, NetworkConfigUpdate, NetworkConfigView,
    NetworkUpdateResponse, ScheduleSlotView, UpdateAccepted, UpdateRequest,
};
pub use update::{
    FirmwareSource, FirmwareStream, UpdateManager, UpdatePartition, UpdateReport, UpdateStatus,
    UpdateWriter,
};
