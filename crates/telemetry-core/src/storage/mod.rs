pub mod log;
pub mod model;
pub mod shm;

pub use log::{DurableLogger, LogError, read_log};
pub use model::{SENTINEL, Sample};
pub use shm::{DEFAULT_SHM_NAME, ShmError, SnapshotPublisher, SnapshotReader};
