//! Convenience re-exports: `use ecu_common::prelude::*;`

pub use crate::config::{ConfigError, ConfigLoader, LogLevel};
pub use crate::consts::*;
pub use crate::persistence::{
    get_json, put_json, FileKvStore, KvStore, MemKvStore, PersistenceError,
};
pub use crate::sensor::{SensorSeqlock, SensorSnapshot, StaleSensorError};
pub use crate::table::{InterpCache, Table16x16};
