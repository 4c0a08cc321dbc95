//! Context configuration.

use serde::{Deserialize, Serialize};

use crate::bus::DEFAULT_CHANGE_CHANNEL_CAPACITY;

/// Default capacity of the write failure channel.
pub const DEFAULT_FAILURE_CHANNEL_CAPACITY: usize = 256;

/// Configuration for a [`Clinic`](crate::Clinic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinicConfig {
    /// Put an optimistically deleted record back into its cache when the
    /// store rejects the delete. When false the record stays hidden until
    /// the next snapshot.
    pub restore_on_failed_delete: bool,
    /// Capacity of the write failure channel.
    pub failure_channel_capacity: usize,
    /// Capacity of the async change-event channel.
    pub change_channel_capacity: usize,
}

impl Default for ClinicConfig {
    fn default() -> Self {
        Self {
            restore_on_failed_delete: false,
            failure_channel_capacity: DEFAULT_FAILURE_CHANNEL_CAPACITY,
            change_channel_capacity: DEFAULT_CHANGE_CHANNEL_CAPACITY,
        }
    }
}
