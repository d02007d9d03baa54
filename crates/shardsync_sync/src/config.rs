//! # Sync Configuration

use serde::Deserialize;

use crate::world::MAX_UPDATE_RANGE;

/// Tunables shared by the character and item queues.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Radius of the observer fan-out.
    pub max_update_range: u16,
    /// Send property list revisions (`0xdc`) along with updates.
    pub properties: bool,
    /// Idle change-states kept per queue.
    pub state_pool_idle: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_update_range: MAX_UPDATE_RANGE,
            properties: true,
            state_pool_idle: 1024,
        }
    }
}
