//! Power settings queued for actuation after a commit.

use serde::{Deserialize, Serialize};

/// Requested power configuration for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerSetting {
    pub online: bool,
    pub governor: Option<String>,
    pub frequency_khz: Option<u32>,
}

impl PowerSetting {
    pub fn online() -> Self {
        Self {
            online: true,
            governor: None,
            frequency_khz: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            online: false,
            governor: None,
            frequency_khz: None,
        }
    }

    pub fn with_governor(mut self, governor: &str) -> Self {
        self.governor = Some(governor.to_string());
        self
    }

    pub fn with_frequency(mut self, frequency_khz: u32) -> Self {
        self.frequency_khz = Some(frequency_khz);
        self
    }
}
