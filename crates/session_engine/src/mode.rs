use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameModeId(pub String);

impl fmt::Display for GameModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMode {
    pub id: GameModeId,
    pub spawning_allowed: bool,
    /// Ranked modes keep every participant on channel 0.
    #[serde(default)]
    pub ranked: bool,
}

impl GameMode {
    pub fn lobby() -> Self {
        Self {
            id: GameModeId("lobby".to_string()),
            spawning_allowed: true,
            ranked: false,
        }
    }

    pub fn new(id: impl Into<String>, spawning_allowed: bool) -> Self {
        Self {
            id: GameModeId(id.into()),
            spawning_allowed,
            ranked: false,
        }
    }

    pub fn ranked(mut self) -> Self {
        self.ranked = true;
        self
    }
}

impl Default for GameMode {
    fn default() -> Self {
        Self::lobby()
    }
}
