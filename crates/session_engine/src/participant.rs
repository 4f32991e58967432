use std::fmt;

use serde::{Deserialize, Serialize};

use crate::teams::Team;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub i64);

impl ParticipantId {
    pub fn is_bot(self) -> bool {
        self.0 < 0
    }

    pub fn is_connected_client(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bot() {
            write!(f, "bot{}", self.0)
        } else {
            write!(f, "client{}", self.0)
        }
    }
}

/// Stable identity of the character a participant plays. Survives reconnects,
/// unlike [`ParticipantId`], so disconnect snapshots are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterId(pub String);

impl CharacterId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u16);

impl ChannelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: ParticipantId,
    pub character: CharacterId,
    pub display_name: String,
    pub channel: Option<ChannelId>,
    pub team: Team,
    pub version: u32,
}

impl ParticipantRecord {
    pub fn new(id: ParticipantId, character: CharacterId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            character,
            display_name: display_name.into(),
            channel: None,
            team: Team::default(),
            version: 0,
        }
    }

    pub fn with_team(mut self, team: Team) -> Self {
        self.team = team;
        self
    }

    pub fn with_channel(mut self, channel: Option<ChannelId>) -> Self {
        self.channel = channel;
        self
    }

    /// Channel this record occupies in the channel counts. Spectators and
    /// unassigned records occupy none.
    pub fn counted_channel(&self) -> Option<ChannelId> {
        if self.team == Team::Spectator {
            None
        } else {
            self.channel
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedParticipantRecord {
    pub character: CharacterId,
    pub last_id: ParticipantId,
    pub team: Team,
    pub channel: Option<ChannelId>,
}

impl From<&ParticipantRecord> for DisconnectedParticipantRecord {
    fn from(record: &ParticipantRecord) -> Self {
        Self {
            character: record.character.clone(),
            last_id: record.id,
            team: record.team,
            channel: record.channel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Left,
    Kicked,
    SpawnTimedOut,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Left => f.write_str("left the session"),
            DisconnectReason::Kicked => f.write_str("kicked by the lobby leader"),
            DisconnectReason::SpawnTimedOut => f.write_str("timed out while spawning"),
        }
    }
}

pub fn lobby_leader(records: &[ParticipantRecord]) -> Option<ParticipantId> {
    records
        .iter()
        .map(|record| record.id)
        .filter(|id| id.is_connected_client())
        .min()
}

pub fn team_population(records: &[ParticipantRecord], team: Team) -> usize {
    if team == Team::Spectator {
        return 0;
    }
    records.iter().filter(|record| record.team == team).count()
}
