use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::GroupIndex;
use crate::mode::GameMode;
use crate::orchestrator::ActiveGroupSnapshot;
use crate::participant::{DisconnectReason, ParticipantId, ParticipantRecord};

const REPLICATION_PREFIX: &str = "R ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum ListEvent<T> {
    Add(T),
    Remove(usize),
    Update(usize, T),
    Value(T),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Effect {
        name: String,
        participant: Option<ParticipantId>,
    },
    Disconnected {
        participant: ParticipantId,
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "event", rename_all = "snake_case")]
pub enum SyncPayload {
    Roster(ListEvent<ParticipantRecord>),
    ChannelCounts(ListEvent<u32>),
    ActiveGroups(ListEvent<GroupIndex>),
    GroupSnapshot(ActiveGroupSnapshot),
    GameMode(ListEvent<GameMode>),
    Notify(Notification),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub payload: SyncPayload,
}

/// Full server state for a late joiner. Live envelopes resume at `resume_seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub resume_seq: u64,
    pub payloads: Vec<SyncPayload>,
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("replication gap: expected seq {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("list index {index} out of range (len {len})")]
    UnknownIndex { index: usize, len: usize },
    #[error("catalog fingerprint mismatch: local {local}, remote {remote}")]
    CatalogMismatch { local: String, remote: String },
    #[error("unsupported event for topic {topic}")]
    UnsupportedEvent { topic: &'static str },
    #[error("malformed replication line: {line}")]
    MalformedLine { line: String },
    #[error("replication codec failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Server side: stamps payloads with consecutive sequence numbers in issue order.
#[derive(Debug, Default)]
pub struct ReplicationStream {
    next_seq: u64,
    outbound: Vec<Envelope>,
}

impl ReplicationStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: SyncPayload) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.outbound.push(Envelope { seq, payload });
        seq
    }

    pub fn extend(&mut self, payloads: impl IntoIterator<Item = SyncPayload>) {
        for payload in payloads {
            self.push(payload);
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn pending(&self) -> &[Envelope] {
        &self.outbound
    }

    pub fn drain(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbound)
    }
}

/// Peer side: admits envelopes strictly in sequence.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationCursor {
    expected: u64,
}

impl ReplicationCursor {
    pub fn starting_at(seq: u64) -> Self {
        Self { expected: seq }
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// `Ok(true)` means apply, `Ok(false)` means an already-applied duplicate.
    pub fn accept(&mut self, envelope: &Envelope) -> Result<bool, ReplicationError> {
        if envelope.seq < self.expected {
            return Ok(false);
        }
        if envelope.seq > self.expected {
            return Err(ReplicationError::OutOfOrder {
                expected: self.expected,
                got: envelope.seq,
            });
        }
        self.expected = self.expected.saturating_add(1);
        Ok(true)
    }
}

pub fn apply_list_event<T>(list: &mut Vec<T>, event: ListEvent<T>) -> Result<(), ReplicationError> {
    match event {
        ListEvent::Add(value) => list.push(value),
        ListEvent::Remove(index) => {
            if index >= list.len() {
                return Err(ReplicationError::UnknownIndex {
                    index,
                    len: list.len(),
                });
            }
            list.remove(index);
        }
        ListEvent::Update(index, value) => {
            let len = list.len();
            let slot = list
                .get_mut(index)
                .ok_or(ReplicationError::UnknownIndex { index, len })?;
            *slot = value;
        }
        ListEvent::Value(value) => {
            list.clear();
            list.push(value);
        }
        ListEvent::Clear => list.clear(),
    }
    Ok(())
}

/// Channel-count updates may name a channel the mirror has not seen yet.
pub(crate) fn apply_count_event(
    counts: &mut Vec<u32>,
    event: ListEvent<u32>,
) -> Result<(), ReplicationError> {
    if let ListEvent::Update(index, _) = &event {
        if *index >= counts.len() {
            counts.resize(*index + 1, 0);
        }
    }
    apply_list_event(counts, event)
}

pub fn encode_line(envelope: &Envelope) -> Result<String, ReplicationError> {
    let json = serde_json::to_string(envelope)?;
    Ok(format!("{REPLICATION_PREFIX}{json}\n"))
}

pub fn decode_line(raw: &str) -> Result<Envelope, ReplicationError> {
    let trimmed = raw.trim_end_matches(['\r', '\n']);
    let Some(json) = trimmed.strip_prefix(REPLICATION_PREFIX) else {
        return Err(ReplicationError::MalformedLine {
            line: trimmed.to_string(),
        });
    };
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::CharacterId;
    use crate::teams::Team;

    #[test]
    fn stream_numbers_in_issue_order() {
        let mut stream = ReplicationStream::new();
        stream.push(SyncPayload::ActiveGroups(ListEvent::Add(GroupIndex(2))));
        stream.push(SyncPayload::ActiveGroups(ListEvent::Remove(0)));
        let drained = stream.drain();
        assert_eq!(drained[0].seq, 0);
        assert_eq!(drained[1].seq, 1);
        assert!(stream.pending().is_empty());
        assert_eq!(stream.next_seq(), 2);
    }

    #[test]
    fn cursor_rejects_gaps_and_skips_duplicates() {
        let mut cursor = ReplicationCursor::default();
        let first = Envelope {
            seq: 0,
            payload: SyncPayload::ActiveGroups(ListEvent::Clear),
        };
        let third = Envelope {
            seq: 2,
            payload: SyncPayload::ActiveGroups(ListEvent::Clear),
        };
        assert!(cursor.accept(&first).expect("first"));
        assert!(!cursor.accept(&first).expect("duplicate"));
        assert!(matches!(
            cursor.accept(&third),
            Err(ReplicationError::OutOfOrder {
                expected: 1,
                got: 2
            })
        ));
    }

    #[test]
    fn list_events_apply_by_index() {
        let mut list = vec![1u32, 2, 3];
        apply_list_event(&mut list, ListEvent::Remove(1)).expect("remove");
        apply_list_event(&mut list, ListEvent::Update(1, 9)).expect("update");
        apply_list_event(&mut list, ListEvent::Add(4)).expect("add");
        assert_eq!(list, vec![1, 9, 4]);
        assert!(matches!(
            apply_list_event(&mut list, ListEvent::Remove(7)),
            Err(ReplicationError::UnknownIndex { index: 7, len: 3 })
        ));
        apply_list_event(&mut list, ListEvent::Clear).expect("clear");
        assert!(list.is_empty());
    }

    #[test]
    fn count_updates_grow_the_mirror() {
        let mut counts = vec![1];
        apply_count_event(&mut counts, ListEvent::Update(2, 5)).expect("update");
        assert_eq!(counts, vec![1, 0, 5]);
    }

    #[test]
    fn wire_line_carries_roster_event() {
        let record = ParticipantRecord::new(ParticipantId(3), CharacterId::new("hero"), "Hero")
            .with_team(Team::Squad(1));
        let envelope = Envelope {
            seq: 41,
            payload: SyncPayload::Roster(ListEvent::Update(0, record)),
        };
        let line = encode_line(&envelope).expect("encode");
        assert!(line.starts_with("R {"));
        assert!(line.ends_with('\n'));
        assert_eq!(decode_line(&line).expect("decode"), envelope);
    }

    #[test]
    fn decode_rejects_unprefixed_lines() {
        assert!(matches!(
            decode_line("{\"seq\":0}"),
            Err(ReplicationError::MalformedLine { .. })
        ));
        assert!(matches!(
            decode_line("R not-json"),
            Err(ReplicationError::Codec(_))
        ));
    }
}
