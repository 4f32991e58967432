use std::collections::HashMap;

use tracing::{debug, warn};

use crate::mode::GameMode;
use crate::orchestrator::SceneGroupOrchestrator;
use crate::participant::{lobby_leader, team_population, ParticipantId, ParticipantRecord};
use crate::replication::{
    apply_count_event, apply_list_event, Envelope, Notification, ReplicationCursor,
    ReplicationError, SessionSnapshot, SyncPayload,
};
use crate::teams::Team;

/// Read-only peer copy of the server roster, channel counts and game mode.
/// Active-group events are forwarded to the peer's own orchestrator.
#[derive(Debug, Default)]
pub struct RosterMirror {
    cursor: ReplicationCursor,
    records: Vec<ParticipantRecord>,
    index_by_id: HashMap<ParticipantId, usize>,
    channel_counts: Vec<u32>,
    mode: Vec<GameMode>,
    notifications: Vec<Notification>,
}

impl RosterMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Ok(false)` for an envelope that was already applied.
    pub fn apply(
        &mut self,
        envelope: &Envelope,
        orchestrator: &mut SceneGroupOrchestrator,
    ) -> Result<bool, ReplicationError> {
        let accepted = match self.cursor.accept(envelope) {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(error = %error, "replication_out_of_order");
                return Err(error);
            }
        };
        if !accepted {
            debug!(seq = envelope.seq, "replication_duplicate_skipped");
            return Ok(false);
        }
        self.apply_payload(envelope.payload.clone(), orchestrator)?;
        Ok(true)
    }

    pub fn apply_snapshot(
        &mut self,
        snapshot: &SessionSnapshot,
        orchestrator: &mut SceneGroupOrchestrator,
    ) -> Result<(), ReplicationError> {
        for payload in &snapshot.payloads {
            self.apply_payload(payload.clone(), orchestrator)?;
        }
        self.resume_from(snapshot.resume_seq);
        Ok(())
    }

    pub fn apply_payload(
        &mut self,
        payload: SyncPayload,
        orchestrator: &mut SceneGroupOrchestrator,
    ) -> Result<(), ReplicationError> {
        match payload {
            SyncPayload::Roster(event) => {
                let result = apply_list_event(&mut self.records, event);
                self.refresh_cache();
                result
            }
            SyncPayload::ChannelCounts(event) => apply_count_event(&mut self.channel_counts, event),
            SyncPayload::ActiveGroups(event) => orchestrator.apply_remote(event),
            SyncPayload::GroupSnapshot(snapshot) => orchestrator.apply_snapshot(&snapshot),
            SyncPayload::GameMode(event) => apply_list_event(&mut self.mode, event),
            SyncPayload::Notify(notification) => {
                self.notifications.push(notification);
                Ok(())
            }
        }
    }

    pub fn resume_from(&mut self, seq: u64) {
        self.cursor = ReplicationCursor::starting_at(seq);
    }

    pub fn expected_seq(&self) -> u64 {
        self.cursor.expected()
    }

    pub fn record(&self, id: ParticipantId) -> Option<&ParticipantRecord> {
        self.index_by_id
            .get(&id)
            .and_then(|position| self.records.get(*position))
    }

    pub fn records(&self) -> &[ParticipantRecord] {
        &self.records
    }

    pub fn lobby_leader(&self) -> Option<ParticipantId> {
        lobby_leader(&self.records)
    }

    pub fn team_population(&self, team: Team) -> usize {
        team_population(&self.records, team)
    }

    pub fn channel_counts(&self) -> &[u32] {
        &self.channel_counts
    }

    pub fn mode(&self) -> Option<&GameMode> {
        self.mode.last()
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    fn refresh_cache(&mut self) {
        self.index_by_id.clear();
        self.index_by_id.extend(
            self.records
                .iter()
                .enumerate()
                .map(|(position, record)| (record.id, position)),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::{ContentRef, SceneCategory, SceneGroup, SceneGroupCatalog};
    use crate::orchestrator::{Authority, OrchestratorConfig};
    use crate::participant::{CharacterId, ChannelId, DisconnectReason};
    use crate::replication::{ListEvent, ReplicationStream};
    use crate::roster::ParticipantRoster;

    fn observer() -> SceneGroupOrchestrator {
        let catalog = SceneGroupCatalog::from_groups(vec![SceneGroup {
            name: "MapA".to_string(),
            category: SceneCategory::Gameplay,
            content: vec![ContentRef::new("maps/a")],
        }])
        .expect("catalog");
        SceneGroupOrchestrator::new(
            Arc::new(catalog),
            Authority::Observer,
            OrchestratorConfig::default(),
        )
    }

    fn record(id: i64, channel: u16) -> ParticipantRecord {
        ParticipantRecord::new(ParticipantId(id), CharacterId::new(format!("c{id}")), "p")
            .with_channel(Some(ChannelId(channel)))
    }

    #[test]
    fn mirror_tracks_server_roster() {
        let mut roster = ParticipantRoster::new(2);
        let mut stream = ReplicationStream::new();
        roster.add(record(5, 0)).expect("add");
        roster.add(record(2, 1)).expect("add");
        roster.add(record(-1, 1)).expect("add");
        roster.remove(ParticipantId(5)).expect("remove");
        stream.extend(roster.take_outbox());

        let mut mirror = RosterMirror::new();
        let mut orchestrator = observer();
        for envelope in stream.drain() {
            assert!(mirror.apply(&envelope, &mut orchestrator).expect("apply"));
        }

        assert_eq!(mirror.records(), roster.records());
        assert_eq!(mirror.channel_counts(), roster.channel_counts().as_slice());
        assert_eq!(mirror.lobby_leader(), Some(ParticipantId(2)));
        assert_eq!(mirror.record(ParticipantId(-1)).expect("bot").id, ParticipantId(-1));
        assert!(mirror.record(ParticipantId(5)).is_none());
    }

    #[test]
    fn gap_is_reported_and_nothing_applied() {
        let mut mirror = RosterMirror::new();
        let mut orchestrator = observer();
        let skipped = Envelope {
            seq: 1,
            payload: SyncPayload::Roster(ListEvent::Add(record(1, 0))),
        };
        assert!(matches!(
            mirror.apply(&skipped, &mut orchestrator),
            Err(ReplicationError::OutOfOrder { expected: 0, got: 1 })
        ));
        assert!(mirror.records().is_empty());
    }

    #[test]
    fn snapshot_then_live_events() {
        let mut roster = ParticipantRoster::new(1);
        roster.add(record(1, 0)).expect("add");
        roster.take_outbox();
        let snapshot = SessionSnapshot {
            resume_seq: 7,
            payloads: roster.snapshot_payloads(),
        };

        let mut mirror = RosterMirror::new();
        let mut orchestrator = observer();
        mirror.apply_snapshot(&snapshot, &mut orchestrator).expect("snapshot");
        assert_eq!(mirror.records().len(), 1);
        assert_eq!(mirror.channel_counts(), &[1]);
        assert_eq!(mirror.expected_seq(), 7);

        let live = Envelope {
            seq: 7,
            payload: SyncPayload::Notify(Notification::Disconnected {
                participant: ParticipantId(1),
                reason: DisconnectReason::Kicked,
            }),
        };
        assert!(mirror.apply(&live, &mut orchestrator).expect("live"));
        assert_eq!(mirror.take_notifications().len(), 1);
    }

    #[test]
    fn active_groups_drive_the_observer_orchestrator() {
        let mut mirror = RosterMirror::new();
        let mut orchestrator = observer();
        let envelope = Envelope {
            seq: 0,
            payload: SyncPayload::ActiveGroups(ListEvent::Add(crate::catalog::GroupIndex(0))),
        };
        mirror.apply(&envelope, &mut orchestrator).expect("apply");
        assert!(orchestrator.is_group_active("MapA"));
        assert!(orchestrator.is_busy_loading());
    }

    #[test]
    fn game_mode_value_replaces_previous() {
        let mut mirror = RosterMirror::new();
        let mut orchestrator = observer();
        mirror
            .apply_payload(
                SyncPayload::GameMode(ListEvent::Value(GameMode::new("deathmatch", false))),
                &mut orchestrator,
            )
            .expect("mode");
        mirror
            .apply_payload(
                SyncPayload::GameMode(ListEvent::Value(GameMode::lobby())),
                &mut orchestrator,
            )
            .expect("mode");
        assert_eq!(mirror.mode(), Some(&GameMode::lobby()));
    }
}
