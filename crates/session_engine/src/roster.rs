use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channels::ChannelCounts;
use crate::participant::{
    lobby_leader, team_population, CharacterId, ChannelId, DisconnectedParticipantRecord,
    ParticipantId, ParticipantRecord,
};
use crate::replication::{ListEvent, SyncPayload};
use crate::teams::{check_team_change, AdmissionDenied, MapRules, Team};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RosterError {
    #[error("participant {0} is already in the roster")]
    DuplicateId(ParticipantId),
    #[error("participant {0} is not in the roster")]
    NotFound(ParticipantId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RosterInvariantError {
    #[error("channel {channel} counts {recorded} but {tallied} records occupy it")]
    ChannelCount {
        channel: usize,
        recorded: u32,
        tallied: u32,
    },
    #[error("id cache is stale for participant {0}")]
    StaleCache(ParticipantId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    pub restored_team: Option<Team>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    TeamChangeDenied(AdmissionDenied),
}

/// Canonical, server-owned participant list. Every mutation refreshes the id
/// cache before returning and queues the matching replication events.
#[derive(Debug)]
pub struct ParticipantRoster {
    records: Vec<ParticipantRecord>,
    index_by_id: HashMap<ParticipantId, usize>,
    disconnected: HashMap<CharacterId, DisconnectedParticipantRecord>,
    channel_counts: ChannelCounts,
    session_in_progress: bool,
    next_bot_id: i64,
    outbox: Vec<SyncPayload>,
}

impl ParticipantRoster {
    pub fn new(channel_count: usize) -> Self {
        Self {
            records: Vec::new(),
            index_by_id: HashMap::new(),
            disconnected: HashMap::new(),
            channel_counts: ChannelCounts::new(channel_count),
            session_in_progress: false,
            next_bot_id: -1,
            outbox: Vec::new(),
        }
    }

    pub fn add(&mut self, mut record: ParticipantRecord) -> Result<AddOutcome, RosterError> {
        if self.index_by_id.contains_key(&record.id) {
            warn!(participant = %record.id, "roster_duplicate_id");
            return Err(RosterError::DuplicateId(record.id));
        }

        let restored_team = self.disconnected.remove(&record.character).map(|snapshot| {
            record.team = snapshot.team;
            snapshot.team
        });

        let counted = record.counted_channel();
        info!(
            participant = %record.id,
            character = %record.character,
            team = ?record.team,
            restored = restored_team.is_some(),
            "participant_added"
        );
        self.records.push(record.clone());
        self.refresh_cache();
        self.outbox.push(SyncPayload::Roster(ListEvent::Add(record)));
        self.transfer_counts(None, counted);
        Ok(AddOutcome { restored_team })
    }

    pub fn remove(&mut self, id: ParticipantId) -> Result<ParticipantRecord, RosterError> {
        let Some(position) = self.index_by_id.get(&id).copied() else {
            warn!(participant = %id, "roster_remove_not_found");
            return Err(RosterError::NotFound(id));
        };
        let record = self.records.remove(position);
        if self.session_in_progress {
            self.disconnected.insert(
                record.character.clone(),
                DisconnectedParticipantRecord::from(&record),
            );
        }
        self.refresh_cache();
        self.outbox
            .push(SyncPayload::Roster(ListEvent::Remove(position)));
        self.transfer_counts(record.counted_channel(), None);
        info!(participant = %id, snapshot = self.session_in_progress, "participant_removed");
        Ok(record)
    }

    /// Replaces the record with the same id. A team change the map rules do not
    /// admit leaves the roster untouched.
    pub fn update(
        &mut self,
        record: ParticipantRecord,
        rules: &MapRules,
    ) -> Result<UpdateOutcome, RosterError> {
        let Some(position) = self.index_by_id.get(&record.id).copied() else {
            warn!(participant = %record.id, "roster_update_not_found");
            return Err(RosterError::NotFound(record.id));
        };
        let current_team = self.records[position].team;
        if record.team != current_team {
            let population = team_population(&self.records, record.team);
            if let Err(denied) = check_team_change(record.team, population, rules) {
                debug!(participant = %record.id, error = %denied, "team_change_denied");
                return Ok(UpdateOutcome::TeamChangeDenied(denied));
            }
        }
        self.replace(position, record);
        Ok(UpdateOutcome::Applied)
    }

    pub fn set_team(
        &mut self,
        id: ParticipantId,
        team: Team,
        rules: &MapRules,
    ) -> Result<UpdateOutcome, RosterError> {
        let record = self.get(id).ok_or(RosterError::NotFound(id))?;
        if record.team == team {
            return Ok(UpdateOutcome::Applied);
        }
        let changed = record.clone().with_team(team);
        self.update(changed, rules)
    }

    pub fn set_channel(
        &mut self,
        id: ParticipantId,
        channel: Option<ChannelId>,
    ) -> Result<(), RosterError> {
        let position = self
            .index_by_id
            .get(&id)
            .copied()
            .ok_or(RosterError::NotFound(id))?;
        let changed = self.records[position].clone().with_channel(channel);
        self.replace(position, changed);
        Ok(())
    }

    pub fn get(&self, id: ParticipantId) -> Option<&ParticipantRecord> {
        self.index_by_id
            .get(&id)
            .and_then(|position| self.records.get(*position))
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.index_by_id.contains_key(&id)
    }

    pub fn records(&self) -> &[ParticipantRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn lobby_leader(&self) -> Option<ParticipantId> {
        lobby_leader(&self.records)
    }

    pub fn team_population(&self, team: Team) -> usize {
        team_population(&self.records, team)
    }

    pub fn can_change_team(&self, team: Team, rules: &MapRules) -> bool {
        check_team_change(team, self.team_population(team), rules).is_ok()
    }

    pub fn channel_counts(&self) -> &ChannelCounts {
        &self.channel_counts
    }

    pub fn disconnected(&self, character: &CharacterId) -> Option<&DisconnectedParticipantRecord> {
        self.disconnected.get(character)
    }

    pub fn disconnected_len(&self) -> usize {
        self.disconnected.len()
    }

    pub fn session_in_progress(&self) -> bool {
        self.session_in_progress
    }

    pub fn set_session_in_progress(&mut self, in_progress: bool) {
        self.session_in_progress = in_progress;
    }

    pub fn reset_session(&mut self) {
        if !self.disconnected.is_empty() {
            info!(cleared = self.disconnected.len(), "disconnect_snapshots_cleared");
        }
        self.disconnected.clear();
    }

    pub fn allocate_bot_id(&mut self) -> ParticipantId {
        loop {
            let id = ParticipantId(self.next_bot_id);
            self.next_bot_id = self.next_bot_id.saturating_sub(1);
            if !self.index_by_id.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn take_outbox(&mut self) -> Vec<SyncPayload> {
        std::mem::take(&mut self.outbox)
    }

    /// Full state for a peer joining mid-session.
    pub fn snapshot_payloads(&self) -> Vec<SyncPayload> {
        let mut payloads = Vec::with_capacity(self.records.len() + self.channel_counts.len() + 2);
        payloads.push(SyncPayload::Roster(ListEvent::Clear));
        payloads.extend(
            self.records
                .iter()
                .cloned()
                .map(|record| SyncPayload::Roster(ListEvent::Add(record))),
        );
        payloads.push(SyncPayload::ChannelCounts(ListEvent::Clear));
        payloads.extend(
            self.channel_counts
                .as_slice()
                .iter()
                .map(|count| SyncPayload::ChannelCounts(ListEvent::Add(*count))),
        );
        payloads
    }

    pub fn check_invariants(&self) -> Result<(), RosterInvariantError> {
        for (position, record) in self.records.iter().enumerate() {
            if self.index_by_id.get(&record.id) != Some(&position) {
                return Err(RosterInvariantError::StaleCache(record.id));
            }
        }
        let mut tallied = vec![0u32; self.channel_counts.len()];
        for channel in self.records.iter().filter_map(ParticipantRecord::counted_channel) {
            if channel.index() >= tallied.len() {
                tallied.resize(channel.index() + 1, 0);
            }
            tallied[channel.index()] += 1;
        }
        for (channel, tallied) in tallied.iter().enumerate() {
            let recorded = self.channel_counts.get(ChannelId(channel as u16));
            if recorded != *tallied {
                return Err(RosterInvariantError::ChannelCount {
                    channel,
                    recorded,
                    tallied: *tallied,
                });
            }
        }
        Ok(())
    }

    fn replace(&mut self, position: usize, mut record: ParticipantRecord) {
        let previous = &self.records[position];
        let from = previous.counted_channel();
        record.version = previous.version.wrapping_add(1);
        let to = record.counted_channel();
        self.records[position] = record.clone();
        self.outbox
            .push(SyncPayload::Roster(ListEvent::Update(position, record)));
        self.transfer_counts(from, to);
    }

    fn transfer_counts(&mut self, from: Option<ChannelId>, to: Option<ChannelId>) {
        for (channel, count) in self.channel_counts.transfer(from, to) {
            self.outbox
                .push(SyncPayload::ChannelCounts(ListEvent::Update(channel, count)));
        }
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
    use super::*;

    fn player(id: i64, channel: u16) -> ParticipantRecord {
        ParticipantRecord::new(
            ParticipantId(id),
            CharacterId::new(format!("char-{id}")),
            format!("Player {id}"),
        )
        .with_channel(Some(ChannelId(channel)))
    }

    fn rules(max: u32, teams: u32) -> MapRules {
        MapRules {
            max_players_for_map: max,
            possible_team_count: teams,
        }
    }

    #[test]
    fn duplicate_add_and_double_remove_fail() {
        let mut roster = ParticipantRoster::new(2);
        roster.add(player(1, 0)).expect("first add");
        assert_eq!(
            roster.add(player(1, 0)),
            Err(RosterError::DuplicateId(ParticipantId(1)))
        );
        roster.remove(ParticipantId(1)).expect("first remove");
        assert_eq!(
            roster.remove(ParticipantId(1)),
            Err(RosterError::NotFound(ParticipantId(1)))
        );
        roster.check_invariants().expect("invariants");
    }

    #[test]
    fn channel_counts_follow_every_mutation() {
        let mut roster = ParticipantRoster::new(2);
        roster.add(player(1, 0)).expect("add");
        roster.add(player(2, 0)).expect("add");
        roster.add(player(3, 1).with_team(Team::Spectator)).expect("add");
        assert_eq!(roster.channel_counts().as_slice(), &[2, 0]);

        roster
            .set_channel(ParticipantId(2), Some(ChannelId(1)))
            .expect("move");
        assert_eq!(roster.channel_counts().as_slice(), &[1, 1]);

        roster
            .set_team(ParticipantId(1), Team::Spectator, &MapRules::default())
            .expect("spectate");
        assert_eq!(roster.channel_counts().as_slice(), &[0, 1]);

        roster.remove(ParticipantId(2)).expect("remove");
        assert_eq!(roster.channel_counts().total(), 0);
        roster.check_invariants().expect("invariants");
    }

    #[test]
    fn rejoin_during_session_restores_team() {
        let mut roster = ParticipantRoster::new(1);
        roster.set_session_in_progress(true);
        roster
            .add(player(4, 0).with_team(Team::Squad(1)))
            .expect("add");
        roster.remove(ParticipantId(4)).expect("remove");
        assert!(roster.disconnected(&CharacterId::new("char-4")).is_some());

        let rejoin = ParticipantRecord::new(ParticipantId(9), CharacterId::new("char-4"), "Back");
        let outcome = roster.add(rejoin).expect("rejoin");
        assert_eq!(outcome.restored_team, Some(Team::Squad(1)));
        assert_eq!(roster.get(ParticipantId(9)).expect("record").team, Team::Squad(1));
        assert_eq!(roster.disconnected_len(), 0);
    }

    #[test]
    fn no_snapshot_outside_a_session_or_after_reset() {
        let mut roster = ParticipantRoster::new(1);
        roster.add(player(1, 0)).expect("add");
        roster.remove(ParticipantId(1)).expect("remove");
        assert_eq!(roster.disconnected_len(), 0);

        roster.set_session_in_progress(true);
        roster.add(player(2, 0)).expect("add");
        roster.remove(ParticipantId(2)).expect("remove");
        roster.reset_session();
        let outcome = roster.add(player(2, 0)).expect("re-add");
        assert_eq!(outcome.restored_team, None);
    }

    #[test]
    fn full_team_rejects_change_silently() {
        let mut roster = ParticipantRoster::new(1);
        let rules = rules(8, 2);
        for id in 1..=4 {
            roster
                .add(player(id, 0).with_team(Team::Squad(0)))
                .expect("add");
        }
        roster.add(player(5, 0).with_team(Team::Squad(1))).expect("add");
        assert!(!roster.can_change_team(Team::Squad(0), &rules));

        let outcome = roster
            .set_team(ParticipantId(5), Team::Squad(0), &rules)
            .expect("update");
        assert!(matches!(outcome, UpdateOutcome::TeamChangeDenied(denied) if denied.capacity == 4));
        let record = roster.get(ParticipantId(5)).expect("record");
        assert_eq!(record.team, Team::Squad(1));
        assert_eq!(record.version, 0);
    }

    #[test]
    fn updates_bump_version_and_replicate_in_order() {
        let mut roster = ParticipantRoster::new(2);
        roster.add(player(1, 0)).expect("add");
        roster.take_outbox();

        roster
            .set_channel(ParticipantId(1), Some(ChannelId(1)))
            .expect("move");
        assert_eq!(roster.get(ParticipantId(1)).expect("record").version, 1);

        let outbox = roster.take_outbox();
        assert!(matches!(
            outbox[0],
            SyncPayload::Roster(ListEvent::Update(0, _))
        ));
        assert_eq!(
            &outbox[1..],
            &[
                SyncPayload::ChannelCounts(ListEvent::Update(0, 0)),
                SyncPayload::ChannelCounts(ListEvent::Update(1, 1)),
            ]
        );
    }

    #[test]
    fn cache_is_fresh_after_structural_changes() {
        let mut roster = ParticipantRoster::new(1);
        for id in [3, 1, 2] {
            roster.add(player(id, 0)).expect("add");
        }
        roster.remove(ParticipantId(3)).expect("remove");
        assert_eq!(roster.get(ParticipantId(2)).expect("record").id, ParticipantId(2));
        assert_eq!(roster.lobby_leader(), Some(ParticipantId(1)));
        roster.check_invariants().expect("invariants");
    }

    #[test]
    fn bot_ids_count_down_from_minus_one() {
        let mut roster = ParticipantRoster::new(1);
        let first = roster.allocate_bot_id();
        let second = roster.allocate_bot_id();
        assert_eq!(first, ParticipantId(-1));
        assert_eq!(second, ParticipantId(-2));
        assert!(first.is_bot());
    }

    #[test]
    fn update_of_missing_record_is_not_found() {
        let mut roster = ParticipantRoster::new(1);
        assert_eq!(
            roster.update(player(7, 0), &MapRules::default()),
            Err(RosterError::NotFound(ParticipantId(7)))
        );
    }

    #[test]
    fn snapshot_payloads_rebuild_state() {
        let mut roster = ParticipantRoster::new(2);
        roster.add(player(1, 1)).expect("add");
        let payloads = roster.snapshot_payloads();
        assert_eq!(payloads.first(), Some(&SyncPayload::Roster(ListEvent::Clear)));
        assert!(payloads.contains(&SyncPayload::ChannelCounts(ListEvent::Add(1))));
        assert_eq!(payloads.len(), 1 + 1 + 1 + 2);
    }
}
