use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{AccountBackend, BackendCall, BackendCalls, BackendReport};
use crate::catalog::{CatalogError, SceneCategory, SceneGroupCatalog};
use crate::channels::ChannelBalancer;
use crate::commands::{
    session_commands, CommandKind, CommandOutcome, CommandRejected, CommandTable, PeerCommand,
};
use crate::config::SessionConfig;
use crate::loader::SceneLoader;
use crate::metrics::SessionGauges;
use crate::mode::GameMode;
use crate::orchestrator::{
    Authority, GroupEvent, OrchestratorConfig, OrchestratorError, SceneGroupOrchestrator,
};
use crate::participant::{
    CharacterId, ChannelId, DisconnectReason, ParticipantId, ParticipantRecord,
};
use crate::replication::{Envelope, ListEvent, Notification, ReplicationStream, SessionSnapshot, SyncPayload};
use crate::roster::{ParticipantRoster, RosterError, UpdateOutcome};
use crate::spawn::{
    SpawnConfig, SpawnGate, SpawnKind, SpawnPointProvider, SpawnReport, SpawnRequest,
    SpawnScheduler, WorldObjectFactory,
};
use crate::teams::{MapRules, Team};

/// External collaborators the server drives every tick.
#[derive(Debug, Default)]
pub struct SessionServices<L, P, F, B> {
    pub loader: L,
    pub spawn_points: P,
    pub factory: F,
    pub backend: B,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub channel_count: usize,
    pub balancer: ChannelBalancer,
    pub rules: MapRules,
    pub orchestrator: OrchestratorConfig,
    pub spawn: SpawnConfig,
    pub backend_retry_limit: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionConfig::default().session_settings()
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error(transparent)]
    Scene(#[from] OrchestratorError),
    #[error(transparent)]
    Command(#[from] CommandRejected),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub id: ParticipantId,
    pub character: CharacterId,
    pub display_name: String,
    pub team: Team,
}

impl JoinRequest {
    pub fn new(id: ParticipantId, character: CharacterId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            character,
            display_name: display_name.into(),
            team: Team::default(),
        }
    }

    pub fn with_team(mut self, team: Team) -> Self {
        self.team = team;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub id: ParticipantId,
    pub channel: ChannelId,
    pub team: Team,
    pub restored_team: bool,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub groups: Vec<GroupEvent>,
    pub spawn: SpawnReport,
    pub backend: BackendReport,
    pub disconnected: Vec<(ParticipantId, DisconnectReason)>,
}

/// State the peer command handlers are allowed to touch.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) catalog: Arc<SceneGroupCatalog>,
    pub(crate) orchestrator: SceneGroupOrchestrator,
    pub(crate) roster: ParticipantRoster,
    pub(crate) rules: MapRules,
    pub(crate) mode: GameMode,
    pub(crate) pending: Vec<SyncPayload>,
}

impl SessionState {
    pub(crate) fn require_member(&self, sender: ParticipantId) -> Result<(), CommandRejected> {
        if self.roster.contains(sender) {
            Ok(())
        } else {
            Err(CommandRejected::UnknownSender(sender))
        }
    }

    pub(crate) fn require_leader(&self, sender: ParticipantId) -> Result<(), CommandRejected> {
        self.require_member(sender)?;
        if self.roster.lobby_leader() == Some(sender) {
            Ok(())
        } else {
            Err(CommandRejected::NotLeader { sender })
        }
    }

    pub(crate) fn category_of(&self, group: &str) -> Result<SceneCategory, CommandRejected> {
        let index = self
            .catalog
            .index_of(group)
            .map_err(|error| CommandRejected::Scene(OrchestratorError::Catalog(error)))?;
        self.catalog
            .group(index)
            .map(|group| group.category)
            .ok_or_else(|| {
                CommandRejected::Scene(OrchestratorError::Catalog(CatalogError::UnknownGroup {
                    name: group.to_string(),
                }))
            })
    }

    /// Loads a gameplay map and forgets every disconnect snapshot.
    pub(crate) fn change_map(&mut self, group: &str) -> Result<bool, OrchestratorError> {
        let changed = self.orchestrator.load_group(group)?;
        if changed {
            self.roster.reset_session();
            info!(group, "map_changed");
        }
        Ok(changed)
    }
}

pub struct SessionServer<L, P, F, B> {
    state: SessionState,
    balancer: ChannelBalancer,
    configured_strict: bool,
    scheduler: SpawnScheduler,
    backend_calls: BackendCalls,
    stream: ReplicationStream,
    commands: CommandTable<SessionState>,
    services: SessionServices<L, P, F, B>,
}

impl<L, P, F, B> SessionServer<L, P, F, B>
where
    L: SceneLoader,
    P: SpawnPointProvider,
    F: WorldObjectFactory,
    B: AccountBackend,
{
    pub fn new(
        catalog: Arc<SceneGroupCatalog>,
        settings: SessionSettings,
        services: SessionServices<L, P, F, B>,
    ) -> Self {
        let orchestrator =
            SceneGroupOrchestrator::new(Arc::clone(&catalog), Authority::Server, settings.orchestrator);
        let roster = ParticipantRoster::new(settings.channel_count);
        let mode = GameMode::lobby();
        let mut pending = vec![SyncPayload::GameMode(ListEvent::Value(mode.clone()))];
        pending.extend(
            roster
                .channel_counts()
                .as_slice()
                .iter()
                .map(|count| SyncPayload::ChannelCounts(ListEvent::Add(*count))),
        );
        info!(
            groups = catalog.len(),
            fingerprint = catalog.fingerprint(),
            channels = settings.channel_count,
            channel_capacity = settings.balancer.capacity(),
            strict = settings.balancer.strict_mode(),
            "session_server_created"
        );

        let mut server = Self {
            state: SessionState {
                catalog,
                orchestrator,
                roster,
                rules: settings.rules,
                mode,
                pending,
            },
            balancer: settings.balancer,
            configured_strict: settings.balancer.strict_mode(),
            scheduler: SpawnScheduler::new(settings.spawn),
            backend_calls: BackendCalls::new(settings.backend_retry_limit),
            stream: ReplicationStream::new(),
            commands: session_commands(),
            services,
        };
        server.flush();
        server
    }

    pub fn join(&mut self, request: JoinRequest) -> Result<JoinOutcome, SessionError> {
        let id = request.id;
        let channel = self.balancer.best_channel(self.state.roster.channel_counts());
        let mut team = request.team;
        if !self.state.roster.can_change_team(team, &self.state.rules) {
            debug!(participant = %id, team = ?team, "join_team_full_spectating");
            team = Team::Spectator;
        }
        let record = ParticipantRecord::new(id, request.character.clone(), request.display_name)
            .with_team(team)
            .with_channel(Some(channel));
        let added = self.state.roster.add(record)?;
        let team = added.restored_team.unwrap_or(team);

        self.scheduler.enqueue(SpawnRequest {
            participant: id,
            kind: SpawnKind::Initial,
        });
        if id.is_connected_client() {
            self.backend_calls.issue(
                &mut self.services.backend,
                BackendCall::FetchLoadout {
                    participant: id,
                    character: request.character,
                },
            );
        }
        self.flush();
        Ok(JoinOutcome {
            id,
            channel,
            team,
            restored_team: added.restored_team.is_some(),
        })
    }

    pub fn add_bot(
        &mut self,
        display_name: impl Into<String>,
        team: Team,
    ) -> Result<ParticipantId, SessionError> {
        let id = self.state.roster.allocate_bot_id();
        let character = CharacterId::new(format!("bot{}", id.0));
        let request = JoinRequest::new(id, character, display_name).with_team(team);
        self.join(request).map(|outcome| outcome.id)
    }

    pub fn leave(&mut self, id: ParticipantId) -> Result<ParticipantRecord, SessionError> {
        self.disconnect(id, DisconnectReason::Left)
    }

    pub fn kick(&mut self, id: ParticipantId) -> Result<ParticipantRecord, SessionError> {
        self.disconnect(id, DisconnectReason::Kicked)
    }

    pub fn respawn(&mut self, id: ParticipantId) -> bool {
        if !self.state.roster.contains(id) {
            return false;
        }
        self.scheduler.enqueue(SpawnRequest {
            participant: id,
            kind: SpawnKind::Respawn,
        })
    }

    pub fn handle_command(
        &mut self,
        sender: ParticipantId,
        command: PeerCommand,
    ) -> Result<CommandOutcome, CommandRejected> {
        let kind = command.kind();
        let result = self.commands.dispatch(&mut self.state, sender, command);
        match &result {
            Ok(CommandOutcome::Kick { target }) => {
                if let Err(error) = self.disconnect(*target, DisconnectReason::Kicked) {
                    warn!(sender = %sender, target = %target, error = %error, "kick_failed");
                }
            }
            Ok(outcome) => debug!(sender = %sender, command = %kind, outcome = ?outcome, "command_applied"),
            Err(error) => warn!(sender = %sender, command = %kind, error = %error, "command_rejected"),
        }
        self.flush();
        result
    }

    pub fn set_team(&mut self, id: ParticipantId, team: Team) -> Result<UpdateOutcome, SessionError> {
        let outcome = self.state.roster.set_team(id, team, &self.state.rules)?;
        self.flush();
        Ok(outcome)
    }

    pub fn load_group(&mut self, name: &str) -> Result<bool, SessionError> {
        let changed = self.state.orchestrator.load_group(name)?;
        self.flush();
        Ok(changed)
    }

    pub fn unload_group(&mut self, name: &str) -> Result<bool, SessionError> {
        let changed = self.state.orchestrator.unload_group(name)?;
        self.flush();
        Ok(changed)
    }

    pub fn set_map(&mut self, name: &str) -> Result<bool, SessionError> {
        if self.state.category_of(name)? != SceneCategory::Gameplay {
            return Err(CommandRejected::WrongCategory {
                group: name.to_string(),
                expected: "Gameplay",
            }
            .into());
        }
        let changed = self.state.change_map(name)?;
        self.flush();
        Ok(changed)
    }

    pub fn set_game_mode(&mut self, mode: GameMode) {
        if self.state.mode == mode {
            return;
        }
        info!(
            mode = %mode.id,
            spawning_allowed = mode.spawning_allowed,
            ranked = mode.ranked,
            "game_mode_changed"
        );
        self.balancer
            .set_strict_mode(self.configured_strict || mode.ranked);
        self.state
            .pending
            .push(SyncPayload::GameMode(ListEvent::Value(mode.clone())));
        self.state.mode = mode;
        self.flush();
    }

    pub fn start_session(&mut self) {
        self.state.roster.set_session_in_progress(true);
        info!(participants = self.state.roster.len(), "session_started");
    }

    pub fn end_session(&mut self) {
        self.state.roster.set_session_in_progress(false);
        self.state.roster.reset_session();
        info!("session_ended");
    }

    pub fn trigger_effect(&mut self, name: impl Into<String>, participant: Option<ParticipantId>) {
        self.state.pending.push(SyncPayload::Notify(Notification::Effect {
            name: name.into(),
            participant,
        }));
        self.flush();
    }

    pub fn tick(&mut self, dt: Duration) -> TickReport {
        let groups = self.state.orchestrator.tick(&mut self.services.loader, dt);
        let gate = SpawnGate {
            mode: &self.state.mode,
            loading_busy: self.state.orchestrator.is_busy_loading(),
        };
        let spawn = self.scheduler.tick(
            dt,
            gate,
            &self.state.roster,
            &mut self.services.spawn_points,
            &mut self.services.factory,
        );
        let backend = self.backend_calls.poll(&mut self.services.backend);

        let mut disconnected = Vec::with_capacity(spawn.disconnects.len());
        for (participant, reason) in &spawn.disconnects {
            match self.disconnect(*participant, *reason) {
                Ok(_) => disconnected.push((*participant, *reason)),
                Err(error) => warn!(participant = %participant, error = %error, "disconnect_failed"),
            }
        }
        self.flush();
        debug_assert!(
            self.state.roster.check_invariants().is_ok(),
            "roster invariants violated: {:?}",
            self.state.roster.check_invariants()
        );

        TickReport {
            groups,
            spawn,
            backend,
            disconnected,
        }
    }

    pub fn drain_outbound(&mut self) -> Vec<Envelope> {
        self.flush();
        self.stream.drain()
    }

    pub fn late_join_snapshot(&mut self) -> SessionSnapshot {
        self.flush();
        let mut payloads = vec![SyncPayload::GroupSnapshot(self.state.orchestrator.snapshot())];
        payloads.extend(self.state.roster.snapshot_payloads());
        payloads.push(SyncPayload::GameMode(ListEvent::Value(self.state.mode.clone())));
        SessionSnapshot {
            resume_seq: self.stream.next_seq(),
            payloads,
        }
    }

    pub fn gauges(&self) -> SessionGauges {
        SessionGauges {
            participants: self.state.roster.len(),
            spawn_queue_len: self.scheduler.queue_len(),
            pending_group_ops: self.state.orchestrator.pending_operations(),
            busy_loading: self.state.orchestrator.is_busy_loading(),
        }
    }

    pub fn catalog(&self) -> &SceneGroupCatalog {
        &self.state.catalog
    }

    pub fn roster(&self) -> &ParticipantRoster {
        &self.state.roster
    }

    pub fn orchestrator(&self) -> &SceneGroupOrchestrator {
        &self.state.orchestrator
    }

    pub fn scheduler(&self) -> &SpawnScheduler {
        &self.scheduler
    }

    /// Peer commands in registration order with their help text.
    pub fn command_help(&self) -> impl Iterator<Item = (CommandKind, &'static str)> + '_ {
        self.commands.iter_specs_in_order()
    }

    pub fn mode(&self) -> &GameMode {
        &self.state.mode
    }

    pub fn rules(&self) -> &MapRules {
        &self.state.rules
    }

    pub fn services(&self) -> &SessionServices<L, P, F, B> {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut SessionServices<L, P, F, B> {
        &mut self.services
    }

    fn disconnect(
        &mut self,
        id: ParticipantId,
        reason: DisconnectReason,
    ) -> Result<ParticipantRecord, SessionError> {
        let record = self.state.roster.remove(id)?;
        self.scheduler.cancel(id);
        if id.is_connected_client() {
            self.backend_calls.issue(
                &mut self.services.backend,
                BackendCall::UpdateLoadout {
                    participant: id,
                    character: record.character.clone(),
                },
            );
        }
        self.state
            .pending
            .push(SyncPayload::Notify(Notification::Disconnected {
                participant: id,
                reason,
            }));
        info!(participant = %id, reason = %reason, "participant_disconnected");
        self.flush();
        Ok(record)
    }

    fn flush(&mut self) {
        let groups = self.state.orchestrator.take_replication_events();
        self.stream
            .extend(groups.into_iter().map(SyncPayload::ActiveGroups));
        self.stream.extend(self.state.roster.take_outbox());
        self.stream.extend(self.state.pending.drain(..));
    }
}
