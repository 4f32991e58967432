use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::catalog::SceneCategory;
use crate::orchestrator::OrchestratorError;
use crate::participant::ParticipantId;
use crate::roster::UpdateOutcome;
use crate::session::SessionState;
use crate::teams::Team;

/// Requests a peer may send over the reliable command channel. Nothing in the
/// payload is trusted; the sender id comes from the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerCommand {
    LoadScene { group: String },
    SetTeam { target: ParticipantId, team: Team },
    KickPlayer { target: ParticipantId },
    SetMap { group: String },
}

impl PeerCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            PeerCommand::LoadScene { .. } => CommandKind::LoadScene,
            PeerCommand::SetTeam { .. } => CommandKind::SetTeam,
            PeerCommand::KickPlayer { .. } => CommandKind::KickPlayer,
            PeerCommand::SetMap { .. } => CommandKind::SetMap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    LoadScene,
    SetTeam,
    KickPlayer,
    SetMap,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::LoadScene => "load_scene",
            CommandKind::SetTeam => "set_team",
            CommandKind::KickPlayer => "kick_player",
            CommandKind::SetMap => "set_map",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    SceneRequested { group: String, changed: bool },
    TeamChanged { target: ParticipantId, outcome: UpdateOutcome },
    Kick { target: ParticipantId },
    MapChanged { group: String, changed: bool },
}

#[derive(Debug, Error)]
pub enum CommandRejected {
    #[error("sender {0} is not in the session")]
    UnknownSender(ParticipantId),
    #[error("{sender} is not the lobby leader")]
    NotLeader { sender: ParticipantId },
    #[error("{sender} may not change {target}")]
    NotPermitted {
        sender: ParticipantId,
        target: ParticipantId,
    },
    #[error("target {0} is not in the session")]
    UnknownTarget(ParticipantId),
    #[error("{sender} cannot kick themselves")]
    SelfKick { sender: ParticipantId },
    #[error("group {group} is not a {expected} group")]
    WrongCategory {
        group: String,
        expected: &'static str,
    },
    #[error("no handler registered for {0}")]
    Unregistered(CommandKind),
    #[error(transparent)]
    Scene(#[from] OrchestratorError),
}

pub type CommandHandler<C> =
    fn(&mut C, ParticipantId, PeerCommand) -> Result<CommandOutcome, CommandRejected>;

struct CommandSpec<C> {
    kind: CommandKind,
    help: &'static str,
    handler: CommandHandler<C>,
}

pub struct CommandTable<C> {
    specs: Vec<CommandSpec<C>>,
    lookup_by_kind: HashMap<CommandKind, usize>,
}

impl<C> Default for CommandTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for CommandTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.specs.iter().map(|spec| spec.kind))
            .finish()
    }
}

impl<C> CommandTable<C> {
    pub fn new() -> Self {
        Self {
            specs: Vec::new(),
            lookup_by_kind: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        kind: CommandKind,
        help: &'static str,
        handler: CommandHandler<C>,
    ) -> Result<(), String> {
        if self.lookup_by_kind.contains_key(&kind) {
            return Err(format!("duplicate command registration: {kind}"));
        }
        self.specs.push(CommandSpec {
            kind,
            help,
            handler,
        });
        self.lookup_by_kind.insert(kind, self.specs.len() - 1);
        Ok(())
    }

    fn lookup(&self, kind: CommandKind) -> Option<&CommandSpec<C>> {
        let index = self.lookup_by_kind.get(&kind)?;
        self.specs.get(*index)
    }

    pub fn dispatch(
        &self,
        context: &mut C,
        sender: ParticipantId,
        command: PeerCommand,
    ) -> Result<CommandOutcome, CommandRejected> {
        let kind = command.kind();
        let spec = self
            .lookup(kind)
            .ok_or(CommandRejected::Unregistered(kind))?;
        (spec.handler)(context, sender, command)
    }

    pub fn iter_specs_in_order(&self) -> impl Iterator<Item = (CommandKind, &'static str)> + '_ {
        self.specs.iter().map(|spec| (spec.kind, spec.help))
    }
}

pub(crate) fn session_commands() -> CommandTable<SessionState> {
    let mut table = CommandTable::new();
    table
        .register(
            CommandKind::LoadScene,
            "Load a replicated scene group",
            handle_load_scene,
        )
        .expect("built-in command registration should not fail");
    table
        .register(
            CommandKind::SetTeam,
            "Move a participant to a team",
            handle_set_team,
        )
        .expect("built-in command registration should not fail");
    table
        .register(
            CommandKind::KickPlayer,
            "Remove a participant from the session",
            handle_kick_player,
        )
        .expect("built-in command registration should not fail");
    table
        .register(
            CommandKind::SetMap,
            "Switch the gameplay map and reset the session",
            handle_set_map,
        )
        .expect("built-in command registration should not fail");
    table
}

fn handle_load_scene(
    state: &mut SessionState,
    sender: ParticipantId,
    command: PeerCommand,
) -> Result<CommandOutcome, CommandRejected> {
    let group = match command {
        PeerCommand::LoadScene { group } => group,
        other => return Err(CommandRejected::Unregistered(other.kind())),
    };
    state.require_leader(sender)?;
    let category = state.category_of(&group)?;
    if !category.is_replicated() {
        return Err(CommandRejected::WrongCategory {
            group,
            expected: "replicated",
        });
    }
    let changed = state.orchestrator.load_group(&group)?;
    Ok(CommandOutcome::SceneRequested { group, changed })
}

fn handle_set_team(
    state: &mut SessionState,
    sender: ParticipantId,
    command: PeerCommand,
) -> Result<CommandOutcome, CommandRejected> {
    let (target, team) = match command {
        PeerCommand::SetTeam { target, team } => (target, team),
        other => return Err(CommandRejected::Unregistered(other.kind())),
    };
    state.require_member(sender)?;
    if !state.roster.contains(target) {
        return Err(CommandRejected::UnknownTarget(target));
    }
    if target != sender && state.roster.lobby_leader() != Some(sender) {
        return Err(CommandRejected::NotPermitted { sender, target });
    }
    let outcome = state
        .roster
        .set_team(target, team, &state.rules)
        .map_err(|_| CommandRejected::UnknownTarget(target))?;
    if let UpdateOutcome::TeamChangeDenied(denied) = &outcome {
        debug!(sender = %sender, target = %target, error = %denied, "set_team_denied");
    }
    Ok(CommandOutcome::TeamChanged { target, outcome })
}

fn handle_kick_player(
    state: &mut SessionState,
    sender: ParticipantId,
    command: PeerCommand,
) -> Result<CommandOutcome, CommandRejected> {
    let target = match command {
        PeerCommand::KickPlayer { target } => target,
        other => return Err(CommandRejected::Unregistered(other.kind())),
    };
    state.require_leader(sender)?;
    if target == sender {
        return Err(CommandRejected::SelfKick { sender });
    }
    if !state.roster.contains(target) {
        return Err(CommandRejected::UnknownTarget(target));
    }
    Ok(CommandOutcome::Kick { target })
}

fn handle_set_map(
    state: &mut SessionState,
    sender: ParticipantId,
    command: PeerCommand,
) -> Result<CommandOutcome, CommandRejected> {
    let group = match command {
        PeerCommand::SetMap { group } => group,
        other => return Err(CommandRejected::Unregistered(other.kind())),
    };
    state.require_leader(sender)?;
    if state.category_of(&group)? != SceneCategory::Gameplay {
        return Err(CommandRejected::WrongCategory {
            group,
            expected: "Gameplay",
        });
    }
    let changed = state.change_map(&group)?;
    Ok(CommandOutcome::MapChanged { group, changed })
}
