use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod backend;
pub mod catalog;
pub mod channels;
pub mod commands;
pub mod config;
mod hashing;
pub mod loader;
pub mod metrics;
pub mod mirror;
pub mod mode;
pub mod orchestrator;
pub mod participant;
pub mod replication;
pub mod roster;
pub mod session;
pub mod spawn;
pub mod teams;
pub mod tick_loop;

pub use backend::{
    AccountBackend, BackendCall, BackendCalls, BackendPoll, BackendReport, InstantBackend, TicketId,
};
pub use catalog::{CatalogError, ContentRef, GroupIndex, SceneCategory, SceneGroup, SceneGroupCatalog};
pub use channels::{ChannelBalancer, ChannelCounts};
pub use commands::{CommandKind, CommandOutcome, CommandRejected, PeerCommand};
pub use config::{ConfigError, SessionConfig, CATALOG_ENV_VAR, CONFIG_ENV_VAR};
pub use loader::{ContentHandle, LoadFailure, LoadPoll, OpId, SceneLoader, ScriptedSceneLoader};
pub use metrics::{MetricsHandle, SessionGauges, TickMetricsSnapshot};
pub use mirror::RosterMirror;
pub use mode::{GameMode, GameModeId};
pub use orchestrator::{
    ActiveGroupSnapshot, Authority, GroupEvent, LoadDirection, OrchestratorConfig,
    OrchestratorError, SceneGroupOrchestrator,
};
pub use participant::{
    CharacterId, ChannelId, DisconnectReason, DisconnectedParticipantRecord, ParticipantId,
    ParticipantRecord,
};
pub use replication::{
    decode_line, encode_line, Envelope, ListEvent, Notification, ReplicationCursor,
    ReplicationError, ReplicationStream, SessionSnapshot, SyncPayload,
};
pub use roster::{AddOutcome, ParticipantRoster, RosterError, UpdateOutcome};
pub use session::{
    JoinOutcome, JoinRequest, SessionError, SessionServer, SessionServices, SessionSettings,
    TickReport,
};
pub use spawn::{
    ObjectHandle, ObjectTemplate, Pose, SpawnAbort, SpawnConfig, SpawnOrientation,
    SpawnPointProvider, SpawnReport, SpawnScheduler, WorldObjectFactory,
};
pub use teams::{can_hit, AdmissionDenied, MapRules, Team};
pub use tick_loop::{run_headless, LoopConfig, LoopControl, LoopSummary, StepOutcome};

pub const ROOT_ENV_VAR: &str = "SESSION_ROOT";

/// Catalog location relative to the server root.
const CATALOG_RELATIVE_PATH: &str = "assets/catalog.json";

#[derive(Debug, Clone)]
pub struct ServerPaths {
    pub root: PathBuf,
    pub default_catalog: PathBuf,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to read environment variable {var}: {source}")]
    EnvVar {
        var: &'static str,
        #[source]
        source: env::VarError,
    },
    #[error("failed to resolve current executable path: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("current executable path has no parent directory: {0}")]
    ExeHasNoParent(PathBuf),
    #[error("{env_var} points to {path}, which has no assets/catalog.json")]
    InvalidEnvRoot {
        path: PathBuf,
        env_var: &'static str,
    },
    #[error(
        "no directory above {start_dir} contains assets/catalog.json; \
set {env_var} to the server root"
    )]
    RootNotFound {
        start_dir: PathBuf,
        env_var: &'static str,
    },
}

/// The server root is the nearest directory holding the scene group catalog,
/// found from `SESSION_ROOT` or by walking up from the executable.
pub fn resolve_server_paths() -> Result<ServerPaths, StartupError> {
    let root = resolve_root()?;
    let default_catalog = root.join(CATALOG_RELATIVE_PATH);
    Ok(ServerPaths {
        root,
        default_catalog,
    })
}

fn resolve_root() -> Result<PathBuf, StartupError> {
    match env::var(ROOT_ENV_VAR) {
        Ok(value) => {
            let root = normalize_path(Path::new(&value));
            if is_server_root(&root) {
                Ok(root)
            } else {
                Err(StartupError::InvalidEnvRoot {
                    path: root,
                    env_var: ROOT_ENV_VAR,
                })
            }
        }
        Err(env::VarError::NotPresent) => {
            let exe = env::current_exe().map_err(StartupError::CurrentExe)?;
            let exe_dir = exe
                .parent()
                .ok_or_else(|| StartupError::ExeHasNoParent(exe.clone()))?;
            exe_dir
                .ancestors()
                .find(|candidate| is_server_root(candidate))
                .map(normalize_path)
                .ok_or_else(|| StartupError::RootNotFound {
                    start_dir: normalize_path(exe_dir),
                    env_var: ROOT_ENV_VAR,
                })
        }
        Err(source) => Err(StartupError::EnvVar {
            var: ROOT_ENV_VAR,
            source,
        }),
    }
}

fn is_server_root(path: &Path) -> bool {
    path.join(CATALOG_RELATIVE_PATH).is_file()
}

fn normalize_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
