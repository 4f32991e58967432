use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use session_engine::{
    encode_line, run_headless, Authority, CharacterId, Envelope, InstantBackend, JoinRequest,
    MetricsHandle, ParticipantId, RosterMirror, SceneGroupOrchestrator, ScriptedSceneLoader,
    SessionServer, SessionServices, StepOutcome, Team,
};
use tracing::{debug, error, info, warn};

use super::bootstrap::ServerWiring;
use super::demo::{PooledObjectFactory, RingSpawnPoints};

const HOST_ID: ParticipantId = ParticipantId(0);
const LOADER_POLLS_PER_CONTENT: u32 = 3;
const OBJECT_WARMUP_FRAMES: u64 = 2;

type DemoServer =
    SessionServer<ScriptedSceneLoader, RingSpawnPoints, PooledObjectFactory, InstantBackend>;

pub(crate) fn run(wiring: ServerWiring) -> ExitCode {
    let settings = wiring.config.session_settings();
    let services = SessionServices {
        loader: ScriptedSceneLoader::new(LOADER_POLLS_PER_CONTENT),
        spawn_points: RingSpawnPoints::new(12.0, 16, settings.rules.possible_team_count as u8),
        factory: PooledObjectFactory::new(OBJECT_WARMUP_FRAMES),
        backend: InstantBackend::new(),
    };
    let mut server = SessionServer::new(Arc::clone(&wiring.catalog), settings, services);
    for (kind, help) in server.command_help() {
        debug!(command = %kind, help, "peer_command_registered");
    }

    if let Err(err) = populate(&mut server, &wiring) {
        error!(error = %err, "startup_failed");
        return ExitCode::FAILURE;
    }

    // Local observer fed from the same stream a remote peer would receive.
    let mut observer = SceneGroupOrchestrator::new(
        Arc::clone(&wiring.catalog),
        Authority::Observer,
        settings.orchestrator,
    );
    let mut mirror = RosterMirror::new();
    let mut replication_failed = false;

    let mut loop_config = wiring.config.loop_config();
    loop_config.max_ticks = wiring.max_ticks;
    let metrics = MetricsHandle::default();
    let stop = AtomicBool::new(false);
    let mut announced_ready = false;

    let summary = run_headless(&loop_config, &metrics, &stop, |dt| {
        server.services_mut().factory.advance_frame();
        let report = server.tick(dt);
        for abort in &report.spawn.aborted {
            warn!(reason = %abort, "spawn_aborted");
        }
        for participant in &report.spawn.completed {
            let owner = server
                .scheduler()
                .materialized(*participant)
                .and_then(|handle| server.services().factory.owner(handle));
            debug!(participant = %participant, owner = ?owner, "participant_materialized");
        }

        let outbound = server.drain_outbound();
        if let Err(err) = forward(&outbound, &mut mirror, &mut observer) {
            error!(error = %err, "replication_failed");
            replication_failed = true;
            return StepOutcome::stop(server.gauges());
        }

        let all_spawned = server
            .roster()
            .records()
            .iter()
            .all(|record| server.scheduler().materialized(record.id).is_some());
        if !announced_ready && all_spawned && !server.orchestrator().is_busy_loading() {
            announced_ready = true;
            info!(
                participants = mirror.records().len(),
                leader = ?mirror.lobby_leader(),
                channel_counts = ?mirror.channel_counts(),
                "session_ready"
            );
        }

        StepOutcome::proceed(server.gauges())
    });

    server.end_session();
    info!(
        ticks = summary.ticks,
        dropped_backlog_ms = summary.dropped_backlog.as_millis() as u64,
        live_objects = server.services().factory.live_count(),
        pooled_objects = server.services().factory.pooled_count(),
        tps = metrics.snapshot().tps,
        "server_stopped"
    );

    if replication_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn populate(server: &mut DemoServer, wiring: &ServerWiring) -> Result<(), session_engine::SessionError> {
    server.set_map(&wiring.map)?;
    server.join(JoinRequest::new(HOST_ID, CharacterId::new("host"), "Host"))?;
    for (slot, name) in wiring.bots.iter().enumerate() {
        let team = if slot % 2 == 0 {
            Team::Squad(0)
        } else {
            Team::Squad(1)
        };
        server.add_bot(name.as_str(), team)?;
    }
    server.start_session();
    Ok(())
}

fn forward(
    outbound: &[Envelope],
    mirror: &mut RosterMirror,
    observer: &mut SceneGroupOrchestrator,
) -> Result<(), session_engine::ReplicationError> {
    for envelope in outbound {
        debug!(line = encode_line(envelope)?.as_str(), "replicated");
        mirror.apply(envelope, observer)?;
    }
    Ok(())
}
