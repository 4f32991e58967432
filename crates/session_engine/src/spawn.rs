use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mode::{GameMode, GameModeId};
use crate::participant::{ChannelId, DisconnectReason, ParticipantId};
use crate::roster::ParticipantRoster;
use crate::teams::Team;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectTemplate {
    Player,
    Bot,
    Spectator,
}

impl ObjectTemplate {
    pub fn for_participant(id: ParticipantId, team: Team) -> Self {
        if team == Team::Spectator {
            ObjectTemplate::Spectator
        } else if id.is_bot() {
            ObjectTemplate::Bot
        } else {
            ObjectTemplate::Player
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pose {
    pub position: [f32; 3],
    pub yaw_degrees: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpawnOrientation {
    pub found: bool,
    pub pose: Pose,
}

pub trait SpawnPointProvider {
    fn get_spawn_orientation(
        &mut self,
        mode: &GameModeId,
        team: Team,
        channel: Option<ChannelId>,
    ) -> SpawnOrientation;

    fn get_respawn_orientation(
        &mut self,
        mode: &GameModeId,
        team: Team,
        participant: ParticipantId,
    ) -> SpawnOrientation;
}

/// Pooled allocator of world objects. `spawn` may hand back an object that
/// only becomes ready on a later tick.
pub trait WorldObjectFactory {
    fn spawn(&mut self, template: ObjectTemplate, participant: ParticipantId, pose: Pose)
        -> ObjectHandle;
    fn is_ready(&self, handle: ObjectHandle) -> bool;
    fn despawn(&mut self, handle: ObjectHandle);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnConfig {
    pub timeout: Duration,
    pub spawn_point_wait: Duration,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            spawn_point_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnKind {
    Initial,
    Respawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnRequest {
    pub participant: ParticipantId,
    pub kind: SpawnKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpawnAbort {
    #[error("spawn of {participant} timed out after {elapsed:?}")]
    Timeout {
        participant: ParticipantId,
        elapsed: Duration,
    },
    #[error("spawn of {participant} was cancelled")]
    Cancelled { participant: ParticipantId },
}

impl SpawnAbort {
    pub fn participant(&self) -> ParticipantId {
        match self {
            SpawnAbort::Timeout { participant, .. } | SpawnAbort::Cancelled { participant } => {
                *participant
            }
        }
    }
}

/// Per-tick inputs from the rest of the session.
#[derive(Debug, Clone, Copy)]
pub struct SpawnGate<'a> {
    pub mode: &'a GameMode,
    pub loading_busy: bool,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SpawnReport {
    pub started: Vec<ParticipantId>,
    pub completed: Vec<ParticipantId>,
    pub aborted: Vec<SpawnAbort>,
    pub drained: Vec<ParticipantId>,
    pub disconnects: Vec<(ParticipantId, DisconnectReason)>,
}

impl SpawnReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.completed.is_empty()
            && self.aborted.is_empty()
            && self.drained.is_empty()
            && self.disconnects.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum SpawnPhase {
    AcquiringPoint { waited: Duration },
    Materializing { handle: ObjectHandle },
}

#[derive(Debug, Clone, Copy)]
struct QueuedSpawn {
    request: SpawnRequest,
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct RunningSpawn {
    request: SpawnRequest,
    generation: u64,
    elapsed: Duration,
    phase: SpawnPhase,
}

#[derive(Debug, Clone, Copy)]
struct MaterializedObject {
    handle: ObjectHandle,
    generation: u64,
}

/// Single-flight spawn queue. The queue together with the running slot is the
/// only way a participant gets materialised.
///
/// Every enqueue gets a fresh generation. A cancellation only tears down work
/// enqueued before it, so a participant that leaves and rejoins under the same
/// id keeps its new spawn.
#[derive(Debug)]
pub struct SpawnScheduler {
    config: SpawnConfig,
    queue: VecDeque<QueuedSpawn>,
    running: Option<RunningSpawn>,
    next_generation: u64,
    /// Participant to the first generation that survives the cancellation.
    pending_cancellations: HashMap<ParticipantId, u64>,
    materialized: HashMap<ParticipantId, MaterializedObject>,
}

impl SpawnScheduler {
    pub fn new(config: SpawnConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            running: None,
            next_generation: 0,
            pending_cancellations: HashMap::new(),
            materialized: HashMap::new(),
        }
    }

    /// Returns `false` when the participant is already queued or spawning.
    pub fn enqueue(&mut self, request: SpawnRequest) -> bool {
        let participant = request.participant;
        let live = |generation: u64| !self.is_cancelled(participant, generation);
        let running = self.running.is_some_and(|running| {
            running.request.participant == participant && live(running.generation)
        });
        let queued = self
            .queue
            .iter()
            .any(|queued| queued.request.participant == participant && live(queued.generation));
        if running || queued {
            debug!(participant = %participant, "spawn_enqueue_ignored_duplicate");
            return false;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        self.queue.push_back(QueuedSpawn { request, generation });
        debug!(participant = %participant, kind = ?request.kind, queued = self.queue.len(), "spawn_enqueued");
        true
    }

    /// Teardown happens on the next tick and covers everything enqueued for
    /// `participant` so far.
    pub fn cancel(&mut self, participant: ParticipantId) {
        self.pending_cancellations
            .insert(participant, self.next_generation);
    }

    fn is_cancelled(&self, participant: ParticipantId, generation: u64) -> bool {
        self.pending_cancellations
            .get(&participant)
            .is_some_and(|cutoff| generation < *cutoff)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn running_participant(&self) -> Option<ParticipantId> {
        self.running.map(|running| running.request.participant)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn materialized(&self, participant: ParticipantId) -> Option<ObjectHandle> {
        self.materialized.get(&participant).map(|object| object.handle)
    }

    pub fn tick<P, F>(
        &mut self,
        dt: Duration,
        gate: SpawnGate<'_>,
        roster: &ParticipantRoster,
        points: &mut P,
        factory: &mut F,
    ) -> SpawnReport
    where
        P: SpawnPointProvider + ?Sized,
        F: WorldObjectFactory + ?Sized,
    {
        let mut report = SpawnReport::default();
        self.process_cancellations(roster, factory, &mut report);

        if let Some(mut running) = self.running.take() {
            running.elapsed = running.elapsed.saturating_add(dt);
            if let SpawnPhase::AcquiringPoint { waited } = &mut running.phase {
                *waited = waited.saturating_add(dt);
            }
            self.running = self.advance(running, gate, roster, points, factory, &mut report);
        }

        if !gate.mode.spawning_allowed {
            if !self.queue.is_empty() {
                report
                    .drained
                    .extend(self.queue.drain(..).map(|queued| queued.request.participant));
                info!(mode = %gate.mode.id, drained = report.drained.len(), "spawn_queue_drained");
            }
            return report;
        }
        if self.running.is_some() {
            return report;
        }
        if gate.loading_busy {
            if !self.queue.is_empty() {
                debug!(queued = self.queue.len(), "spawn_waiting_for_loads");
            }
            return report;
        }

        while let Some(QueuedSpawn { request, generation }) = self.queue.pop_front() {
            if !roster.contains(request.participant) {
                continue;
            }
            report.started.push(request.participant);
            info!(participant = %request.participant, kind = ?request.kind, "spawn_started");
            let running = RunningSpawn {
                request,
                generation,
                elapsed: Duration::ZERO,
                phase: SpawnPhase::AcquiringPoint {
                    waited: Duration::ZERO,
                },
            };
            self.running = self.advance(running, gate, roster, points, factory, &mut report);
            break;
        }
        report
    }

    fn process_cancellations<F>(
        &mut self,
        roster: &ParticipantRoster,
        factory: &mut F,
        report: &mut SpawnReport,
    ) where
        F: WorldObjectFactory + ?Sized,
    {
        let mut cutoffs = std::mem::take(&mut self.pending_cancellations);
        let departed = self
            .queue
            .iter()
            .map(|queued| queued.request.participant)
            .chain(self.running.map(|running| running.request.participant))
            .chain(self.materialized.keys().copied())
            .filter(|id| !roster.contains(*id))
            .collect::<Vec<_>>();
        for participant in departed {
            cutoffs.insert(participant, u64::MAX);
        }
        let mut cancelled = cutoffs.into_iter().collect::<Vec<_>>();
        cancelled.sort_unstable();

        for (participant, cutoff) in cancelled {
            let stale = |id: ParticipantId, generation: u64| id == participant && generation < cutoff;
            let before = self.queue.len();
            self.queue
                .retain(|queued| !stale(queued.request.participant, queued.generation));
            let mut was_pending = self.queue.len() != before;

            if self
                .running
                .is_some_and(|running| stale(running.request.participant, running.generation))
            {
                if let Some(RunningSpawn {
                    phase: SpawnPhase::Materializing { handle },
                    ..
                }) = self.running.take()
                {
                    factory.despawn(handle);
                }
                was_pending = true;
            }
            if self
                .materialized
                .get(&participant)
                .is_some_and(|object| object.generation < cutoff)
            {
                if let Some(object) = self.materialized.remove(&participant) {
                    factory.despawn(object.handle);
                }
            }
            if was_pending {
                info!(participant = %participant, "spawn_cancelled");
                report.aborted.push(SpawnAbort::Cancelled { participant });
            }
        }
    }

    fn advance<P, F>(
        &mut self,
        mut running: RunningSpawn,
        gate: SpawnGate<'_>,
        roster: &ParticipantRoster,
        points: &mut P,
        factory: &mut F,
        report: &mut SpawnReport,
    ) -> Option<RunningSpawn>
    where
        P: SpawnPointProvider + ?Sized,
        F: WorldObjectFactory + ?Sized,
    {
        let participant = running.request.participant;
        if running.elapsed > self.config.timeout {
            if let SpawnPhase::Materializing { handle } = running.phase {
                factory.despawn(handle);
            }
            warn!(participant = %participant, elapsed_ms = running.elapsed.as_millis() as u64, "spawn_timed_out");
            report.aborted.push(SpawnAbort::Timeout {
                participant,
                elapsed: running.elapsed,
            });
            if participant.is_connected_client() && roster.contains(participant) {
                report
                    .disconnects
                    .push((participant, DisconnectReason::SpawnTimedOut));
            }
            return None;
        }

        match running.phase {
            SpawnPhase::AcquiringPoint { waited } => {
                let record = roster.get(participant)?;
                let orientation = match running.request.kind {
                    SpawnKind::Initial => {
                        points.get_spawn_orientation(&gate.mode.id, record.team, record.channel)
                    }
                    SpawnKind::Respawn => {
                        points.get_respawn_orientation(&gate.mode.id, record.team, participant)
                    }
                };
                let waited_out = waited >= self.config.spawn_point_wait;
                if !orientation.found && !record.team.is_neutral() && !waited_out {
                    debug!(participant = %participant, "spawn_point_retry");
                    return Some(running);
                }
                if !orientation.found {
                    debug!(participant = %participant, waited_out, "spawn_point_fallback");
                }
                if running.request.kind == SpawnKind::Respawn {
                    if let Some(previous) = self.materialized.remove(&participant) {
                        factory.despawn(previous.handle);
                    }
                }
                let template = ObjectTemplate::for_participant(participant, record.team);
                let handle = factory.spawn(template, participant, orientation.pose);
                running.phase = SpawnPhase::Materializing { handle };
                Some(running)
            }
            SpawnPhase::Materializing { handle } => {
                if !factory.is_ready(handle) {
                    return Some(running);
                }
                let object = MaterializedObject {
                    handle,
                    generation: running.generation,
                };
                if let Some(previous) = self.materialized.insert(participant, object) {
                    if previous.handle != handle {
                        factory.despawn(previous.handle);
                    }
                }
                report.completed.push(participant);
                info!(participant = %participant, elapsed_ms = running.elapsed.as_millis() as u64, "spawn_completed");
                None
            }
        }
    }
}
