use std::collections::HashMap;

use session_engine::{
    ChannelId, GameModeId, ObjectHandle, ObjectTemplate, ParticipantId, Pose, SpawnOrientation,
    SpawnPointProvider, Team, WorldObjectFactory,
};
use tracing::debug;

/// Spawn points laid out on a ring around the map origin. Neutral teams share
/// the ring; each squad owns one point.
pub(crate) struct RingSpawnPoints {
    radius: f32,
    slots: u32,
    squad_points: u8,
    next_slot: u32,
}

impl RingSpawnPoints {
    pub(crate) fn new(radius: f32, slots: u32, squad_points: u8) -> Self {
        Self {
            radius,
            slots: slots.max(1),
            squad_points,
            next_slot: 0,
        }
    }

    fn pose_at(&self, slot: u32) -> Pose {
        let angle = (slot % self.slots) as f32 / self.slots as f32 * std::f32::consts::TAU;
        Pose {
            position: [self.radius * angle.cos(), 0.0, self.radius * angle.sin()],
            yaw_degrees: (angle.to_degrees() + 180.0) % 360.0,
        }
    }

    fn squad_point(&self, team: Team) -> Option<Pose> {
        match team {
            Team::Squad(squad) if squad < self.squad_points => {
                let spread = self.slots / u32::from(self.squad_points.max(1));
                Some(self.pose_at(u32::from(squad) * spread))
            }
            _ => None,
        }
    }
}

impl SpawnPointProvider for RingSpawnPoints {
    fn get_spawn_orientation(
        &mut self,
        _mode: &GameModeId,
        team: Team,
        channel: Option<ChannelId>,
    ) -> SpawnOrientation {
        if let Team::Squad(_) = team {
            return match self.squad_point(team) {
                Some(pose) => SpawnOrientation { found: true, pose },
                None => SpawnOrientation::default(),
            };
        }
        let offset = channel.map(|channel| u32::from(channel.0)).unwrap_or(0);
        let slot = self.next_slot.wrapping_add(offset);
        self.next_slot = self.next_slot.wrapping_add(1);
        SpawnOrientation {
            found: true,
            pose: self.pose_at(slot),
        }
    }

    fn get_respawn_orientation(
        &mut self,
        _mode: &GameModeId,
        team: Team,
        participant: ParticipantId,
    ) -> SpawnOrientation {
        if let Some(pose) = self.squad_point(team) {
            return SpawnOrientation { found: true, pose };
        }
        SpawnOrientation {
            found: !matches!(team, Team::Squad(_)),
            pose: self.pose_at(participant.0.unsigned_abs() as u32),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveObject {
    template: ObjectTemplate,
    participant: ParticipantId,
    ready_at: u64,
}

/// Object pool keyed by template. A fresh or recycled object becomes ready
/// `warmup_frames` frames after it is handed out.
pub(crate) struct PooledObjectFactory {
    warmup_frames: u64,
    frame: u64,
    next_handle: u64,
    free: HashMap<ObjectTemplate, Vec<ObjectHandle>>,
    live: HashMap<ObjectHandle, LiveObject>,
}

impl PooledObjectFactory {
    pub(crate) fn new(warmup_frames: u64) -> Self {
        Self {
            warmup_frames,
            frame: 0,
            next_handle: 1,
            free: HashMap::new(),
            live: HashMap::new(),
        }
    }

    pub(crate) fn advance_frame(&mut self) {
        self.frame = self.frame.saturating_add(1);
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn pooled_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    pub(crate) fn owner(&self, handle: ObjectHandle) -> Option<ParticipantId> {
        self.live.get(&handle).map(|object| object.participant)
    }
}

impl WorldObjectFactory for PooledObjectFactory {
    fn spawn(
        &mut self,
        template: ObjectTemplate,
        participant: ParticipantId,
        pose: Pose,
    ) -> ObjectHandle {
        let recycled = self.free.get_mut(&template).and_then(Vec::pop);
        let handle = recycled.unwrap_or_else(|| {
            let handle = ObjectHandle(self.next_handle);
            self.next_handle += 1;
            handle
        });
        debug!(
            participant = %participant,
            template = ?template,
            handle = handle.0,
            recycled = recycled.is_some(),
            x = pose.position[0],
            z = pose.position[2],
            "object_spawned"
        );
        self.live.insert(
            handle,
            LiveObject {
                template,
                participant,
                ready_at: self.frame.saturating_add(self.warmup_frames),
            },
        );
        handle
    }

    fn is_ready(&self, handle: ObjectHandle) -> bool {
        self.live
            .get(&handle)
            .is_some_and(|object| self.frame >= object.ready_at)
    }

    fn despawn(&mut self, handle: ObjectHandle) {
        if let Some(object) = self.live.remove(&handle) {
            debug!(participant = %object.participant, handle = handle.0, "object_despawned");
            self.free.entry(object.template).or_default().push(handle);
        }
    }
}
