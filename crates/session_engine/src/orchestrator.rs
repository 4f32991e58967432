use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogError, ContentRef, GroupIndex, SceneCategory, SceneGroupCatalog};
use crate::loader::{ContentHandle, LoadFailure, LoadPoll, OpId, SceneLoader};
use crate::replication::{ListEvent, ReplicationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Server,
    Observer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDirection {
    Load,
    Unload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Requested,
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Loaded(GroupIndex),
    Unloaded(GroupIndex),
    Failed {
        group: GroupIndex,
        direction: LoadDirection,
        failure: LoadFailure,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveGroupSnapshot {
    pub fingerprint: String,
    pub indices: Vec<GroupIndex>,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("only the server may change replicated group {group}")]
    NotAuthorized { group: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorConfig {
    pub stall_timeout: Duration,
    pub retry_limit: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(30),
            retry_limit: 1,
        }
    }
}

#[derive(Debug)]
struct LoadOperation {
    group: GroupIndex,
    direction: LoadDirection,
    state: LoadState,
    step: usize,
    current: Option<OpId>,
    handles: Vec<ContentHandle>,
    elapsed: Duration,
    attempts: u32,
}

impl LoadOperation {
    fn new(group: GroupIndex, direction: LoadDirection) -> Self {
        Self {
            group,
            direction,
            state: LoadState::Requested,
            step: 0,
            current: None,
            handles: Vec::new(),
            elapsed: Duration::ZERO,
            attempts: 0,
        }
    }

    fn unload_handles(group: GroupIndex, handles: Vec<ContentHandle>) -> Self {
        Self {
            handles,
            ..Self::new(group, LoadDirection::Unload)
        }
    }
}

enum HeadProgress {
    Waiting,
    Finished(GroupEvent),
}

/// Decides which scene groups are active and drives the loader towards that
/// set. The replicated active list is intent: it changes when a request is
/// accepted, and the queue of load operations catches the loader up.
#[derive(Debug)]
pub struct SceneGroupOrchestrator {
    catalog: Arc<SceneGroupCatalog>,
    authority: Authority,
    config: OrchestratorConfig,
    active: Vec<GroupIndex>,
    local_active: Option<GroupIndex>,
    loaded: HashMap<GroupIndex, Vec<ContentHandle>>,
    active_environment: Option<GroupIndex>,
    queue: VecDeque<LoadOperation>,
    outbox: Vec<ListEvent<GroupIndex>>,
}

impl SceneGroupOrchestrator {
    pub fn new(
        catalog: Arc<SceneGroupCatalog>,
        authority: Authority,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            catalog,
            authority,
            config,
            active: Vec::new(),
            local_active: None,
            loaded: HashMap::new(),
            active_environment: None,
            queue: VecDeque::new(),
            outbox: Vec::new(),
        }
    }

    pub fn catalog(&self) -> &SceneGroupCatalog {
        &self.catalog
    }

    /// Returns `Ok(false)` when the group is already active or already loading.
    pub fn load_group(&mut self, name: &str) -> Result<bool, OrchestratorError> {
        let (index, category) = self.resolve(name)?;
        self.ensure_authority(name, category)?;
        if self.is_index_active(index) || self.latest_direction(index) == Some(LoadDirection::Load) {
            debug!(group = name, "group_load_already_active");
            return Ok(false);
        }

        if category.is_replicated() {
            for other in self.active.clone() {
                self.deactivate_replicated(other);
            }
        }
        if let Some(local) = self.local_active {
            self.deactivate_local(local);
        }

        if category.is_replicated() {
            self.active.push(index);
            self.publish(ListEvent::Add(index));
        } else {
            self.local_active = Some(index);
        }
        self.queue
            .push_back(LoadOperation::new(index, LoadDirection::Load));
        info!(group = name, category = category.label(), "group_load_requested");
        Ok(true)
    }

    /// Returns `Ok(false)` when the group was not active.
    pub fn unload_group(&mut self, name: &str) -> Result<bool, OrchestratorError> {
        let (index, category) = self.resolve(name)?;
        self.ensure_authority(name, category)?;
        if !self.is_index_active(index) {
            return Ok(false);
        }
        if category.is_replicated() {
            self.deactivate_replicated(index);
        } else {
            self.deactivate_local(index);
        }
        info!(group = name, "group_unload_requested");
        Ok(true)
    }

    pub fn tick<L: SceneLoader + ?Sized>(&mut self, loader: &mut L, dt: Duration) -> Vec<GroupEvent> {
        let mut events = Vec::new();
        loop {
            let Some(state) = self.queue.front().map(|head| head.state) else {
                break;
            };
            let progress = match state {
                LoadState::Requested => self.start_head(loader),
                LoadState::InFlight => self.poll_head(loader, dt),
            };
            match progress {
                HeadProgress::Waiting => break,
                HeadProgress::Finished(event) => {
                    let Some(finished) = self.queue.pop_front() else {
                        break;
                    };
                    self.finish(finished, &event, loader);
                    events.push(event);
                }
            }
        }
        events
    }

    pub fn is_busy_loading(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn pending_operations(&self) -> usize {
        self.queue.len()
    }

    pub fn is_group_active(&self, name: &str) -> bool {
        self.catalog
            .index_of(name)
            .map(|index| self.is_index_active(index))
            .unwrap_or(false)
    }

    pub fn is_group_loaded(&self, name: &str) -> bool {
        self.catalog
            .index_of(name)
            .map(|index| self.loaded.contains_key(&index))
            .unwrap_or(false)
    }

    pub fn active_groups(&self) -> &[GroupIndex] {
        &self.active
    }

    pub fn active_local_group(&self) -> Option<GroupIndex> {
        self.local_active
    }

    pub fn active_environment(&self) -> Option<GroupIndex> {
        self.active_environment
    }

    pub fn take_replication_events(&mut self) -> Vec<ListEvent<GroupIndex>> {
        std::mem::take(&mut self.outbox)
    }

    pub fn snapshot(&self) -> ActiveGroupSnapshot {
        ActiveGroupSnapshot {
            fingerprint: self.catalog.fingerprint().to_string(),
            indices: self.active.clone(),
        }
    }

    /// Observer side of the active-group list. Schedules the loads and unloads
    /// that bring this peer to the server's set.
    pub fn apply_remote(&mut self, event: ListEvent<GroupIndex>) -> Result<(), ReplicationError> {
        match event {
            ListEvent::Add(index) => {
                self.check_index(index)?;
                self.activate_remote(index);
            }
            ListEvent::Remove(position) => {
                let index = self.active_at(position)?;
                self.deactivate_replicated(index);
            }
            ListEvent::Update(position, index) => {
                self.check_index(index)?;
                let previous = self.active_at(position)?;
                if previous != index {
                    self.active[position] = index;
                    self.schedule_unload(previous);
                    self.queue
                        .push_back(LoadOperation::new(index, LoadDirection::Load));
                }
            }
            ListEvent::Clear => {
                for index in self.active.clone() {
                    self.deactivate_replicated(index);
                }
            }
            ListEvent::Value(_) => {
                return Err(ReplicationError::UnsupportedEvent {
                    topic: "active_groups",
                })
            }
        }
        self.outbox.clear();
        Ok(())
    }

    pub fn apply_snapshot(&mut self, snapshot: &ActiveGroupSnapshot) -> Result<(), ReplicationError> {
        if snapshot.fingerprint != self.catalog.fingerprint() {
            return Err(ReplicationError::CatalogMismatch {
                local: self.catalog.fingerprint().to_string(),
                remote: snapshot.fingerprint.clone(),
            });
        }
        for index in &snapshot.indices {
            self.check_index(*index)?;
        }
        for index in self.active.clone() {
            if !snapshot.indices.contains(&index) {
                self.deactivate_replicated(index);
            }
        }
        for index in &snapshot.indices {
            if !self.active.contains(index) {
                self.activate_remote(*index);
            }
        }
        self.outbox.clear();
        Ok(())
    }

    fn activate_remote(&mut self, index: GroupIndex) {
        if self.active.contains(&index) {
            return;
        }
        if let Some(local) = self.local_active {
            self.deactivate_local(local);
        }
        self.active.push(index);
        self.queue
            .push_back(LoadOperation::new(index, LoadDirection::Load));
    }

    fn resolve(&self, name: &str) -> Result<(GroupIndex, SceneCategory), OrchestratorError> {
        let index = self.catalog.index_of(name)?;
        let category = self
            .catalog
            .group(index)
            .map(|group| group.category)
            .ok_or_else(|| CatalogError::UnknownGroup {
                name: name.to_string(),
            })?;
        Ok((index, category))
    }

    fn ensure_authority(&self, name: &str, category: SceneCategory) -> Result<(), OrchestratorError> {
        if category.is_replicated() && self.authority != Authority::Server {
            warn!(group = name, "group_request_not_authorized");
            return Err(OrchestratorError::NotAuthorized {
                group: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_index(&self, index: GroupIndex) -> Result<(), ReplicationError> {
        if index.index() >= self.catalog.len() {
            return Err(ReplicationError::UnknownIndex {
                index: index.index(),
                len: self.catalog.len(),
            });
        }
        Ok(())
    }

    fn active_at(&self, position: usize) -> Result<GroupIndex, ReplicationError> {
        self.active
            .get(position)
            .copied()
            .ok_or(ReplicationError::UnknownIndex {
                index: position,
                len: self.active.len(),
            })
    }

    fn is_index_active(&self, index: GroupIndex) -> bool {
        self.active.contains(&index) || self.local_active == Some(index)
    }

    /// Direction of the last queued operation for `index`; that is where the
    /// group ends up once the queue drains.
    fn latest_direction(&self, index: GroupIndex) -> Option<LoadDirection> {
        self.queue
            .iter()
            .rev()
            .find(|op| op.group == index)
            .map(|op| op.direction)
    }

    fn deactivate_replicated(&mut self, index: GroupIndex) {
        if let Some(position) = self.active.iter().position(|active| *active == index) {
            self.active.remove(position);
            self.publish(ListEvent::Remove(position));
        }
        self.schedule_unload(index);
    }

    fn deactivate_local(&mut self, index: GroupIndex) {
        if self.local_active == Some(index) {
            self.local_active = None;
        }
        self.schedule_unload(index);
    }

    fn schedule_unload(&mut self, index: GroupIndex) {
        // A load that never started can simply be dropped.
        if let Some(position) = self.queue.iter().position(|op| {
            op.group == index
                && op.direction == LoadDirection::Load
                && op.state == LoadState::Requested
        }) {
            self.queue.remove(position);
            return;
        }
        if self.latest_direction(index) == Some(LoadDirection::Unload) {
            return;
        }
        self.queue
            .push_back(LoadOperation::new(index, LoadDirection::Unload));
    }

    fn publish(&mut self, event: ListEvent<GroupIndex>) {
        if self.authority == Authority::Server {
            self.outbox.push(event);
        }
    }

    fn content_len(&self, group: GroupIndex) -> usize {
        self.catalog
            .group(group)
            .map(|group| group.content.len())
            .unwrap_or(0)
    }

    fn start_head<L: SceneLoader + ?Sized>(&mut self, loader: &mut L) -> HeadProgress {
        let Some(head) = self.queue.front_mut() else {
            return HeadProgress::Waiting;
        };
        if head.direction == LoadDirection::Unload && head.handles.is_empty() {
            head.handles = self.loaded.remove(&head.group).unwrap_or_default();
            if self.active_environment == Some(head.group) {
                self.active_environment = None;
            }
        }
        head.state = LoadState::InFlight;
        self.issue_step(loader)
    }

    fn issue_step<L: SceneLoader + ?Sized>(&mut self, loader: &mut L) -> HeadProgress {
        let group_len = match self.queue.front() {
            Some(head) => self.content_len(head.group),
            None => return HeadProgress::Waiting,
        };
        let catalog = Arc::clone(&self.catalog);
        let Some(head) = self.queue.front_mut() else {
            return HeadProgress::Waiting;
        };
        head.elapsed = Duration::ZERO;
        match head.direction {
            LoadDirection::Load => {
                if head.step >= group_len {
                    return HeadProgress::Finished(GroupEvent::Loaded(head.group));
                }
                let Some(content) = catalog
                    .group(head.group)
                    .and_then(|group| group.content.get(head.step))
                else {
                    return HeadProgress::Finished(GroupEvent::Loaded(head.group));
                };
                head.current = Some(loader.load_async(content));
            }
            LoadDirection::Unload => {
                let Some(handle) = head.handles.get(head.step).copied() else {
                    return HeadProgress::Finished(GroupEvent::Unloaded(head.group));
                };
                head.current = Some(loader.unload_async(handle));
            }
        }
        HeadProgress::Waiting
    }

    fn poll_head<L: SceneLoader + ?Sized>(&mut self, loader: &mut L, dt: Duration) -> HeadProgress {
        let stall_timeout = self.config.stall_timeout;
        let Some(head) = self.queue.front_mut() else {
            return HeadProgress::Waiting;
        };
        let Some(op) = head.current else {
            return self.issue_step(loader);
        };
        head.elapsed = head.elapsed.saturating_add(dt);
        match loader.poll(op) {
            LoadPoll::Pending => {
                let elapsed = head.elapsed;
                if elapsed > stall_timeout {
                    let failure =
                        self.step_failure(format!("stalled for {:.1}s", elapsed.as_secs_f32()));
                    return self.retry_or_fail(loader, failure);
                }
                HeadProgress::Waiting
            }
            LoadPoll::Loaded(handle) => {
                head.handles.push(handle);
                head.step += 1;
                head.current = None;
                head.attempts = 0;
                self.issue_step(loader)
            }
            LoadPoll::Unloaded => {
                head.step += 1;
                head.current = None;
                head.attempts = 0;
                self.issue_step(loader)
            }
            LoadPoll::Failed(failure) => self.retry_or_fail(loader, failure),
        }
    }

    fn step_failure(&self, reason: String) -> LoadFailure {
        let content = self
            .queue
            .front()
            .and_then(|head| {
                self.catalog
                    .group(head.group)
                    .and_then(|group| group.content.get(head.step))
                    .cloned()
            })
            .unwrap_or_else(|| ContentRef::new("<unload>"));
        LoadFailure { content, reason }
    }

    fn retry_or_fail<L: SceneLoader + ?Sized>(
        &mut self,
        loader: &mut L,
        failure: LoadFailure,
    ) -> HeadProgress {
        let retry_limit = self.config.retry_limit;
        let Some(head) = self.queue.front_mut() else {
            return HeadProgress::Waiting;
        };
        head.current = None;
        if head.attempts < retry_limit {
            head.attempts += 1;
            warn!(
                group = head.group.0,
                attempt = head.attempts,
                error = %failure,
                "group_step_retry"
            );
            return self.issue_step(loader);
        }
        HeadProgress::Finished(GroupEvent::Failed {
            group: head.group,
            direction: head.direction,
            failure,
        })
    }

    fn finish<L: SceneLoader + ?Sized>(
        &mut self,
        op: LoadOperation,
        event: &GroupEvent,
        loader: &mut L,
    ) {
        let name = self
            .catalog
            .group(op.group)
            .map(|group| group.name.clone())
            .unwrap_or_default();
        match event {
            GroupEvent::Loaded(index) => {
                let category = self.catalog.group(*index).map(|group| group.category);
                if category == Some(SceneCategory::Environment) {
                    if let Some(first) = op.handles.first().copied() {
                        if loader.active_context() != Some(first) {
                            loader.activate(first);
                        }
                        self.active_environment = Some(*index);
                    }
                }
                self.loaded.insert(*index, op.handles);
                info!(group = %name, "group_loaded");
            }
            GroupEvent::Unloaded(_) => {
                info!(group = %name, "group_unloaded");
            }
            GroupEvent::Failed {
                group,
                direction,
                failure,
            } => {
                error!(group = %name, direction = ?direction, error = %failure, "group_operation_failed");
                if *direction == LoadDirection::Load {
                    let superseded = self.latest_direction(*group) == Some(LoadDirection::Load);
                    if !superseded && self.authority == Authority::Server {
                        if let Some(position) = self.active.iter().position(|a| a == group) {
                            self.active.remove(position);
                            self.publish(ListEvent::Remove(position));
                        }
                    }
                    if !superseded && self.local_active == Some(*group) {
                        self.local_active = None;
                    }
                    if !op.handles.is_empty() {
                        self.queue
                            .push_back(LoadOperation::unload_handles(*group, op.handles));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SceneGroup;
    use crate::loader::{LoaderCall, ScriptedSceneLoader};
    use crate::replication::apply_list_event;

    const DT: Duration = Duration::from_millis(100);

    fn sample_catalog() -> Arc<SceneGroupCatalog> {
        let group = |name: &str, category, content: &[&str]| SceneGroup {
            name: name.to_string(),
            category,
            content: content.iter().map(|c| ContentRef::new(*c)).collect(),
        };
        Arc::new(
            SceneGroupCatalog::from_groups(vec![
                group("MainMenu", SceneCategory::LocalUi, &["ui/main"]),
                group("Settings", SceneCategory::LocalUi, &["ui/settings"]),
                group("Lobby", SceneCategory::SynchronizedUi, &["ui/lobby"]),
                group("MapA", SceneCategory::Gameplay, &["maps/a", "maps/a_props"]),
                group("MapB", SceneCategory::Gameplay, &["maps/b"]),
                group("Sky", SceneCategory::Environment, &["env/sky", "env/fog"]),
            ])
            .expect("catalog"),
        )
    }

    fn server() -> SceneGroupOrchestrator {
        SceneGroupOrchestrator::new(sample_catalog(), Authority::Server, OrchestratorConfig::default())
    }

    fn settle(
        orchestrator: &mut SceneGroupOrchestrator,
        loader: &mut ScriptedSceneLoader,
    ) -> Vec<GroupEvent> {
        let mut events = Vec::new();
        for _ in 0..64 {
            events.extend(orchestrator.tick(loader, DT));
            if !orchestrator.is_busy_loading() {
                break;
            }
        }
        events
    }

    #[test]
    fn loading_second_map_unloads_the_first() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(1);

        assert!(orchestrator.load_group("MapA").expect("MapA"));
        settle(&mut orchestrator, &mut loader);
        assert!(orchestrator.is_group_loaded("MapA"));
        assert!(loader.is_loaded(&ContentRef::new("maps/a_props")));

        assert!(orchestrator.load_group("MapB").expect("MapB"));
        let events = settle(&mut orchestrator, &mut loader);

        let map_b = orchestrator.catalog().index_of("MapB").expect("index");
        assert_eq!(orchestrator.active_groups(), &[map_b]);
        assert!(!orchestrator.is_group_loaded("MapA"));
        assert!(orchestrator.is_group_loaded("MapB"));
        assert!(!loader.is_loaded(&ContentRef::new("maps/a")));
        assert!(!loader.is_loaded(&ContentRef::new("maps/a_props")));
        assert!(events.contains(&GroupEvent::Unloaded(GroupIndex(3))));
        assert!(events.contains(&GroupEvent::Loaded(map_b)));
    }

    #[test]
    fn at_most_one_replicated_group_is_active() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(1);
        for name in ["Lobby", "MapA", "Sky", "MapB"] {
            orchestrator.load_group(name).expect("load");
            assert_eq!(orchestrator.active_groups().len(), 1);
        }
        settle(&mut orchestrator, &mut loader);
        assert_eq!(loader.loaded_count(), 1);
        assert!(orchestrator.is_group_loaded("MapB"));
    }

    #[test]
    fn repeated_request_is_idempotent() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(3);
        assert!(orchestrator.load_group("MapA").expect("first"));
        orchestrator.tick(&mut loader, DT);
        assert!(!orchestrator.load_group("MapA").expect("in flight"));
        settle(&mut orchestrator, &mut loader);
        assert!(!orchestrator.load_group("MapA").expect("active"));
        let loads = loader
            .calls()
            .iter()
            .filter(|call| matches!(call, LoaderCall::Load(c) if c.0 == "maps/a"))
            .count();
        assert_eq!(loads, 1);
    }

    #[test]
    fn switching_back_while_first_load_in_flight() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(3);
        orchestrator.load_group("MapA").expect("MapA");
        orchestrator.tick(&mut loader, DT);
        assert!(orchestrator.load_group("MapB").expect("MapB"));
        assert!(orchestrator.load_group("MapA").expect("back to MapA"));

        settle(&mut orchestrator, &mut loader);
        let map_a = orchestrator.catalog().index_of("MapA").expect("index");
        assert_eq!(orchestrator.active_groups(), &[map_a]);
        assert!(orchestrator.is_group_loaded("MapA"));
        assert!(!orchestrator.is_group_loaded("MapB"));
        assert!(loader.is_loaded(&ContentRef::new("maps/a")));
        assert!(!loader.is_loaded(&ContentRef::new("maps/b")));
    }

    #[test]
    fn reload_after_unload_while_in_flight() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(3);
        orchestrator.load_group("MapA").expect("MapA");
        orchestrator.tick(&mut loader, DT);
        assert!(orchestrator.unload_group("MapA").expect("unload"));
        assert!(orchestrator.load_group("MapA").expect("reload"));

        settle(&mut orchestrator, &mut loader);
        assert!(orchestrator.is_group_active("MapA"));
        assert!(orchestrator.is_group_loaded("MapA"));
        assert!(loader.is_loaded(&ContentRef::new("maps/a_props")));
    }

    #[test]
    fn unload_requested_twice_queues_one_unload() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(1);
        orchestrator.load_group("MapA").expect("MapA");
        settle(&mut orchestrator, &mut loader);
        assert!(orchestrator.unload_group("MapA").expect("unload"));
        assert!(!orchestrator.unload_group("MapA").expect("already inactive"));
        assert_eq!(orchestrator.pending_operations(), 1);
        settle(&mut orchestrator, &mut loader);
        assert!(!orchestrator.is_group_loaded("MapA"));
    }

    #[test]
    fn local_ui_only_displaces_local_ui() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(1);
        orchestrator.load_group("MapA").expect("map");
        orchestrator.load_group("MainMenu").expect("menu");
        settle(&mut orchestrator, &mut loader);

        orchestrator.load_group("Settings").expect("settings");
        settle(&mut orchestrator, &mut loader);

        assert!(orchestrator.is_group_loaded("MapA"));
        assert!(orchestrator.is_group_loaded("Settings"));
        assert!(!orchestrator.is_group_loaded("MainMenu"));
        assert_eq!(orchestrator.active_local_group(), Some(GroupIndex(1)));
    }

    #[test]
    fn replicated_request_also_unloads_local_ui() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(1);
        orchestrator.load_group("MainMenu").expect("menu");
        settle(&mut orchestrator, &mut loader);
        orchestrator.load_group("Lobby").expect("lobby");
        settle(&mut orchestrator, &mut loader);
        assert!(!orchestrator.is_group_loaded("MainMenu"));
        assert_eq!(orchestrator.active_local_group(), None);
    }

    #[test]
    fn local_ui_is_never_replicated() {
        let mut orchestrator = server();
        orchestrator.load_group("MainMenu").expect("menu");
        assert!(orchestrator.take_replication_events().is_empty());
        orchestrator.load_group("MapA").expect("map");
        assert_eq!(
            orchestrator.take_replication_events(),
            vec![ListEvent::Add(GroupIndex(3))]
        );
    }

    #[test]
    fn observer_cannot_request_replicated_groups() {
        let mut observer =
            SceneGroupOrchestrator::new(sample_catalog(), Authority::Observer, OrchestratorConfig::default());
        assert!(matches!(
            observer.load_group("MapA"),
            Err(OrchestratorError::NotAuthorized { .. })
        ));
        assert!(!observer.is_busy_loading());
        assert!(observer.load_group("MainMenu").expect("local ui"));
    }

    #[test]
    fn busy_until_every_operation_completes() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(2);
        assert!(!orchestrator.is_busy_loading());
        orchestrator.load_group("MapA").expect("map");
        assert!(orchestrator.is_busy_loading());
        let mut ticks = 0;
        while orchestrator.is_busy_loading() {
            orchestrator.tick(&mut loader, DT);
            ticks += 1;
            assert!(ticks < 20);
        }
        assert!(ticks >= 4);
    }

    #[test]
    fn environment_load_activates_its_first_content_once() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(1);
        orchestrator.load_group("Sky").expect("sky");
        settle(&mut orchestrator, &mut loader);
        let activations = loader
            .calls()
            .iter()
            .filter(|call| matches!(call, LoaderCall::Activate(_)))
            .count();
        assert_eq!(activations, 1);
        let active = loader.active_context().expect("active");
        assert_eq!(loader.content_of(active), Some(&ContentRef::new("env/sky")));
        assert_eq!(orchestrator.active_environment(), Some(GroupIndex(5)));
    }

    #[test]
    fn failed_load_is_retried_once() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(1);
        loader.fail_next(ContentRef::new("maps/b"), 1);
        orchestrator.load_group("MapB").expect("map");
        let events = settle(&mut orchestrator, &mut loader);
        assert_eq!(events, vec![GroupEvent::Loaded(GroupIndex(4))]);
    }

    #[test]
    fn persistent_failure_terminates_and_releases_partial_content() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(1);
        loader.fail_next(ContentRef::new("maps/a_props"), 5);
        orchestrator.load_group("MapA").expect("map");
        orchestrator.take_replication_events();

        let events = settle(&mut orchestrator, &mut loader);

        assert!(matches!(
            events.first(),
            Some(GroupEvent::Failed {
                direction: LoadDirection::Load,
                ..
            })
        ));
        assert!(!orchestrator.is_busy_loading());
        assert!(orchestrator.active_groups().is_empty());
        assert_eq!(loader.loaded_count(), 0);
        assert_eq!(
            orchestrator.take_replication_events(),
            vec![ListEvent::Remove(0)]
        );
    }

    #[test]
    fn stalled_load_times_out_instead_of_hanging() {
        let config = OrchestratorConfig {
            stall_timeout: Duration::from_secs(1),
            retry_limit: 0,
        };
        let mut orchestrator = SceneGroupOrchestrator::new(sample_catalog(), Authority::Server, config);
        let mut loader = ScriptedSceneLoader::new(1);
        loader.stall(ContentRef::new("maps/b"));
        orchestrator.load_group("MapB").expect("map");

        let events = settle(&mut orchestrator, &mut loader);
        assert!(matches!(events.as_slice(), [GroupEvent::Failed { .. }]));
        assert!(!orchestrator.is_busy_loading());
    }

    #[test]
    fn unloading_a_queued_load_cancels_it() {
        let mut orchestrator = server();
        let mut loader = ScriptedSceneLoader::new(1);
        orchestrator.load_group("MapA").expect("map");
        assert!(orchestrator.unload_group("MapA").expect("unload"));
        assert!(!orchestrator.is_busy_loading());
        settle(&mut orchestrator, &mut loader);
        assert!(loader.calls().is_empty());
    }

    #[test]
    fn observer_mirrors_server_list_and_loads() {
        let mut server = server();
        let mut observer =
            SceneGroupOrchestrator::new(sample_catalog(), Authority::Observer, OrchestratorConfig::default());
        let mut loader = ScriptedSceneLoader::new(1);
        let mut mirror: Vec<GroupIndex> = Vec::new();

        server.load_group("MapA").expect("a");
        server.load_group("MapB").expect("b");
        for event in server.take_replication_events() {
            apply_list_event(&mut mirror, event.clone()).expect("mirror");
            observer.apply_remote(event).expect("apply");
        }
        settle(&mut observer, &mut loader);

        assert_eq!(mirror, server.active_groups());
        assert_eq!(observer.active_groups(), server.active_groups());
        assert!(observer.is_group_loaded("MapB"));
        assert!(!observer.is_group_loaded("MapA"));
        assert!(observer.take_replication_events().is_empty());
    }

    #[test]
    fn snapshot_with_foreign_catalog_is_rejected() {
        let mut observer =
            SceneGroupOrchestrator::new(sample_catalog(), Authority::Observer, OrchestratorConfig::default());
        let snapshot = ActiveGroupSnapshot {
            fingerprint: "deadbeef".to_string(),
            indices: vec![GroupIndex(3)],
        };
        assert!(matches!(
            observer.apply_snapshot(&snapshot),
            Err(ReplicationError::CatalogMismatch { .. })
        ));
    }

    #[test]
    fn snapshot_brings_late_joiner_to_server_set() {
        let mut server = server();
        server.load_group("MapB").expect("b");
        let mut observer =
            SceneGroupOrchestrator::new(sample_catalog(), Authority::Observer, OrchestratorConfig::default());
        observer.apply_snapshot(&server.snapshot()).expect("snapshot");
        assert_eq!(observer.active_groups(), &[GroupIndex(4)]);
        assert!(observer.is_busy_loading());
    }

    #[test]
    fn remote_index_outside_catalog_is_rejected() {
        let mut observer =
            SceneGroupOrchestrator::new(sample_catalog(), Authority::Observer, OrchestratorConfig::default());
        assert!(matches!(
            observer.apply_remote(ListEvent::Add(GroupIndex(99))),
            Err(ReplicationError::UnknownIndex { .. })
        ));
    }
}
