use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::catalog::ContentRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to load {content}: {reason}")]
pub struct LoadFailure {
    pub content: ContentRef,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadPoll {
    Pending,
    Loaded(ContentHandle),
    Unloaded,
    Failed(LoadFailure),
}

/// Opaque asynchronous content loader. Operations are started and then
/// polled once per tick; nothing here may block.
pub trait SceneLoader {
    fn load_async(&mut self, content: &ContentRef) -> OpId;
    fn unload_async(&mut self, handle: ContentHandle) -> OpId;
    fn poll(&mut self, op: OpId) -> LoadPoll;
    fn activate(&mut self, handle: ContentHandle);
    fn active_context(&self) -> Option<ContentHandle>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderCall {
    Load(ContentRef),
    Unload(ContentHandle),
    Activate(ContentHandle),
}

#[derive(Debug)]
enum ScriptedOpKind {
    Load(ContentRef),
    Unload(ContentHandle),
}

#[derive(Debug)]
struct ScriptedOp {
    kind: ScriptedOpKind,
    remaining_polls: u32,
}

/// Deterministic in-memory loader: every operation completes after a fixed
/// number of polls. Specific content can be told to fail or to never finish.
#[derive(Debug)]
pub struct ScriptedSceneLoader {
    polls_to_complete: u32,
    next_op: u64,
    next_handle: u64,
    ops: HashMap<OpId, ScriptedOp>,
    loaded: HashMap<ContentHandle, ContentRef>,
    failures: HashMap<ContentRef, u32>,
    stalled: HashSet<ContentRef>,
    active: Option<ContentHandle>,
    calls: Vec<LoaderCall>,
}

impl Default for ScriptedSceneLoader {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ScriptedSceneLoader {
    pub fn new(polls_to_complete: u32) -> Self {
        Self {
            polls_to_complete: polls_to_complete.max(1),
            next_op: 1,
            next_handle: 1,
            ops: HashMap::new(),
            loaded: HashMap::new(),
            failures: HashMap::new(),
            stalled: HashSet::new(),
            active: None,
            calls: Vec::new(),
        }
    }

    pub fn fail_next(&mut self, content: ContentRef, times: u32) {
        self.failures.insert(content, times);
    }

    pub fn stall(&mut self, content: ContentRef) {
        self.stalled.insert(content);
    }

    pub fn unstall(&mut self, content: &ContentRef) {
        self.stalled.remove(content);
    }

    pub fn is_loaded(&self, content: &ContentRef) -> bool {
        self.loaded.values().any(|loaded| loaded == content)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    pub fn content_of(&self, handle: ContentHandle) -> Option<&ContentRef> {
        self.loaded.get(&handle)
    }

    pub fn calls(&self) -> &[LoaderCall] {
        &self.calls
    }

    fn allocate_op(&mut self, kind: ScriptedOpKind) -> OpId {
        let op = OpId(self.next_op);
        self.next_op = self.next_op.saturating_add(1);
        self.ops.insert(
            op,
            ScriptedOp {
                kind,
                remaining_polls: self.polls_to_complete,
            },
        );
        op
    }
}

impl SceneLoader for ScriptedSceneLoader {
    fn load_async(&mut self, content: &ContentRef) -> OpId {
        self.calls.push(LoaderCall::Load(content.clone()));
        self.allocate_op(ScriptedOpKind::Load(content.clone()))
    }

    fn unload_async(&mut self, handle: ContentHandle) -> OpId {
        self.calls.push(LoaderCall::Unload(handle));
        self.allocate_op(ScriptedOpKind::Unload(handle))
    }

    fn poll(&mut self, op: OpId) -> LoadPoll {
        let Some(state) = self.ops.get_mut(&op) else {
            return LoadPoll::Failed(LoadFailure {
                content: ContentRef::new("<unknown>"),
                reason: format!("unknown operation {}", op.0),
            });
        };
        if let ScriptedOpKind::Load(content) = &state.kind {
            if self.stalled.contains(content) {
                return LoadPoll::Pending;
            }
        }
        state.remaining_polls = state.remaining_polls.saturating_sub(1);
        if state.remaining_polls > 0 {
            return LoadPoll::Pending;
        }

        let Some(finished) = self.ops.remove(&op) else {
            return LoadPoll::Pending;
        };
        match finished.kind {
            ScriptedOpKind::Load(content) => {
                if let Some(remaining) = self.failures.get_mut(&content) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return LoadPoll::Failed(LoadFailure {
                            content,
                            reason: "scripted failure".to_string(),
                        });
                    }
                }
                let handle = ContentHandle(self.next_handle);
                self.next_handle = self.next_handle.saturating_add(1);
                self.loaded.insert(handle, content);
                LoadPoll::Loaded(handle)
            }
            ScriptedOpKind::Unload(handle) => {
                self.loaded.remove(&handle);
                if self.active == Some(handle) {
                    self.active = None;
                }
                LoadPoll::Unloaded
            }
        }
    }

    fn activate(&mut self, handle: ContentHandle) {
        self.calls.push(LoaderCall::Activate(handle));
        self.active = Some(handle);
    }

    fn active_context(&self) -> Option<ContentHandle> {
        self.active
    }
}
