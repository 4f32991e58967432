use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hashing::hash_scene_groups;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SceneCategory {
    #[serde(rename = "LocalUI")]
    LocalUi,
    #[serde(rename = "SynchronizedUI")]
    SynchronizedUi,
    Gameplay,
    Environment,
}

impl SceneCategory {
    /// Every category except `LocalUI` is server-owned and replicated.
    pub fn is_replicated(self) -> bool {
        !matches!(self, SceneCategory::LocalUi)
    }

    pub fn label(self) -> &'static str {
        match self {
            SceneCategory::LocalUi => "LocalUI",
            SceneCategory::SynchronizedUi => "SynchronizedUI",
            SceneCategory::Gameplay => "Gameplay",
            SceneCategory::Environment => "Environment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentRef(pub String);

impl ContentRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupIndex(pub u32);

impl GroupIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneGroup {
    pub name: String,
    pub category: SceneCategory,
    pub content: Vec<ContentRef>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    groups: Vec<SceneGroup>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("scene group catalog is empty")]
    Empty,
    #[error("scene group at position {position} has an empty name")]
    EmptyName { position: usize },
    #[error("duplicate scene group name: {name}")]
    DuplicateName { name: String },
    #[error("scene group {name} lists no content")]
    NoContent { name: String },
    #[error("unknown scene group: {name}")]
    UnknownGroup { name: String },
    #[error("failed to read catalog {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse catalog {path} at {location}: {message}")]
    Parse {
        path: PathBuf,
        location: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct SceneGroupCatalog {
    groups: Vec<SceneGroup>,
    index_by_name: HashMap<String, GroupIndex>,
    fingerprint: String,
}

impl SceneGroupCatalog {
    pub fn from_groups(groups: Vec<SceneGroup>) -> Result<Self, CatalogError> {
        if groups.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut index_by_name = HashMap::with_capacity(groups.len());
        for (position, group) in groups.iter().enumerate() {
            if group.name.trim().is_empty() {
                return Err(CatalogError::EmptyName { position });
            }
            if group.content.is_empty() {
                return Err(CatalogError::NoContent {
                    name: group.name.clone(),
                });
            }
            let index = GroupIndex(position as u32);
            if index_by_name.insert(group.name.clone(), index).is_some() {
                return Err(CatalogError::DuplicateName {
                    name: group.name.clone(),
                });
            }
        }
        let fingerprint = hash_scene_groups(&groups);
        Ok(Self {
            groups,
            index_by_name,
            fingerprint,
        })
    }

    pub fn from_json_str(raw: &str, origin: &Path) -> Result<Self, CatalogError> {
        let mut deserializer = serde_json::Deserializer::from_str(raw);
        let file = serde_path_to_error::deserialize::<_, CatalogFile>(&mut deserializer).map_err(
            |error| {
                let location = error.path().to_string();
                CatalogError::Parse {
                    path: origin.to_path_buf(),
                    location: if location.is_empty() {
                        ".".to_string()
                    } else {
                        location
                    },
                    message: error.into_inner().to_string(),
                }
            },
        )?;
        Self::from_groups(file.groups)
    }

    pub fn load_json(path: &Path) -> Result<Self, CatalogError> {
        let raw = fs::read_to_string(path).map_err(|source| CatalogError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw, path)
    }

    pub fn index_of(&self, name: &str) -> Result<GroupIndex, CatalogError> {
        self.index_by_name
            .get(name)
            .copied()
            .ok_or_else(|| CatalogError::UnknownGroup {
                name: name.to_string(),
            })
    }

    pub fn group(&self, index: GroupIndex) -> Option<&SceneGroup> {
        self.groups.get(index.index())
    }

    pub fn groups(&self) -> &[SceneGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}
