// SPDX-License-Identifier: PMPL-1.0-or-later
//! Identity types shared by the registry and the coordinator.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The single logical identifier of an entity across both stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(Uuid);

impl CanonicalId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// First eight hex digits, used to derive replacement store ids.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two participant stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Graph,
    Relational,
}

impl StoreKind {
    pub const BOTH: [StoreKind; 2] = [StoreKind::Graph, StoreKind::Relational];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Graph => "graph",
            StoreKind::Relational => "relational",
        }
    }

    pub fn other(&self) -> StoreKind {
        match self {
            StoreKind::Graph => StoreKind::Relational,
            StoreKind::Relational => StoreKind::Graph,
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-local ids, each optional until the entity is written there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreIds {
    pub graph: Option<String>,
    pub relational: Option<String>,
}

impl StoreIds {
    pub fn graph(id: impl Into<String>) -> Self {
        Self {
            graph: Some(id.into()),
            relational: None,
        }
    }

    pub fn relational(id: impl Into<String>) -> Self {
        Self {
            graph: None,
            relational: Some(id.into()),
        }
    }

    pub fn both(graph: impl Into<String>, relational: impl Into<String>) -> Self {
        Self {
            graph: Some(graph.into()),
            relational: Some(relational.into()),
        }
    }

    pub fn get(&self, store: StoreKind) -> Option<&str> {
        match store {
            StoreKind::Graph => self.graph.as_deref(),
            StoreKind::Relational => self.relational.as_deref(),
        }
    }

    pub(crate) fn set(&mut self, store: StoreKind, id: Option<String>) {
        match store {
            StoreKind::Graph => self.graph = id,
            StoreKind::Relational => self.relational = id,
        }
    }
}

/// Ids a caller already has for an entity it is about to write.
pub type KnownIds = StoreIds;

/// A proposed store id that already belonged to another entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollisionRecord {
    pub store: StoreKind,
    pub proposed_id: String,
    /// Owner of `proposed_id`, left untouched.
    pub existing_canonical: CanonicalId,
    /// Id given to the new entity instead.
    pub assigned_id: String,
    pub at: DateTime<Utc>,
}

/// The registry's record for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityIdMapping {
    pub canonical_id: CanonicalId,
    pub graph_store_id: Option<String>,
    pub relational_store_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub collision_history: Vec<CollisionRecord>,
    /// Canonical ids this mapping replaced through `remap_on_collision`.
    pub superseded_ids: Vec<CanonicalId>,
}

impl EntityIdMapping {
    pub(crate) fn new(canonical_id: CanonicalId, ids: StoreIds) -> Self {
        Self {
            canonical_id,
            graph_store_id: ids.graph,
            relational_store_id: ids.relational,
            created_at: Utc::now(),
            collision_history: Vec::new(),
            superseded_ids: Vec::new(),
        }
    }

    pub fn store_ids(&self) -> StoreIds {
        StoreIds {
            graph: self.graph_store_id.clone(),
            relational: self.relational_store_id.clone(),
        }
    }

    pub fn store_id(&self, store: StoreKind) -> Option<&str> {
        match store {
            StoreKind::Graph => self.graph_store_id.as_deref(),
            StoreKind::Relational => self.relational_store_id.as_deref(),
        }
    }

    pub(crate) fn set_store_id(&mut self, store: StoreKind, id: String) {
        match store {
            StoreKind::Graph => self.graph_store_id = Some(id),
            StoreKind::Relational => self.relational_store_id = Some(id),
        }
    }
}

/// Result of [`crate::CrossStoreIdRegistry::resolve_or_create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub canonical_id: CanonicalId,
    pub mapping: EntityIdMapping,
    /// Whether a new canonical id was allocated.
    pub created: bool,
    /// Collisions resolved while allocating, empty when none occurred.
    pub collisions: Vec<CollisionRecord>,
}

/// Serializable registry contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub mappings: Vec<EntityIdMapping>,
    /// `(superseded, current)` pairs.
    pub aliases: Vec<(CanonicalId, CanonicalId)>,
}
