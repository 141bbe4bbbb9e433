// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cross-store identity registry.
//
// Three concurrent maps: canonical id -> mapping, and one reverse index per
// store. A store id is claimed through a single `entry()` call on its index,
// so two entities can never both own it. Mutations of an existing mapping are
// serialized by a striped lock picked from the canonical id; creation of a
// new canonical id needs no lock beyond its own stripe.
//
// A mapping is inserted before its store ids are claimed, so any canonical id
// reachable through an index has a mapping, except for the instant between a
// remap repointing the index and the old mapping being removed. Readers that
// hit that window retry.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::IdentityError;
use crate::types::{
    CanonicalId, CollisionRecord, EntityIdMapping, IdentitySnapshot, KnownIds, Resolution,
    StoreIds, StoreKind,
};

const STRIPES: usize = 64;
const MAX_RESOLVE_ATTEMPTS: u32 = 16;
const MAX_ALIAS_HOPS: usize = 32;

/// Maps canonical entity ids to their ids in the graph and relational stores.
pub struct CrossStoreIdRegistry {
    mappings: DashMap<CanonicalId, EntityIdMapping>,
    graph_index: DashMap<String, CanonicalId>,
    relational_index: DashMap<String, CanonicalId>,
    /// Superseded canonical id -> its replacement.
    aliases: DashMap<CanonicalId, CanonicalId>,
    stripes: Vec<Mutex<()>>,
    collisions_total: AtomicU64,
}

impl Default for CrossStoreIdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CrossStoreIdRegistry {
    pub fn new() -> Self {
        Self {
            mappings: DashMap::new(),
            graph_index: DashMap::new(),
            relational_index: DashMap::new(),
            aliases: DashMap::new(),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            collisions_total: AtomicU64::new(0),
        }
    }

    fn index(&self, store: StoreKind) -> &DashMap<String, CanonicalId> {
        match store {
            StoreKind::Graph => &self.graph_index,
            StoreKind::Relational => &self.relational_index,
        }
    }

    fn stripe(&self, id: CanonicalId) -> &Mutex<()> {
        &self.stripes[(id.as_uuid().as_u128() % STRIPES as u128) as usize]
    }

    fn owner(&self, store: StoreKind, id: &str) -> Option<CanonicalId> {
        self.index(store).get(id).map(|owner| *owner)
    }

    /// Claim `id` in `store` for `owner`. On conflict returns the current owner.
    fn claim(&self, store: StoreKind, id: &str, owner: CanonicalId) -> Result<(), CanonicalId> {
        match self.index(store).entry(id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(owner);
                Ok(())
            }
            Entry::Occupied(taken) => Err(*taken.get()),
        }
    }

    fn unclaim(&self, store: StoreKind, id: &str, owner: CanonicalId) {
        self.index(store).remove_if(id, |_, current| *current == owner);
    }

    /// Find the entity `known` refers to, or allocate a new one.
    ///
    /// - Ids that all belong to one entity resolve to it.
    /// - An id belonging to an entity that has no id yet in the other store
    ///   gets the other proposed id attached.
    /// - A proposed id already owned by an entity that disagrees about the
    ///   other store is a collision: the owner is left untouched and a new
    ///   canonical id is allocated with a derived id for the colliding store.
    /// - Unknown ids allocate a new canonical id.
    pub fn resolve_or_create(&self, known: &KnownIds) -> Result<Resolution, IdentityError> {
        validate(known)?;
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            if let Some(resolution) = self.try_resolve(known) {
                return Ok(resolution);
            }
        }
        warn!(
            graph = ?known.graph,
            relational = ?known.relational,
            "Identity resolution kept losing races"
        );
        Err(IdentityError::Contention {
            attempts: MAX_RESOLVE_ATTEMPTS,
        })
    }

    /// One resolution attempt. `None` means a concurrent change got in the
    /// way and the caller should retry.
    fn try_resolve(&self, known: &KnownIds) -> Option<Resolution> {
        let graph = known.graph.as_deref().map(|id| (id, self.owner(StoreKind::Graph, id)));
        let relational = known
            .relational
            .as_deref()
            .map(|id| (id, self.owner(StoreKind::Relational, id)));

        match (graph, relational) {
            (Some((_, Some(a))), Some((_, Some(b)))) if a == b => self.existing(a),
            (Some((_, Some(a))), Some((_, Some(b)))) => self.create(
                known,
                &[(StoreKind::Graph, a), (StoreKind::Relational, b)],
            ),
            (Some((_, Some(owner))), relational) => {
                self.extend_or_collide(known, StoreKind::Graph, owner, relational.map(|(id, _)| id))
            }
            (graph, Some((_, Some(owner)))) => {
                self.extend_or_collide(known, StoreKind::Relational, owner, graph.map(|(id, _)| id))
            }
            _ => self.create(known, &[]),
        }
    }

    fn existing(&self, canonical_id: CanonicalId) -> Option<Resolution> {
        let mapping = self.mappings.get(&canonical_id)?.clone();
        Some(Resolution {
            canonical_id,
            mapping,
            created: false,
            collisions: Vec::new(),
        })
    }

    /// `found` already owns its proposed id; `other_id` is the unowned id
    /// proposed for the other store, if any.
    fn extend_or_collide(
        &self,
        known: &KnownIds,
        found: StoreKind,
        owner: CanonicalId,
        other_id: Option<&str>,
    ) -> Option<Resolution> {
        let Some(other_id) = other_id else {
            return self.existing(owner);
        };
        let other = found.other();

        let stripe = self.stripe(owner).lock();
        let mapping = self.mappings.get(&owner)?.clone();

        let attached = mapping.store_id(other).map(str::to_string);
        match attached {
            None => {
                self.claim(other, other_id, owner).ok()?;
                let mut entry = self.mappings.get_mut(&owner)?;
                entry.set_store_id(other, other_id.to_string());
                let mapping = entry.clone();
                drop(entry);
                debug!(
                    canonical = %owner,
                    store = %other,
                    store_id = other_id,
                    "Attached store id to existing entity"
                );
                Some(Resolution {
                    canonical_id: owner,
                    mapping,
                    created: false,
                    collisions: Vec::new(),
                })
            }
            Some(current) if current == other_id => Some(Resolution {
                canonical_id: owner,
                mapping,
                created: false,
                collisions: Vec::new(),
            }),
            Some(_) => {
                drop(stripe);
                self.create(known, &[(found, owner)])
            }
        }
    }

    /// Allocate a fresh canonical id. Every `(store, owner)` in `colliding`
    /// gets a derived id in place of the proposed one.
    fn create(
        &self,
        known: &KnownIds,
        colliding: &[(StoreKind, CanonicalId)],
    ) -> Option<Resolution> {
        let canonical_id = CanonicalId::generate();
        let mut ids = known.clone();
        let mut collisions = Vec::with_capacity(colliding.len());

        for (store, existing) in colliding {
            let proposed = known.get(*store)?.to_string();
            let assigned = format!("{proposed}~{}", canonical_id.short());
            ids.set(*store, Some(assigned.clone()));
            collisions.push(CollisionRecord {
                store: *store,
                proposed_id: proposed,
                existing_canonical: *existing,
                assigned_id: assigned,
                at: Utc::now(),
            });
        }

        let mut mapping = EntityIdMapping::new(canonical_id, ids.clone());
        mapping.collision_history = collisions.clone();

        let _stripe = self.stripe(canonical_id).lock();
        self.mappings.insert(canonical_id, mapping.clone());

        let mut claimed: Vec<StoreKind> = Vec::with_capacity(2);
        for store in StoreKind::BOTH {
            let Some(id) = ids.get(store) else { continue };
            if self.claim(store, id, canonical_id).is_err() {
                for undo in claimed {
                    if let Some(id) = ids.get(undo) {
                        self.unclaim(undo, id, canonical_id);
                    }
                }
                self.mappings.remove(&canonical_id);
                return None;
            }
            claimed.push(store);
        }

        if collisions.is_empty() {
            debug!(canonical = %canonical_id, "Allocated canonical id");
        } else {
            self.collisions_total
                .fetch_add(collisions.len() as u64, Ordering::Relaxed);
            for collision in &collisions {
                warn!(
                    canonical = %canonical_id,
                    store = %collision.store,
                    proposed = %collision.proposed_id,
                    owner = %collision.existing_canonical,
                    assigned = %collision.assigned_id,
                    "Store id collision resolved with a new canonical id"
                );
            }
        }

        Some(Resolution {
            canonical_id,
            mapping,
            created: true,
            collisions,
        })
    }

    /// Follow superseded-id aliases to the live canonical id.
    pub fn current_id(&self, canonical_id: CanonicalId) -> CanonicalId {
        let mut current = canonical_id;
        for _ in 0..MAX_ALIAS_HOPS {
            match self.aliases.get(&current) {
                Some(next) => current = *next,
                None => break,
            }
        }
        current
    }

    /// Store ids for a canonical id. Superseded ids resolve to their
    /// replacement.
    pub fn lookup(&self, canonical_id: CanonicalId) -> Option<StoreIds> {
        self.mapping(canonical_id).map(|m| m.store_ids())
    }

    pub fn mapping(&self, canonical_id: CanonicalId) -> Option<EntityIdMapping> {
        let current = self.current_id(canonical_id);
        self.mappings.get(&current).map(|m| m.clone())
    }

    /// Which entity owns `store_id` in `store`.
    pub fn canonical_for(&self, store: StoreKind, store_id: &str) -> Option<CanonicalId> {
        self.owner(store, store_id)
    }

    /// Move an entity to a freshly generated canonical id.
    ///
    /// The store ids move with it, the old id is recorded in
    /// `superseded_ids`, and lookups of the old id follow an alias to the
    /// new one.
    pub fn remap_on_collision(&self, canonical_id: CanonicalId) -> Result<CanonicalId, IdentityError> {
        let current = self.current_id(canonical_id);
        let _stripe = self.stripe(current).lock();

        let old = self
            .mappings
            .get(&current)
            .map(|m| m.clone())
            .ok_or(IdentityError::UnknownCanonical(canonical_id))?;

        let replacement = CanonicalId::generate();
        let mut mapping = old.clone();
        mapping.canonical_id = replacement;
        mapping.superseded_ids.push(current);

        self.mappings.insert(replacement, mapping);
        for store in StoreKind::BOTH {
            if let Some(id) = old.store_id(store) {
                self.index(store).insert(id.to_string(), replacement);
            }
        }
        self.aliases.insert(current, replacement);
        self.mappings.remove(&current);

        info!(old = %current, new = %replacement, "Remapped canonical id");
        Ok(replacement)
    }

    /// Forget an entity and release its store ids.
    pub fn remove(&self, canonical_id: CanonicalId) -> Option<EntityIdMapping> {
        let current = self.current_id(canonical_id);
        let _stripe = self.stripe(current).lock();
        let (_, mapping) = self.mappings.remove(&current)?;
        for store in StoreKind::BOTH {
            if let Some(id) = mapping.store_id(store) {
                self.unclaim(store, id, current);
            }
        }
        Some(mapping)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Collisions resolved since start-up.
    pub fn collisions_total(&self) -> u64 {
        self.collisions_total.load(Ordering::Relaxed)
    }

    /// Verify that every mapping owns exactly its store ids and every index
    /// entry points back at the mapping that names it.
    pub fn check_bijection(&self) -> Result<(), IdentityError> {
        let mappings: Vec<EntityIdMapping> = self.mappings.iter().map(|m| m.clone()).collect();
        for mapping in &mappings {
            for store in StoreKind::BOTH {
                if let Some(id) = mapping.store_id(store) {
                    let owner = self.owner(store, id);
                    if owner != Some(mapping.canonical_id) {
                        return Err(IdentityError::BijectionViolated(format!(
                            "{store} id {id:?} of {} is indexed to {owner:?}",
                            mapping.canonical_id
                        )));
                    }
                }
            }
        }
        for store in StoreKind::BOTH {
            let entries: Vec<(String, CanonicalId)> = self
                .index(store)
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect();
            for (id, owner) in entries {
                let named = self
                    .mappings
                    .get(&owner)
                    .and_then(|m| m.store_id(store).map(str::to_string));
                if named.as_deref() != Some(id.as_str()) {
                    return Err(IdentityError::BijectionViolated(format!(
                        "{store} id {id:?} is indexed to {owner}, which does not name it"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every mapping and alias, ordered by creation time.
    pub fn export(&self) -> IdentitySnapshot {
        let mut mappings: Vec<EntityIdMapping> = self.mappings.iter().map(|m| m.clone()).collect();
        mappings.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.canonical_id.cmp(&b.canonical_id))
        });
        let mut aliases: Vec<(CanonicalId, CanonicalId)> =
            self.aliases.iter().map(|e| (*e.key(), *e.value())).collect();
        aliases.sort();
        IdentitySnapshot { mappings, aliases }
    }

    /// Rebuild a registry from [`Self::export`] output, rejecting snapshots
    /// in which two entities share a store id.
    pub fn from_snapshot(snapshot: IdentitySnapshot) -> Result<Self, IdentityError> {
        let registry = Self::new();
        for mapping in snapshot.mappings {
            let canonical_id = mapping.canonical_id;
            if mapping.graph_store_id.is_none() && mapping.relational_store_id.is_none() {
                return Err(IdentityError::BijectionViolated(format!(
                    "{canonical_id} has no store ids"
                )));
            }
            for store in StoreKind::BOTH {
                if let Some(id) = mapping.store_id(store) {
                    if let Err(owner) = registry.claim(store, id, canonical_id) {
                        return Err(IdentityError::BijectionViolated(format!(
                            "{store} id {id:?} claimed by both {owner} and {canonical_id}"
                        )));
                    }
                }
            }
            if registry.mappings.insert(canonical_id, mapping).is_some() {
                return Err(IdentityError::BijectionViolated(format!(
                    "{canonical_id} appears twice"
                )));
            }
        }
        for (superseded, current) in snapshot.aliases {
            registry.aliases.insert(superseded, current);
        }
        info!(mappings = registry.len(), "Loaded identity snapshot");
        Ok(registry)
    }
}

fn validate(known: &KnownIds) -> Result<(), IdentityError> {
    if known.graph.is_none() && known.relational.is_none() {
        return Err(IdentityError::NoStoreIds);
    }
    for store in StoreKind::BOTH {
        if let Some(id) = known.get(store) {
            if id.trim().is_empty() {
                return Err(IdentityError::InvalidStoreId {
                    store,
                    id: id.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // -- Test 1: unknown ids allocate, known ids resolve --

    #[test]
    fn test_resolve_is_idempotent() {
        let registry = CrossStoreIdRegistry::new();
        let first = registry
            .resolve_or_create(&StoreIds::both("node:e1", "row:e1"))
            .unwrap();
        assert!(first.created);

        let again = registry
            .resolve_or_create(&StoreIds::both("node:e1", "row:e1"))
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.canonical_id, first.canonical_id);

        let by_graph = registry.resolve_or_create(&StoreIds::graph("node:e1")).unwrap();
        assert_eq!(by_graph.canonical_id, first.canonical_id);

        assert_eq!(
            registry.lookup(first.canonical_id),
            Some(StoreIds::both("node:e1", "row:e1"))
        );
    }

    // -- Test 2: partial mappings gain their second id --

    #[test]
    fn test_attach_second_store_id() {
        let registry = CrossStoreIdRegistry::new();
        let created = registry.resolve_or_create(&StoreIds::graph("node:7")).unwrap();
        assert_eq!(created.mapping.relational_store_id, None);

        let attached = registry
            .resolve_or_create(&StoreIds::both("node:7", "row:7"))
            .unwrap();
        assert!(!attached.created);
        assert_eq!(attached.canonical_id, created.canonical_id);
        assert_eq!(attached.mapping.relational_store_id.as_deref(), Some("row:7"));
        assert_eq!(
            registry.canonical_for(StoreKind::Relational, "row:7"),
            Some(created.canonical_id)
        );
    }

    // -- Test 3: collisions never overwrite (Scenario D) --

    #[test]
    fn test_colliding_graph_id_gets_new_canonical() {
        let registry = CrossStoreIdRegistry::new();
        let first = registry
            .resolve_or_create(&StoreIds::both("node:dup", "row:a"))
            .unwrap();

        let second = registry
            .resolve_or_create(&StoreIds::both("node:dup", "row:b"))
            .unwrap();

        assert!(second.created);
        assert_ne!(second.canonical_id, first.canonical_id);
        assert_eq!(second.collisions.len(), 1);

        let collision = &second.collisions[0];
        assert_eq!(collision.store, StoreKind::Graph);
        assert_eq!(collision.proposed_id, "node:dup");
        assert_eq!(collision.existing_canonical, first.canonical_id);
        assert_ne!(collision.assigned_id, "node:dup");
        assert_eq!(second.mapping.collision_history, second.collisions);
        assert_eq!(second.mapping.relational_store_id.as_deref(), Some("row:b"));

        // First mapping unchanged.
        assert_eq!(registry.mapping(first.canonical_id), Some(first.mapping));
        assert_eq!(registry.collisions_total(), 1);
        registry.check_bijection().unwrap();
    }

    #[test]
    fn test_ids_owned_by_two_entities_collide_on_both_stores() {
        let registry = CrossStoreIdRegistry::new();
        let a = registry.resolve_or_create(&StoreIds::both("g1", "r1")).unwrap();
        let b = registry.resolve_or_create(&StoreIds::both("g2", "r2")).unwrap();

        let crossed = registry.resolve_or_create(&StoreIds::both("g1", "r2")).unwrap();
        assert!(crossed.created);
        assert_eq!(crossed.collisions.len(), 2);
        assert_eq!(crossed.collisions[0].existing_canonical, a.canonical_id);
        assert_eq!(crossed.collisions[1].existing_canonical, b.canonical_id);
        registry.check_bijection().unwrap();
    }

    // -- Test 4: input validation --

    #[test]
    fn test_rejects_empty_input() {
        let registry = CrossStoreIdRegistry::new();
        assert!(matches!(
            registry.resolve_or_create(&StoreIds::default()),
            Err(IdentityError::NoStoreIds)
        ));
        assert!(matches!(
            registry.resolve_or_create(&StoreIds::graph("  ")),
            Err(IdentityError::InvalidStoreId { store: StoreKind::Graph, .. })
        ));
    }

    // -- Test 5: remap keeps ids reachable through the old canonical id --

    #[test]
    fn test_remap_moves_ids_and_aliases_old_id() {
        let registry = CrossStoreIdRegistry::new();
        let original = registry.resolve_or_create(&StoreIds::both("g", "r")).unwrap();

        let replacement = registry.remap_on_collision(original.canonical_id).unwrap();
        assert_ne!(replacement, original.canonical_id);

        let mapping = registry.mapping(replacement).unwrap();
        assert_eq!(mapping.superseded_ids, vec![original.canonical_id]);
        assert_eq!(registry.current_id(original.canonical_id), replacement);
        assert_eq!(registry.lookup(original.canonical_id), Some(StoreIds::both("g", "r")));
        assert_eq!(registry.canonical_for(StoreKind::Graph, "g"), Some(replacement));
        assert_eq!(registry.len(), 1);
        registry.check_bijection().unwrap();

        let unknown = CanonicalId::generate();
        assert!(matches!(
            registry.remap_on_collision(unknown),
            Err(IdentityError::UnknownCanonical(_))
        ));
    }

    #[test]
    fn test_remove_releases_store_ids() {
        let registry = CrossStoreIdRegistry::new();
        let entity = registry.resolve_or_create(&StoreIds::both("g", "r")).unwrap();
        assert!(registry.remove(entity.canonical_id).is_some());
        assert!(registry.is_empty());

        let reused = registry.resolve_or_create(&StoreIds::both("g", "r")).unwrap();
        assert!(reused.created);
        assert!(reused.collisions.is_empty());
    }

    // -- Test 6: export/import --

    #[test]
    fn test_snapshot_round_trip_and_rejection() {
        let registry = CrossStoreIdRegistry::new();
        let a = registry.resolve_or_create(&StoreIds::both("g1", "r1")).unwrap();
        registry.resolve_or_create(&StoreIds::graph("g2")).unwrap();
        let remapped = registry.remap_on_collision(a.canonical_id).unwrap();

        let snapshot = registry.export();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored =
            CrossStoreIdRegistry::from_snapshot(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.current_id(a.canonical_id), remapped);
        restored.check_bijection().unwrap();

        let mut broken = snapshot;
        let mut twin = broken.mappings[0].clone();
        twin.canonical_id = CanonicalId::generate();
        broken.mappings.push(twin);
        assert!(matches!(
            CrossStoreIdRegistry::from_snapshot(broken),
            Err(IdentityError::BijectionViolated(_))
        ));
    }

    // -- Test 7: concurrent resolution of overlapping ids --

    #[test]
    fn test_concurrent_resolution_preserves_bijection() {
        let registry = Arc::new(CrossStoreIdRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let ids = StoreIds::both(format!("g{}", i % 50), format!("r{}", (i + t) % 50));
                        registry.resolve_or_create(&ids).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        registry.check_bijection().unwrap();
    }
}
