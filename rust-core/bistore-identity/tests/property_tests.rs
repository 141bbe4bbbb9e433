// SPDX-License-Identifier: PMPL-1.0-or-later
//! Property-based tests for the identity registry

use std::collections::HashSet;

use bistore_identity::{CrossStoreIdRegistry, StoreIds, StoreKind};
use proptest::prelude::*;

/// Small id alphabet so that generated batches collide often.
fn arb_store_id(prefix: &'static str) -> impl Strategy<Value = String> {
    (0u8..12).prop_map(move |n| format!("{prefix}{n}"))
}

fn arb_known() -> impl Strategy<Value = StoreIds> {
    (
        proptest::option::of(arb_store_id("node:")),
        proptest::option::of(arb_store_id("row:")),
    )
        .prop_filter("at least one id", |(g, r)| g.is_some() || r.is_some())
        .prop_map(|(graph, relational)| StoreIds { graph, relational })
}

proptest! {
    #[test]
    fn test_lookup_returns_resolved_store_ids(batch in prop::collection::vec(arb_known(), 1..40)) {
        let registry = CrossStoreIdRegistry::new();
        for known in &batch {
            let resolution = registry.resolve_or_create(known).unwrap();
            let stored = registry.lookup(resolution.canonical_id).unwrap();

            for store in StoreKind::BOTH {
                if let Some(proposed) = known.get(store) {
                    let collided = resolution.collisions.iter().any(|c| c.store == store);
                    if collided {
                        let assigned = stored.get(store).unwrap();
                        prop_assert_ne!(assigned, proposed);
                        prop_assert!(assigned.starts_with(proposed));
                    } else {
                        prop_assert_eq!(stored.get(store), Some(proposed));
                    }
                }
            }
        }
    }

    #[test]
    fn test_no_two_canonical_ids_share_a_store_id(batch in prop::collection::vec(arb_known(), 1..60)) {
        let registry = CrossStoreIdRegistry::new();
        for known in &batch {
            registry.resolve_or_create(known).unwrap();
        }
        prop_assert!(registry.check_bijection().is_ok());

        let snapshot = registry.export();
        for store in StoreKind::BOTH {
            let mut seen = HashSet::new();
            for mapping in &snapshot.mappings {
                if let Some(id) = mapping.store_id(store) {
                    prop_assert!(seen.insert(id.to_string()), "{} id {} shared", store, id);
                }
            }
        }
    }

    #[test]
    fn test_existing_mappings_never_change_on_collision(
        first in arb_known(),
        rest in prop::collection::vec(arb_known(), 0..30),
    ) {
        let registry = CrossStoreIdRegistry::new();
        let anchor = registry.resolve_or_create(&first).unwrap();
        let mut expected = anchor.mapping.clone();

        for known in &rest {
            let resolution = registry.resolve_or_create(known).unwrap();
            // Only attaching a missing id may touch the anchor.
            if resolution.canonical_id == anchor.canonical_id {
                expected = resolution.mapping.clone();
            }
        }

        let current = registry.mapping(anchor.canonical_id).unwrap();
        prop_assert_eq!(current.graph_store_id, expected.graph_store_id);
        prop_assert_eq!(current.relational_store_id, expected.relational_store_id);
        prop_assert_eq!(current.collision_history, anchor.mapping.collision_history);
    }
}
