// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target for identity resolution: arbitrary resolve sequences must keep
// store ids one-to-one with canonical ids

#![no_main]

use bistore_identity::{CrossStoreIdRegistry, StoreIds};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let registry = CrossStoreIdRegistry::new();

    // Two bytes per call: which stores are known, then a small id.
    for pair in data.chunks_exact(2) {
        let (mask, id) = (pair[0] % 4, pair[1] % 16);
        let known = StoreIds {
            graph: (mask & 1 != 0).then(|| format!("node:{id}")),
            relational: (mask & 2 != 0).then(|| format!("row:{id}")),
        };
        let _ = registry.resolve_or_create(&known);
    }

    assert!(registry.check_bijection().is_ok());
    let restored = CrossStoreIdRegistry::from_snapshot(registry.export());
    assert!(restored.is_ok());
});
