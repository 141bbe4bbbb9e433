// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target for recovery ticket decoding

#![no_main]

use bistore_txn::RecoveryTicket;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Malformed tickets must be rejected, never panic.
    if let Ok(ticket) = serde_json::from_slice::<RecoveryTicket>(data) {
        let encoded = serde_json::to_vec(&ticket).expect("decoded ticket re-encodes");
        let _ = serde_json::from_slice::<RecoveryTicket>(&encoded);
    }
});
