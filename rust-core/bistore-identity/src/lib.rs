// SPDX-License-Identifier: PMPL-1.0-or-later
//! BiStore identity registry
//!
//! Every entity has one [`CanonicalId`] and up to one id in each participant
//! store. [`CrossStoreIdRegistry`] keeps that relation a bijection: a store id
//! belongs to at most one canonical id, and a collision allocates a new
//! canonical id instead of overwriting an existing mapping.

mod error;
mod registry;
mod types;

pub use error::IdentityError;
pub use registry::CrossStoreIdRegistry;
pub use types::{
    CanonicalId, CollisionRecord, EntityIdMapping, IdentitySnapshot, KnownIds, Resolution,
    StoreIds, StoreKind,
};
