//! Core types, identity rules and validation for the tessera timeline engine.
//!
//! This crate provides:
//! - The closed [`TimelineEvent`] model and its [`EventIdentity`] rules
//! - Event validation and signature checks (per NIP-01) via the nostr crate
//! - Profile metadata parsing
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;
mod profile;

pub use error::{Error, Result};
pub use event::{
    ADDRESSABLE_KINDS, EventIdentity, TimelineEvent, is_addressable, verify_signature,
};
pub use profile::{PROFILE_KIND, ProfileMetadata};
