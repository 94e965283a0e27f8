//! The timeline event model and its identity rules.
//!
//! Events enter the engine through a transport adapter and are immediately
//! converted into [`TimelineEvent`], a closed structural type. Unknown or
//! malformed shapes are rejected here, never inside the consolidator.
//!
//! # Identity
//!
//! - Immutable kinds are identified by their event ID.
//! - Addressable kinds (`30000..40000`) are identified by
//!   `(kind, pubkey, first "d" tag value)`. Only the newest version of an
//!   address is retained; ties on `created_at` go to the greater ID.

use std::cmp::Ordering;
use std::ops::Range;

use nostr::JsonUtil; // Required for Event::from_json()
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reserved kind range for addressable (parameterized replaceable) events.
pub const ADDRESSABLE_KINDS: Range<u16> = 30000..40000;

/// Returns `true` if events of this kind are identified by address.
pub fn is_addressable(kind: u16) -> bool {
    ADDRESSABLE_KINDS.contains(&kind)
}

/// An immutable, signed, timestamped event.
///
/// Field names serialize to the NIP-01 wire names so the same JSON can be
/// handed to the `nostr` crate for signature checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// 32-byte event ID, lowercase hex.
    pub id: String,
    /// Signer public key, lowercase hex.
    #[serde(rename = "pubkey")]
    pub author_key: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Event kind.
    pub kind: u16,
    /// Ordered tag lists.
    pub tags: Vec<Vec<String>>,
    /// Opaque content.
    pub content: String,
    /// Schnorr signature, lowercase hex.
    #[serde(rename = "sig")]
    pub signature: String,
}

/// The dedup/replace key deciding whether two events are the same logical post.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventIdentity {
    /// Immutable kinds: the event ID.
    Id(String),
    /// Addressable kinds: `(kind, author, d)`.
    Address {
        kind: u16,
        author: String,
        d: String,
    },
}

impl EventIdentity {
    /// Whether this identity belongs to the addressable regime.
    pub fn is_address(&self) -> bool {
        matches!(self, Self::Address { .. })
    }
}

impl std::fmt::Display for EventIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Address { kind, author, d } => write!(f, "{kind}:{author}:{d}"),
        }
    }
}

impl TimelineEvent {
    /// Parse and validate an event from NIP-01 JSON.
    ///
    /// Checks field shapes only; authenticity is verified separately with
    /// [`verify_signature`].
    pub fn from_json(json: &str) -> Result<Self> {
        let event: Self = serde_json::from_str(json)?;
        event.validate()?;
        Ok(event)
    }

    /// Validate hex field shapes.
    pub fn validate(&self) -> Result<()> {
        check_hex("id", &self.id, 64)?;
        check_hex("pubkey", &self.author_key, 64)?;
        check_hex("sig", &self.signature, 128)?;
        if self.tags.iter().any(|t| t.is_empty()) {
            return Err(Error::InvalidField {
                field: "tags",
                reason: "empty tag".to_string(),
            });
        }
        Ok(())
    }

    /// Value of the first tag with the given name, if any.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// Whether this event is of an addressable kind.
    pub fn is_addressable(&self) -> bool {
        is_addressable(self.kind)
    }

    /// Compute this event's identity.
    ///
    /// An addressable event without a `d` tag uses the empty string.
    pub fn identity(&self) -> EventIdentity {
        if self.is_addressable() {
            EventIdentity::Address {
                kind: self.kind,
                author: self.author_key.clone(),
                d: self.first_tag_value("d").unwrap_or_default().to_string(),
            }
        } else {
            EventIdentity::Id(self.id.clone())
        }
    }

    /// Compare by `(created_at, id)`; `Greater` means more recent.
    pub fn cmp_recency(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Whether this version should replace `other` for the same identity.
    pub fn supersedes(&self, other: &Self) -> bool {
        self.cmp_recency(other) == Ordering::Greater
    }
}

impl From<&nostr::Event> for TimelineEvent {
    fn from(event: &nostr::Event) -> Self {
        Self {
            id: event.id.to_hex(),
            author_key: event.pubkey.to_hex(),
            created_at: event.created_at.as_u64(),
            kind: event.kind.as_u16(),
            tags: event
                .tags
                .iter()
                .map(|tag| tag.as_slice().iter().map(|s| s.to_string()).collect())
                .collect(),
            content: event.content.clone(),
            signature: event.sig.to_string(),
        }
    }
}

/// Verify an event's ID and Schnorr signature per NIP-01.
///
/// Any parse or crypto error counts as unverified.
pub fn verify_signature(event: &TimelineEvent) -> bool {
    let Ok(json) = serde_json::to_string(event) else {
        return false;
    };
    match nostr::Event::from_json(&json) {
        Ok(parsed) => parsed.verify_id() && parsed.verify_signature(),
        Err(e) => {
            tracing::debug!(id = %event.id, error = %e, "event failed to parse for verification");
            false
        }
    }
}

fn check_hex(field: &'static str, value: &str, len: usize) -> Result<()> {
    if value.len() != len {
        return Err(Error::InvalidField {
            field,
            reason: format!("expected {len} hex characters, got {}", value.len()),
        });
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(Error::InvalidField {
            field,
            reason: "not lowercase hex".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind, Tag};

    fn event(id: &str, kind: u16, created_at: u64, tags: Vec<Vec<&str>>) -> TimelineEvent {
        TimelineEvent {
            id: id.to_string(),
            author_key: "a".repeat(64),
            created_at,
            kind,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: String::new(),
            signature: "0".repeat(128),
        }
    }

    #[test]
    fn test_immutable_identity_is_id() {
        let e = event("abc", 1, 10, vec![vec!["d", "ignored"]]);
        assert_eq!(e.identity(), EventIdentity::Id("abc".to_string()));
        assert!(!e.identity().is_address());
    }

    #[test]
    fn test_addressable_identity_uses_first_d_tag() {
        let e = event(
            "abc",
            30023,
            10,
            vec![vec!["t", "x"], vec!["d", "first"], vec!["d", "second"]],
        );
        assert_eq!(
            e.identity(),
            EventIdentity::Address {
                kind: 30023,
                author: "a".repeat(64),
                d: "first".to_string(),
            }
        );
    }

    #[test]
    fn test_addressable_without_d_tag_uses_empty() {
        let e = event("abc", 30000, 10, vec![]);
        match e.identity() {
            EventIdentity::Address { d, .. } => assert_eq!(d, ""),
            other => panic!("unexpected identity {other:?}"),
        }
    }

    #[test]
    fn test_addressable_range_bounds() {
        assert!(!is_addressable(29999));
        assert!(is_addressable(30000));
        assert!(is_addressable(39999));
        assert!(!is_addressable(40000));
    }

    #[test]
    fn test_supersedes_tie_breaks_on_id() {
        let older = event("aa", 30023, 100, vec![vec!["d", "x"]]);
        let newer = event("ab", 30023, 100, vec![vec!["d", "x"]]);
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
        assert!(!newer.supersedes(&newer));
    }

    #[test]
    fn test_from_json_rejects_bad_pubkey() {
        let json = r#"{"id":"4ff2236ceb2fdc6dee6317cd0b841f3f020ac985bb3f99f7f4c1f973ec28d06b","pubkey":"xyz","created_at":1,"kind":1,"tags":[],"content":"","sig":"00"}"#;
        let err = TimelineEvent::from_json(json).unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "pubkey", .. }));
    }

    #[test]
    fn test_from_json_rejects_unknown_shape() {
        assert!(TimelineEvent::from_json(r#"{"id":1}"#).is_err());
        assert!(TimelineEvent::from_json("not json").is_err());
    }

    #[test]
    fn test_signed_event_verifies() {
        let keys = Keys::generate();
        let signed = EventBuilder::new(Kind::TextNote, "hello")
            .tag(Tag::hashtag("tessera"))
            .sign_with_keys(&keys)
            .unwrap();

        let event = TimelineEvent::from(&signed);
        assert!(event.validate().is_ok());
        assert!(verify_signature(&event));
        assert_eq!(event.first_tag_value("t"), Some("tessera"));
    }

    #[test]
    fn test_conversion_keeps_wire_fields() {
        let keys = Keys::generate();
        let signed = EventBuilder::new(Kind::from(30023u16), "body")
            .tag(Tag::identifier("post"))
            .custom_created_at(nostr::Timestamp::from(1_700_000_123))
            .sign_with_keys(&keys)
            .unwrap();

        let event = TimelineEvent::from(&signed);
        assert_eq!(event.created_at, 1_700_000_123);
        assert_eq!(event.kind, 30023);
        assert_eq!(event.author_key, keys.public_key().to_hex());
        assert_eq!(event.id, signed.id.to_hex());
        assert_eq!(event.first_tag_value("d"), Some("post"));
    }

    #[test]
    fn test_tampered_event_fails_verification() {
        let keys = Keys::generate();
        let signed = EventBuilder::new(Kind::TextNote, "hello")
            .sign_with_keys(&keys)
            .unwrap();

        let mut event = TimelineEvent::from(&signed);
        event.content = "goodbye".to_string();
        assert!(!verify_signature(&event));
    }

    #[test]
    fn test_json_round_trip_uses_wire_names() {
        let e = event(&"1".repeat(64), 1, 5, vec![]);
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"pubkey\""));
        assert!(json.contains("\"sig\""));
    }
}
