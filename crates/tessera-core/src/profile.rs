//! Kind 0 author metadata.

use serde::{Deserialize, Serialize};

/// Kind number of profile metadata events.
pub const PROFILE_KIND: u16 = 0;

/// Author metadata carried in the content of a kind 0 event.
///
/// Equality is field-wise, so `updated_at` takes part: a newer kind 0 event
/// counts as a change even when its fields repeat the old ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileMetadata {
    pub name: Option<String>,
    /// Preferred over `name` when labelling the author.
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
    pub banner: Option<String>,
    /// NIP-05 internet identifier.
    pub nip05: Option<String>,
    pub lud16: Option<String>,
    pub website: Option<String>,
    /// `created_at` of the source event, stamped by the fetcher.
    pub updated_at: u64,
}

impl ProfileMetadata {
    /// Parse kind 0 content. Anything unparseable is treated as no profile.
    pub fn from_json(content: &str) -> Option<Self> {
        serde_json::from_str(content)
            .inspect_err(|e| tracing::debug!(error = %e, "ignoring malformed profile content"))
            .ok()
    }

    /// Best human label: display name, then name, then NIP-05. Blank values
    /// are skipped.
    pub fn label(&self) -> Option<&str> {
        [&self.display_name, &self.name, &self.nip05]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .map(str::trim)
            .find(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_precedence() {
        let meta = ProfileMetadata::from_json(
            r#"{"name":"jb55","display_name":"Will","nip05":"jb55@jb55.com"}"#,
        )
        .unwrap();
        assert_eq!(meta.label(), Some("Will"));

        let meta = ProfileMetadata::from_json(r#"{"display_name":"  ","name":"jb55"}"#).unwrap();
        assert_eq!(meta.label(), Some("jb55"));

        let meta = ProfileMetadata::from_json(r#"{"nip05":"_@fiatjaf.com"}"#).unwrap();
        assert_eq!(meta.label(), Some("_@fiatjaf.com"));

        assert_eq!(ProfileMetadata::default().label(), None);
    }

    #[test]
    fn test_malformed_content_is_absent() {
        assert!(ProfileMetadata::from_json("").is_none());
        assert!(ProfileMetadata::from_json(r#"{"name":7}"#).is_none());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let meta = ProfileMetadata::from_json(r#"{"name":"bot","bot":true}"#).unwrap();
        assert_eq!(meta.name.as_deref(), Some("bot"));
        assert_eq!(meta.updated_at, 0);
    }

    #[test]
    fn test_equality_includes_update_time() {
        let a = ProfileMetadata::from_json(r#"{"name":"bob"}"#).unwrap();
        let mut b = a.clone();
        assert_eq!(a, b);
        b.updated_at = 10;
        assert_ne!(a, b);
    }
}
