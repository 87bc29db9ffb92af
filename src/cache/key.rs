//! Cache Key Codec
//!
//! Normalizes logical keys into physical keys and derives the reserved keys
//! used for tag membership bookkeeping.

/// Marker for tag-index keys.
///
/// Contains upper-case characters, which [`KeyCodec::normalize`] never emits,
/// so a tag-index key can never equal a normalized cache key.
const TAG_INDEX_MARKER: &str = "TAG::";

/// Key codec scoped to a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    /// Prefix applied to physical keys in shared stores
    namespace: String,
}

impl KeyCodec {
    /// Create a codec for the given namespace (e.g. `"cache:"`)
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Normalize a raw key: trim, lower-case, collapse whitespace runs
    pub fn normalize(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        for (i, word) in raw.split_whitespace().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.extend(word.chars().flat_map(char::to_lowercase));
        }
        out
    }

    /// Reserved key holding the member set of a tag
    pub fn tag_index_key(tag: &str) -> String {
        format!("{}{}", TAG_INDEX_MARKER, Self::normalize(tag))
    }

    /// True if the key was produced by [`KeyCodec::tag_index_key`]
    pub fn is_tag_index_key(key: &str) -> bool {
        key.starts_with(TAG_INDEX_MARKER)
    }

    /// Namespace prefix
    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Physical key for a normalized key
    #[inline]
    pub fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// Physical key for a tag index
    pub fn namespaced_tag(&self, tag: &str) -> String {
        self.namespaced(&Self::tag_index_key(tag))
    }

    /// Strip the namespace from a physical key, if it carries it
    pub fn strip<'a>(&self, physical: &'a str) -> Option<&'a str> {
        physical.strip_prefix(self.namespace.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_collapses_equivalent_keys() {
        assert_eq!(KeyCodec::normalize("  User:42 "), "user:42");
        assert_eq!(KeyCodec::normalize("Chat\t\tInit   Model"), "chat init model");
        assert_eq!(
            KeyCodec::normalize("chat init model"),
            KeyCodec::normalize(" CHAT\ninit  MODEL")
        );
    }

    #[test]
    fn test_normalize_empty() {
        assert_eq!(KeyCodec::normalize(""), "");
        assert_eq!(KeyCodec::normalize(" \t\n "), "");
    }

    #[test]
    fn test_tag_index_key() {
        assert_eq!(KeyCodec::tag_index_key(" Init-Chat "), "TAG::init-chat");
        assert!(KeyCodec::is_tag_index_key("TAG::init-chat"));
        assert!(!KeyCodec::is_tag_index_key("tag::init-chat"));
    }

    #[test]
    fn test_namespacing() {
        let codec = KeyCodec::new("cache:");
        assert_eq!(codec.namespaced("user:42"), "cache:user:42");
        assert_eq!(codec.namespaced_tag("g"), "cache:TAG::g");
        assert_eq!(codec.strip("cache:user:42"), Some("user:42"));
        assert_eq!(codec.strip("other:user:42"), None);
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(raw in "\\PC{0,40}") {
            let once = KeyCodec::normalize(&raw);
            prop_assert_eq!(KeyCodec::normalize(&once), once.clone());
        }

        #[test]
        fn prop_tag_keys_never_collide(raw in "\\PC{0,40}", tag in "\\PC{0,20}") {
            let key = KeyCodec::normalize(&raw);
            prop_assert_ne!(key, KeyCodec::tag_index_key(&tag));
        }
    }
}
