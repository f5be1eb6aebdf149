//! Cache policies and typed keys.
//!
//! Every cached value is addressed by a [`CacheKey`]: a [`PolicyTag`] naming
//! its logical category plus a free-form key within that category. The tag
//! selects the TTL / size policy, so nothing is inferred from string prefixes.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Logical category of cached data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTag {
    Videos,
    UserProfile,
    Ads,
    Feed,
    Comments,
    Revenue,
    /// Application-defined category.
    Custom(String),
}

impl PolicyTag {
    pub fn as_str(&self) -> &str {
        match self {
            PolicyTag::Videos => "videos",
            PolicyTag::UserProfile => "user_profile",
            PolicyTag::Ads => "ads",
            PolicyTag::Feed => "feed",
            PolicyTag::Comments => "comments",
            PolicyTag::Revenue => "revenue",
            PolicyTag::Custom(name) => name,
        }
    }

    /// Resolve a tag name, treating unknown names as custom tags.
    pub fn from_name(name: &str) -> Self {
        match name {
            "videos" => PolicyTag::Videos,
            "user_profile" => PolicyTag::UserProfile,
            "ads" => PolicyTag::Ads,
            "feed" => PolicyTag::Feed,
            "comments" => PolicyTag::Comments,
            "revenue" => PolicyTag::Revenue,
            other => PolicyTag::Custom(other.to_string()),
        }
    }

    /// The built-in categories.
    pub fn builtin() -> [PolicyTag; 6] {
        [
            PolicyTag::Videos,
            PolicyTag::UserProfile,
            PolicyTag::Ads,
            PolicyTag::Feed,
            PolicyTag::Comments,
            PolicyTag::Revenue,
        ]
    }
}

impl std::fmt::Display for PolicyTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyTag {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PolicyTag::from_name(s))
    }
}

/// A typed cache address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub tag: PolicyTag,
    pub key: String,
}

impl CacheKey {
    pub fn new(tag: PolicyTag, key: impl Into<String>) -> Self {
        Self {
            tag,
            key: key.into(),
        }
    }

    /// The blob-store key for this entry: `<tag>/<key>`.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.tag, self.key)
    }

    /// Inverse of [`CacheKey::storage_key`].
    pub fn from_storage_key(s: &str) -> Option<Self> {
        let (tag, key) = s.split_once('/')?;
        if tag.is_empty() {
            return None;
        }
        Some(Self::new(PolicyTag::from_name(tag), key))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tag, self.key)
    }
}

/// TTL and size limits for one policy tag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Age after which an entry is expired.
    #[serde(with = "duration_secs")]
    pub max_age: Duration,

    /// Memory-tier entry limit for this tag.
    pub max_entries: usize,

    /// Serve aging entries while refreshing them in the background.
    pub stale_while_revalidate: bool,
}

impl CachePolicy {
    pub const fn new(max_age: Duration, max_entries: usize, stale_while_revalidate: bool) -> Self {
        Self {
            max_age,
            max_entries,
            stale_while_revalidate,
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10 * 60), 100, true)
    }
}

/// Per-tag policy lookup with a fallback for unknown tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTable {
    /// Policies keyed by tag name.
    pub policies: HashMap<String, CachePolicy>,

    /// Used for tags with no explicit entry.
    pub fallback: CachePolicy,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let min = |m: u64| Duration::from_secs(m * 60);
        let policies = [
            (PolicyTag::Videos, CachePolicy::new(min(15), 200, true)),
            (PolicyTag::UserProfile, CachePolicy::new(min(30), 50, true)),
            (PolicyTag::Ads, CachePolicy::new(min(10), 100, false)),
            (PolicyTag::Feed, CachePolicy::new(min(5), 100, true)),
            (PolicyTag::Comments, CachePolicy::new(min(5), 200, true)),
            (PolicyTag::Revenue, CachePolicy::new(min(60), 20, true)),
        ]
        .into_iter()
        .map(|(tag, policy)| (tag.to_string(), policy))
        .collect();

        Self {
            policies,
            fallback: CachePolicy::default(),
        }
    }
}

impl PolicyTable {
    pub fn get(&self, tag: &PolicyTag) -> CachePolicy {
        self.policies
            .get(tag.as_str())
            .copied()
            .unwrap_or(self.fallback)
    }

    /// Override the policy for one tag.
    pub fn set(&mut self, tag: &PolicyTag, policy: CachePolicy) {
        self.policies.insert(tag.to_string(), policy);
    }

    /// Builder-style [`PolicyTable::set`].
    pub fn with(mut self, tag: &PolicyTag, policy: CachePolicy) -> Self {
        self.set(tag, policy);
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
