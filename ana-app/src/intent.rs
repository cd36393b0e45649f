//! Closed intent taxonomy, the classification contract, and the short-TTL
//! per-user intent cache consulted before invoking the classifier.

use ana_channels::UserKey;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// The six-label taxonomy. Classification output is validated against this
/// enum; anything unrecognized collapses to `Unknown` (fail-closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    Scheduling,
    Qualification,
    Documentation,
    HumanHandoff,
    Unknown,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Greeting,
        Intent::Scheduling,
        Intent::Qualification,
        Intent::Documentation,
        Intent::HumanHandoff,
        Intent::Unknown,
    ];

    pub fn as_label(&self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::Scheduling => "scheduling",
            Intent::Qualification => "qualification",
            Intent::Documentation => "documentation",
            Intent::HumanHandoff => "human_handoff",
            Intent::Unknown => "unknown",
        }
    }

    /// Total mapping from an arbitrary label string. Never rejects input.
    pub fn from_label(label: &str) -> Intent {
        match label.trim().to_ascii_lowercase().as_str() {
            "greeting" => Intent::Greeting,
            "scheduling" => Intent::Scheduling,
            "qualification" => Intent::Qualification,
            "documentation" => Intent::Documentation,
            "human_handoff" => Intent::HumanHandoff,
            _ => Intent::Unknown,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn from_label(label: &str) -> Confidence {
        match label.trim().to_ascii_lowercase().as_str() {
            "high" => Confidence::High,
            "medium" => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedIntent {
    pub intent: Intent,
    pub confidence: Confidence,
    #[serde(default)]
    pub entities: serde_json::Map<String, serde_json::Value>,
}

impl ClassifiedIntent {
    /// The degraded result used whenever classification fails or returns
    /// something malformed.
    pub fn unknown() -> Self {
        Self {
            intent: Intent::Unknown,
            confidence: Confidence::Low,
            entities: serde_json::Map::new(),
        }
    }
}

/// Classification collaborator. Must stay well under the cache TTL or caching
/// provides no benefit.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<ClassifiedIntent>;
}

struct CachedIntent {
    classified: ClassifiedIntent,
    expires_at: Instant,
}

/// Short-TTL memo of the last classification per user key. Entries expire
/// lazily on read; `invalidate` is idempotent.
pub struct IntentCache {
    entries: DashMap<UserKey, CachedIntent>,
    ttl: Duration,
}

impl IntentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &UserKey) -> Option<ClassifiedIntent> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                if entry.expires_at > Instant::now() {
                    return Some(entry.classified.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn put(&self, key: UserKey, classified: ClassifiedIntent) {
        self.entries.insert(
            key,
            CachedIntent {
                classified,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &UserKey) {
        self.entries.remove(key);
    }

    pub fn contains(&self, key: &UserKey) -> bool {
        self.get(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_labels_collapse_to_unknown() {
        assert_eq!(Intent::from_label("greeting"), Intent::Greeting);
        assert_eq!(Intent::from_label("  Human_Handoff "), Intent::HumanHandoff);
        assert_eq!(Intent::from_label("purchase_order"), Intent::Unknown);
        assert_eq!(Intent::from_label(""), Intent::Unknown);
    }

    #[test]
    fn every_label_round_trips() {
        for intent in Intent::ALL {
            assert_eq!(Intent::from_label(intent.as_label()), intent);
        }
    }

    #[test]
    fn confidence_defaults_to_low() {
        assert_eq!(Confidence::from_label("HIGH"), Confidence::High);
        assert_eq!(Confidence::from_label("garbage"), Confidence::Low);
    }

    #[test]
    fn cache_hit_then_invalidate() {
        let cache = IntentCache::new(Duration::from_secs(60));
        let key = UserKey::new("5521999999999");
        assert!(cache.get(&key).is_none());

        cache.put(key.clone(), ClassifiedIntent::unknown());
        assert!(cache.contains(&key));

        cache.invalidate(&key);
        assert!(!cache.contains(&key));
        // Invalidating an absent entry is a no-op.
        cache.invalidate(&key);
    }

    #[test]
    fn cache_entries_expire() {
        let cache = IntentCache::new(Duration::from_millis(0));
        let key = UserKey::new("5521988887777");
        cache.put(key.clone(), ClassifiedIntent::unknown());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key).is_none());
    }
}
