//! Response cache: lets a repeated question skip the engine.
//!
//! Lookup is two-step: an exact match on the case- and whitespace-normalized
//! query, then, for short queries only, a fuzzy match by word-set Jaccard
//! similarity against every cached key in insertion order.

use llamachat_config::CacheConfig;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct Entries {
    /// (normalized key, response) in insertion order
    ordered: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

pub struct ResponseCache {
    config: CacheConfig,
    entries: RwLock<Entries>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(Entries::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Remember `response` for `query`, overwriting an earlier answer.
    pub async fn put(&self, query: &str, response: &str) {
        if !self.config.enabled {
            return;
        }
        let key = normalize(query);
        if key.is_empty() {
            return;
        }
        let mut entries = self.entries.write().await;
        match entries.index.get(&key).copied() {
            Some(i) => entries.ordered[i].1 = response.to_string(),
            None => {
                let i = entries.ordered.len();
                entries.ordered.push((key.clone(), response.to_string()));
                entries.index.insert(key, i);
            }
        }
    }

    /// The cached response for `query`, exact or fuzzy.
    pub async fn find_similar_query(&self, query: &str) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        let key = normalize(query);
        let entries = self.entries.read().await;

        if let Some(&i) = entries.index.get(&key) {
            debug!(query = %key, "Response cache exact hit");
            return Some(entries.ordered[i].1.clone());
        }

        if query.chars().count() >= self.config.fuzzy_max_len {
            return None;
        }

        let words = word_set(query);
        if words.is_empty() {
            return None;
        }
        entries.ordered.iter().find_map(|(cached, response)| {
            let similarity = jaccard(&words, &word_set(cached));
            (similarity >= self.config.fuzzy_threshold).then(|| {
                debug!(query = %key, cached = %cached, similarity, "Response cache fuzzy hit");
                response.clone()
            })
        })
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.ordered.clear();
        entries.index.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.ordered.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.ordered.is_empty()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

/// Lowercase and collapse whitespace.
fn normalize(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

const CONTRACTIONS: [(&str, &str); 7] = [
    ("n't", " not"),
    ("'s", " is"),
    ("'re", " are"),
    ("'m", " am"),
    ("'ll", " will"),
    ("'ve", " have"),
    ("'d", " would"),
];

/// Words used for fuzzy comparison: contractions expanded, arithmetic
/// operators spelled out, punctuation dropped.
fn word_set(text: &str) -> HashSet<String> {
    let mut text = text.to_lowercase().replace('\u{2019}', "'");
    for (short, long) in CONTRACTIONS {
        text = text.replace(short, long);
    }
    let text = text
        .replace('+', " plus ")
        .replace('*', " times ")
        .replace('=', " equals ");
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exact_hit_ignores_case_and_spacing() {
        let cache = ResponseCache::default();
        cache.put("hello", "hi there").await;
        assert_eq!(
            cache.find_similar_query("Hello ").await.as_deref(),
            Some("hi there")
        );
        assert_eq!(
            cache.find_similar_query("  HELLO  ").await.as_deref(),
            Some("hi there")
        );
    }

    #[tokio::test]
    async fn fuzzy_hit_for_short_paraphrase() {
        let cache = ResponseCache::default();
        cache.put("what's 2 plus 2", "4").await;
        assert_eq!(cache.find_similar_query("what is 2+2").await.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn long_queries_only_match_exactly() {
        let cache = ResponseCache::default();
        cache.put("tell me about the weather", "sunny").await;
        // 25 chars, same words reordered
        assert!(
            cache
                .find_similar_query("about the weather tell me")
                .await
                .is_none()
        );
        assert!(
            cache
                .find_similar_query("Tell me about the  weather")
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn below_threshold_misses() {
        let cache = ResponseCache::default();
        cache.put("what is rust", "a language").await;
        // {what,is,go} vs {what,is,rust}: 2/4
        assert!(cache.find_similar_query("what is go").await.is_none());
    }

    #[tokio::test]
    async fn first_qualifying_entry_wins() {
        let cache = ResponseCache::default();
        cache.put("hi there friend", "first").await;
        cache.put("there hi friend", "second").await;
        assert_eq!(
            cache.find_similar_query("friend hi there").await.as_deref(),
            Some("first")
        );
    }

    #[tokio::test]
    async fn overwrite_keeps_position() {
        let cache = ResponseCache::default();
        cache.put("q", "a").await;
        cache.put("Q", "b").await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.find_similar_query("q").await.as_deref(), Some("b"));
        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn disabled_cache_never_hits() {
        let cache = ResponseCache::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        cache.put("hello", "hi").await;
        assert!(cache.find_similar_query("hello").await.is_none());
    }

    #[test]
    fn word_set_normalization() {
        let words = word_set("What's 2+2?");
        let expected: HashSet<String> =
            ["what", "is", "2", "plus"].iter().map(|s| s.to_string()).collect();
        assert_eq!(words, expected);
        assert!(word_set("I can't").contains("not"));
    }
}
