use crate::models::AutoCaptionResponse;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};

/// In-memory fallback when Redis is not configured. Bounded: once at
/// capacity, the oldest entry is evicted on insert.
pub struct MemoryCache {
    entries: HashMap<String, AutoCaptionResponse>,
    order: VecDeque<String>,
    capacity: usize,
}

impl MemoryCache {
    pub fn from_env() -> Self {
        let capacity = std::env::var("IDEMPOTENCY_MAX_ENTRIES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(1024);
        Self::with_capacity(capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn get(&self, key: &str) -> Option<AutoCaptionResponse> {
        self.entries.get(key).cloned()
    }

    pub fn insert(&mut self, key: String, value: AutoCaptionResponse) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key, value);
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }
}

pub async fn redis_get(client: &redis::Client, key: &str) -> Option<AutoCaptionResponse> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s: Option<String> = conn.get(key).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set(
    client: &redis::Client,
    key: &str,
    value: &AutoCaptionResponse,
    ttl_secs: usize,
) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs as u64).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(tag: &str) -> AutoCaptionResponse {
        AutoCaptionResponse {
            org_id: tag.to_string(),
            posts: Vec::new(),
        }
    }

    #[test]
    fn cache_evicts_oldest_entry_once_at_capacity() {
        let mut cache = MemoryCache::with_capacity(2);
        cache.insert("a".into(), response("a"));
        cache.insert("b".into(), response("b"));
        cache.insert("c".into(), response("c"));

        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").expect("kept").org_id, "b");
        assert_eq!(cache.get("c").expect("kept").org_id, "c");
    }

    #[test]
    fn reinserting_an_existing_key_does_not_evict() {
        let mut cache = MemoryCache::with_capacity(2);
        cache.insert("a".into(), response("a"));
        cache.insert("b".into(), response("b"));
        cache.insert("a".into(), response("a2"));

        assert_eq!(cache.get("a").expect("updated").org_id, "a2");
        assert_eq!(cache.get("b").expect("kept").org_id, "b");
    }
}
