use crate::ingest::RunSummary;
use redis::AsyncCommands;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Replay keys are scoped per company so two tenants can reuse a key.
pub fn scoped_key(company_id: Uuid, key: &str) -> String {
    format!("buybox:idem:{company_id}:{key}")
}

pub async fn redis_get(client: &redis::Client, key: &str) -> Option<RunSummary> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s: Option<String> = conn.get(key).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set(client: &redis::Client, key: &str, value: &RunSummary, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}

/// In-process replay store used when Redis is not configured. Entries
/// expire after the same TTL the Redis keys carry.
pub struct ReplayCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, RunSummary)>>,
}

impl ReplayCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<RunSummary> {
        let mut guard = self.entries.lock().await;
        let ttl = self.ttl;
        guard.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        guard.get(key).map(|(_, summary)| summary.clone())
    }

    pub async fn insert(&self, key: String, summary: RunSummary) {
        self.entries
            .lock()
            .await
            .insert(key, (Instant::now(), summary));
    }
}
