//! Refreshable in-memory copy of the remote registry dataset.
//!
//! The dataset is a JSON array whose elements are either pages
//! (an object holding a record array under the page field) or bare
//! record objects. Both shapes may be mixed in one payload.
//!
//! Readers always get a complete [`DatasetSnapshot`] behind an `Arc`;
//! a refresh builds a new snapshot off to the side and swaps it in only
//! once it parsed and contained records.

use crate::config::DatasetConfig;
use crate::fetcher::{DatasetFetcher, FetchError};
use crate::index::RecordIndex;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// One registry entry. The two identifiers are lifted out for matching;
/// every original field stays available in `fields` for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub fields: Map<String, Value>,
}

impl DatasetRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Whether the identifier matched through the subject field
    pub fn is_subject(&self, identifier: &str) -> bool {
        self.subject_id.as_deref() == Some(identifier.trim())
    }
}

/// Field names used to interpret the payload
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub page_field: String,
    pub subject_field: String,
    pub agent_field: String,
}

impl From<&DatasetConfig> for DatasetLayout {
    fn from(config: &DatasetConfig) -> Self {
        Self {
            page_field: config.page_field.clone(),
            subject_field: config.subject_field.clone(),
            agent_field: config.agent_field.clone(),
        }
    }
}

impl Default for DatasetLayout {
    fn default() -> Self {
        Self::from(&DatasetConfig::default())
    }
}

impl DatasetLayout {
    fn is_record(&self, object: &Map<String, Value>) -> bool {
        object.contains_key(&self.subject_field) || object.contains_key(&self.agent_field)
    }

    fn record(&self, fields: Map<String, Value>) -> DatasetRecord {
        DatasetRecord {
            subject_id: fields.get(&self.subject_field).and_then(identifier_text),
            agent_id: fields.get(&self.agent_field).and_then(identifier_text),
            fields,
        }
    }
}

/// Identifiers arrive as strings or bare numbers
fn identifier_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Parsed payload: all records in encounter order
#[derive(Debug, Default)]
pub struct Dataset {
    pub records: Vec<Arc<DatasetRecord>>,
    pub pages: usize,
}

impl Dataset {
    pub fn parse(bytes: &[u8], layout: &DatasetLayout) -> Result<Self, FetchError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

        let Value::Array(elements) = value else {
            return Err(FetchError::Parse("expected a top-level array".to_string()));
        };

        let mut dataset = Dataset::default();

        for element in elements {
            let Value::Object(mut object) = element else {
                continue;
            };

            if matches!(object.get(&layout.page_field), Some(Value::Array(_))) {
                if let Some(Value::Array(items)) = object.remove(&layout.page_field) {
                    dataset.pages += 1;
                    for item in items {
                        if let Value::Object(fields) = item {
                            dataset.records.push(Arc::new(layout.record(fields)));
                        }
                    }
                }
            } else if layout.is_record(&object) {
                dataset.records.push(Arc::new(layout.record(object)));
            }
        }

        if dataset.records.is_empty() {
            return Err(FetchError::Empty);
        }

        Ok(dataset)
    }
}

/// An immutable, fully loaded copy of the dataset plus its index
#[derive(Debug)]
pub struct DatasetSnapshot {
    pages: usize,
    index: RecordIndex,
    refreshed_at: Option<Instant>,
    fetched_at: Option<DateTime<Utc>>,
    /// Invalidation generation current when the fetch started
    generation: u64,
}

impl DatasetSnapshot {
    pub fn empty() -> Self {
        Self {
            pages: 0,
            index: RecordIndex::default(),
            refreshed_at: None,
            fetched_at: None,
            generation: 0,
        }
    }

    fn loaded(dataset: Dataset, generation: u64) -> Self {
        Self {
            pages: dataset.pages,
            index: RecordIndex::build(&dataset.records),
            refreshed_at: Some(Instant::now()),
            fetched_at: Some(Utc::now()),
            generation,
        }
    }

    pub fn search(&self, identifier: &str) -> Vec<Arc<DatasetRecord>> {
        self.index.lookup(identifier)
    }

    pub fn is_loaded(&self) -> bool {
        self.refreshed_at.is_some()
    }

    pub fn record_count(&self) -> usize {
        self.index.len()
    }

    pub fn page_count(&self) -> usize {
        self.pages
    }

    pub fn age(&self) -> Option<Duration> {
        self.refreshed_at.map(|t| t.elapsed())
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }
}

/// Cache state reported by the health endpoint and CLI
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub loaded: bool,
    pub pages: usize,
    pub records: usize,
    pub identifiers: usize,
    pub age_secs: Option<u64>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub fetch_count: u64,
    pub last_error: Option<String>,
}

/// Owns the current snapshot and decides when to refetch it
pub struct DatasetCache {
    url: String,
    layout: DatasetLayout,
    refresh_interval: Duration,
    fetch_timeout: Duration,
    fetcher: Arc<dyn DatasetFetcher>,
    current: RwLock<Arc<DatasetSnapshot>>,
    /// Bumped by every invalidate()
    invalidations: AtomicU64,
    /// Held for the whole duration of a refresh
    refresh_lock: Mutex<()>,
    /// Bumped after every completed refresh attempt
    attempts: AtomicU64,
    last_outcome: RwLock<Option<Result<(), FetchError>>>,
    fetch_count: AtomicU64,
}

impl DatasetCache {
    pub fn new(config: &DatasetConfig, fetcher: Arc<dyn DatasetFetcher>) -> Self {
        Self {
            url: config.url.clone(),
            layout: DatasetLayout::from(config),
            refresh_interval: config.refresh_interval(),
            fetch_timeout: config.fetch_timeout(),
            fetcher,
            current: RwLock::new(Arc::new(DatasetSnapshot::empty())),
            invalidations: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
            attempts: AtomicU64::new(0),
            last_outcome: RwLock::new(None),
            fetch_count: AtomicU64::new(0),
        }
    }

    /// Current snapshot. Never triggers a refresh.
    pub async fn snapshot(&self) -> Arc<DatasetSnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Make the next [`ensure_fresh`](Self::ensure_fresh) refetch regardless of age
    pub fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    async fn is_fresh(&self) -> bool {
        let current = self.current.read().await;
        if current.generation != self.invalidations.load(Ordering::SeqCst) {
            return false;
        }
        // A zero interval disables age-based expiry
        match current.age() {
            Some(_) if self.refresh_interval.is_zero() => true,
            Some(age) => age < self.refresh_interval,
            None => false,
        }
    }

    /// Refresh the snapshot unless it is younger than the refresh interval.
    ///
    /// Concurrent callers share one fetch: whoever arrives while a refresh is
    /// running waits for it and returns its result.
    #[instrument(skip(self))]
    pub async fn ensure_fresh(&self) -> Result<(), FetchError> {
        self.coalesced_refresh(false).await
    }

    /// Refetch regardless of age, still sharing a fetch already in flight
    #[instrument(skip(self))]
    pub async fn refresh_now(&self) -> Result<(), FetchError> {
        self.coalesced_refresh(true).await
    }

    async fn coalesced_refresh(&self, force: bool) -> Result<(), FetchError> {
        if !force && self.is_fresh().await {
            return Ok(());
        }

        let seen = self.attempts.load(Ordering::SeqCst);
        let _guard = self.refresh_lock.lock().await;

        if self.attempts.load(Ordering::SeqCst) != seen {
            debug!("Joined a refresh that completed while waiting");
            return self.last_outcome.read().await.clone().unwrap_or(Ok(()));
        }
        if !force && self.is_fresh().await {
            return Ok(());
        }

        let outcome = self.refresh().await;
        if let Err(e) = &outcome {
            warn!("Dataset refresh failed, keeping previous snapshot: {}", e);
        }

        *self.last_outcome.write().await = Some(outcome.clone());
        self.attempts.fetch_add(1, Ordering::SeqCst);

        outcome
    }

    async fn refresh(&self) -> Result<(), FetchError> {
        if self.url.is_empty() {
            return Err(FetchError::NotConfigured);
        }

        // Read before fetching: an invalidate() during the download leaves the result stale
        let generation = self.invalidations.load(Ordering::SeqCst);
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        info!("Downloading dataset from {}", self.url);

        let bytes = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch_bytes(&self.url))
            .await
            .map_err(|_| FetchError::Timeout(self.fetch_timeout.as_secs()))??;

        let size = bytes.len();
        let layout = self.layout.clone();
        let dataset = tokio::task::spawn_blocking(move || Dataset::parse(&bytes, &layout))
            .await
            .map_err(|e| FetchError::Parse(format!("parser task failed: {}", e)))??;

        let snapshot = Arc::new(DatasetSnapshot::loaded(dataset, generation));
        info!(
            "Dataset loaded: {} bytes, {} pages, {} records",
            size,
            snapshot.page_count(),
            snapshot.record_count()
        );

        *self.current.write().await = snapshot;

        Ok(())
    }

    pub async fn status(&self) -> CacheStatus {
        let snapshot = self.snapshot().await;
        let last_error = match &*self.last_outcome.read().await {
            Some(Err(e)) => Some(e.to_string()),
            _ => None,
        };

        CacheStatus {
            loaded: snapshot.is_loaded(),
            pages: snapshot.page_count(),
            records: snapshot.record_count(),
            identifiers: snapshot.index.identifier_count(),
            age_secs: snapshot.age().map(|a| a.as_secs()),
            fetched_at: snapshot.fetched_at(),
            fetch_count: self.fetch_count(),
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::testing::ScriptedFetcher;

    const MIXED: &str = r#"[
        {"Veri": [
            {"KISI_TC_KIMLIK_NO": "11111111111", "DOSYA_NO": "2023/1"},
            {"KISI_TC_KIMLIK_NO": "22222222222", "AVUKAT_TC_KIMLIK_NO": 33333333333}
        ]},
        {"KISI_TC_KIMLIK_NO": " 11111111111 ", "DOSYA_NO": "2024/7"},
        {"unrelated": true},
        "noise",
        {"Veri": []}
    ]"#;

    fn config(refresh_interval_secs: u64) -> DatasetConfig {
        DatasetConfig {
            url: "https://registry.test/data.json".to_string(),
            refresh_interval_secs,
            fetch_timeout_secs: 2,
            ..DatasetConfig::default()
        }
    }

    fn cache_with(fetcher: Arc<ScriptedFetcher>, refresh_interval_secs: u64) -> DatasetCache {
        DatasetCache::new(&config(refresh_interval_secs), fetcher)
    }

    #[test]
    fn test_parse_mixed_shapes() {
        let dataset = Dataset::parse(MIXED.as_bytes(), &DatasetLayout::default()).unwrap();

        assert_eq!(dataset.pages, 2);
        assert_eq!(dataset.records.len(), 3);
        assert_eq!(dataset.records[1].agent_id.as_deref(), Some("33333333333"));
        assert_eq!(dataset.records[2].subject_id.as_deref(), Some("11111111111"));
        // Original fields are kept untouched
        assert_eq!(
            dataset.records[2].get("KISI_TC_KIMLIK_NO"),
            Some(&Value::from(" 11111111111 "))
        );
    }

    #[test]
    fn test_parse_rejects_bad_payloads() {
        let layout = DatasetLayout::default();

        assert!(matches!(
            Dataset::parse(b"{\"Veri\": []}", &layout),
            Err(FetchError::Parse(_))
        ));
        assert!(matches!(
            Dataset::parse(b"not json", &layout),
            Err(FetchError::Parse(_))
        ));
        assert_eq!(
            Dataset::parse(b"[{\"Veri\": []}, {\"x\": 1}]", &layout).unwrap_err(),
            FetchError::Empty
        );
    }

    #[tokio::test]
    async fn test_search_spans_paged_and_flat_records_in_order() {
        let fetcher = Arc::new(ScriptedFetcher::json(MIXED));
        let cache = cache_with(fetcher, 60);
        cache.ensure_fresh().await.unwrap();

        let matches = cache.snapshot().await.search("11111111111");
        let files: Vec<_> = matches
            .iter()
            .map(|r| r.get("DOSYA_NO").and_then(|v| v.as_str()).unwrap())
            .collect();
        assert_eq!(files, vec!["2023/1", "2024/7"]);
    }

    #[tokio::test]
    async fn test_snapshot_is_empty_before_first_load() {
        let fetcher = Arc::new(ScriptedFetcher::json(MIXED));
        let cache = cache_with(fetcher.clone(), 60);

        let snapshot = cache.snapshot().await;
        assert!(!snapshot.is_loaded());
        assert_eq!(snapshot.record_count(), 0);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_fresh_cache_does_not_refetch() {
        let fetcher = Arc::new(ScriptedFetcher::json(MIXED));
        let cache = cache_with(fetcher.clone(), 60);

        for _ in 0..5 {
            cache.ensure_fresh().await.unwrap();
        }
        assert_eq!(fetcher.calls(), 1);

        cache.invalidate();
        cache.ensure_fresh().await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_zero_interval_never_expires() {
        let fetcher = Arc::new(ScriptedFetcher::json(MIXED));
        let cache = cache_with(fetcher.clone(), 0);

        cache.ensure_fresh().await.unwrap();
        cache.ensure_fresh().await.unwrap();
        assert_eq!(fetcher.calls(), 1);

        cache.refresh_now().await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stale_callers_share_one_fetch() {
        let fetcher =
            Arc::new(ScriptedFetcher::json(MIXED).with_delay(Duration::from_millis(100)));
        let cache = Arc::new(cache_with(fetcher.clone(), 60));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            tasks.spawn(async move { cache.ensure_fresh().await });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap().is_ok());
        }

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_invalidated_cache_shares_one_refetch() {
        let fetcher =
            Arc::new(ScriptedFetcher::json(MIXED).with_delay(Duration::from_millis(100)));
        let cache = Arc::new(cache_with(fetcher.clone(), 60));
        cache.ensure_fresh().await.unwrap();
        assert_eq!(fetcher.calls(), 1);

        cache.invalidate();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            tasks.spawn(async move { cache.ensure_fresh().await });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap().is_ok());
        }

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(cache.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_during_fetch_is_not_lost() {
        let fetcher =
            Arc::new(ScriptedFetcher::json(MIXED).with_delay(Duration::from_millis(200)));
        let cache = Arc::new(cache_with(fetcher.clone(), 60));

        let running = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.ensure_fresh().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.invalidate();
        running.await.unwrap().unwrap();
        assert_eq!(fetcher.calls(), 1);

        // The invalidation postdates the data that fetch returned
        cache.ensure_fresh().await.unwrap();
        assert_eq!(fetcher.calls(), 2);

        cache.ensure_fresh().await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Ok(MIXED.as_bytes().to_vec()),
            Err(FetchError::Status {
                url: "https://registry.test/data.json".to_string(),
                status: 503,
            }),
            Ok(b"[]".to_vec()),
        ]));
        let cache = cache_with(fetcher, 60);
        cache.ensure_fresh().await.unwrap();
        let before = cache.snapshot().await;

        cache.invalidate();
        let result = cache.ensure_fresh().await;
        assert!(matches!(result, Err(FetchError::Status { status: 503, .. })));
        assert!(Arc::ptr_eq(&before, &cache.snapshot().await));
        assert!(cache.status().await.last_error.is_some());

        // An empty payload is rejected the same way
        let result = cache.ensure_fresh().await;
        assert_eq!(result, Err(FetchError::Empty));
        assert_eq!(cache.snapshot().await.record_count(), 3);
    }

    #[tokio::test]
    async fn test_slow_fetch_times_out() {
        let fetcher =
            Arc::new(ScriptedFetcher::json(MIXED).with_delay(Duration::from_secs(5)));
        let mut cfg = config(60);
        cfg.fetch_timeout_secs = 1;
        let cache = DatasetCache::new(&cfg, fetcher);

        assert_eq!(cache.ensure_fresh().await, Err(FetchError::Timeout(1)));
        assert!(!cache.snapshot().await.is_loaded());
    }

    #[tokio::test]
    async fn test_missing_url_is_reported() {
        let fetcher = Arc::new(ScriptedFetcher::json(MIXED));
        let cache = DatasetCache::new(&DatasetConfig::default(), fetcher.clone());

        assert_eq!(cache.ensure_fresh().await, Err(FetchError::NotConfigured));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_readers_keep_old_snapshot_across_swap() {
        let second = r#"[{"KISI_TC_KIMLIK_NO": "55555555555"}]"#;
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Ok(MIXED.as_bytes().to_vec()),
            Ok(second.as_bytes().to_vec()),
        ]));
        let cache = cache_with(fetcher, 60);
        cache.ensure_fresh().await.unwrap();

        let held = cache.snapshot().await;
        cache.invalidate();
        cache.ensure_fresh().await.unwrap();

        assert_eq!(held.record_count(), 3);
        assert_eq!(held.search("11111111111").len(), 2);
        let current = cache.snapshot().await;
        assert_eq!(current.record_count(), 1);
        assert!(current.search("11111111111").is_empty());
    }
}
