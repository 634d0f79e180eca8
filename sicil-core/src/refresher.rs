//! Background dataset refresh.
//!
//! A supervised task that keeps the [`DatasetCache`] warm so user
//! lookups rarely pay for a download. It is started with the server,
//! reports every attempt on a watch channel and is joined at shutdown.

use crate::dataset::DatasetCache;
use crate::fetcher::FetchError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Result of one background refresh attempt
#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub at: DateTime<Utc>,
    pub outcome: Result<(), FetchError>,
    pub records: usize,
}

pub struct Refresher {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    reports: watch::Receiver<Option<RefreshReport>>,
}

impl Refresher {
    /// Spawn the refresh loop. The first attempt runs immediately.
    pub fn start(cache: Arc<DatasetCache>, period: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let (report_tx, reports) = watch::channel(None);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!("Dataset refresher started (every {:?})", period);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let outcome = cache.refresh_now().await;
                        let records = cache.snapshot().await.record_count();
                        match &outcome {
                            Ok(()) => debug!("Background refresh ok, {} records", records),
                            Err(e) => warn!("Background refresh failed: {}", e),
                        }
                        report_tx.send_replace(Some(RefreshReport {
                            at: Utc::now(),
                            outcome,
                            records,
                        }));
                    }
                }
            }

            info!("Dataset refresher stopped");
        });

        Self {
            shutdown,
            handle,
            reports,
        }
    }

    /// Receiver for refresh reports
    pub fn subscribe(&self) -> watch::Receiver<Option<RefreshReport>> {
        self.reports.clone()
    }

    pub fn latest_report(&self) -> Option<RefreshReport> {
        self.reports.borrow().clone()
    }

    /// Signal the loop to stop and wait for it. An attempt already running is
    /// allowed to finish.
    pub async fn stop(self) -> Option<RefreshReport> {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            warn!("Dataset refresher ended abnormally: {}", e);
        }
        self.reports.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasetConfig;
    use crate::fetcher::testing::ScriptedFetcher;

    fn cache(fetcher: Arc<ScriptedFetcher>) -> Arc<DatasetCache> {
        let config = DatasetConfig {
            url: "https://registry.test/data.json".to_string(),
            refresh_interval_secs: 0,
            ..DatasetConfig::default()
        };
        Arc::new(DatasetCache::new(&config, fetcher))
    }

    #[tokio::test]
    async fn test_first_refresh_runs_immediately() {
        let fetcher = Arc::new(ScriptedFetcher::json(
            r#"[{"KISI_TC_KIMLIK_NO": "11111111111"}]"#,
        ));
        let refresher = Refresher::start(cache(fetcher.clone()), Duration::from_secs(3600));

        let mut reports = refresher.subscribe();
        reports.changed().await.unwrap();
        let report = reports.borrow().clone().unwrap();
        assert!(report.outcome.is_ok());
        assert_eq!(report.records, 1);

        let last = refresher.stop().await.unwrap();
        assert_eq!(last.records, 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_reported() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Err(FetchError::Empty)]));
        let refresher = Refresher::start(cache(fetcher), Duration::from_secs(3600));

        let mut reports = refresher.subscribe();
        reports.changed().await.unwrap();
        assert_eq!(
            refresher.latest_report().unwrap().outcome,
            Err(FetchError::Empty)
        );

        refresher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_refreshing_until_stopped() {
        let fetcher = Arc::new(ScriptedFetcher::json(
            r#"[{"KISI_TC_KIMLIK_NO": "11111111111"}]"#,
        ));
        let refresher = Refresher::start(cache(fetcher.clone()), Duration::from_secs(60));

        let mut reports = refresher.subscribe();
        for _ in 0..3 {
            reports.changed().await.unwrap();
        }
        refresher.stop().await;

        let calls = fetcher.calls();
        assert!(calls >= 3);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fetcher.calls(), calls);
    }
}
