use crate::job::{UploadContext, UploadError, UploadReport, upload_all};
use crate::metrics_defs::SCHEDULER_TICKS;
use exporter::counter;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Periodically uploads fresh data for every scheduled exam.
pub struct Scheduler {
    ctx: Arc<UploadContext>,
    interval: Duration,
    // Set once the first pass has completed.
    ready: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(ctx: Arc<UploadContext>, interval: Duration) -> Self {
        Scheduler {
            ctx,
            interval,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub async fn tick(&self) -> Result<UploadReport, UploadError> {
        let result = upload_all(self.ctx.clone()).await;
        counter!(SCHEDULER_TICKS).increment(1);
        self.ready.store(true, Ordering::Relaxed);
        result
    }

    /// Runs a pass immediately and then every interval until `shutdown`
    /// resolves. A pass in progress is finished before returning.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => tracing::info!(
                            uploaded = report.uploaded,
                            skipped = report.skipped,
                            failed = report.failed,
                            "Scheduled upload pass finished"
                        ),
                        Err(e) => tracing::error!(error = %e, "Scheduled upload pass failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::{context, delivery, mount_exam, tenant};
    use exporter::store::IntegrationStore;
    use wiremock::MockServer;

    #[tokio::test]
    async fn test_tick_sets_ready() {
        let mock_server = MockServer::start().await;
        mount_exam(
            &mock_server,
            "exam1",
            vec![delivery("d1", "2020-01-02T00:00:00")],
        )
        .await;

        let drop_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(drop_dir.path().join("drop")).unwrap();
        let (ctx, store) = context(&mock_server, drop_dir.path());
        store
            .put("exam1", &tenant("exam1", Some("drop")))
            .await
            .unwrap();
        store.schedule("exam1").await.unwrap();

        let scheduler = Scheduler::new(Arc::new(ctx), Duration::from_secs(60));
        assert!(!scheduler.is_ready());

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert!(scheduler.is_ready());
        assert!(scheduler.ready_flag().load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mock_server = MockServer::start().await;
        let drop_dir = tempfile::tempdir().unwrap();
        let (ctx, _store) = context(&mock_server, drop_dir.path());

        let scheduler = Scheduler::new(Arc::new(ctx), Duration::from_millis(10));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            scheduler
                .run(async {
                    let _ = rx.await;
                })
                .await;
            scheduler.is_ready()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        let ready = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(ready);
    }
}
