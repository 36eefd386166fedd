use crate::error::EngineError;
use crate::models::progress::OperationKind;
use crate::services::progress::ProgressService;
use crate::state::AppState;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Progress id of the currently running job of a kind, if any.
pub async fn active(state: &AppState, kind: OperationKind) -> Option<i64> {
    state.running_jobs.lock().await.get(&kind).copied()
}

/// Snapshot of the active job's progress row for "already running"
/// responses: a second start of a kind is answered with the current
/// row, not an error.
pub async fn active_progress(
    state: &AppState,
    kind: OperationKind,
) -> anyhow::Result<Option<crate::models::progress::Progress>> {
    match active(state, kind).await {
        Some(id) => ProgressService::new(state.db.clone()).get(id).await,
        None => Ok(None),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Launch an engine future on a detached task. The task is registered
/// in the per-kind running map, panics are recovered into a failed
/// progress row, and engine errors fail the row if the engine did not
/// already do so. HTTP-level cancellation never reaches this task;
/// only the progress row's pause/fail state stops an engine.
pub fn spawn_job<F>(state: Arc<AppState>, kind: OperationKind, progress_id: i64, fut: F)
where
    F: Future<Output = Result<(), EngineError>> + Send + 'static,
{
    tokio::spawn(async move {
        {
            let mut running = state.running_jobs.lock().await;
            if let Some(existing) = running.get(&kind) {
                tracing::warn!(
                    kind = kind.as_str(),
                    existing,
                    progress_id,
                    "Job of this kind already running, refusing duplicate start"
                );
                let progress = ProgressService::new(state.db.clone());
                let _ = progress
                    .fail(progress_id, format!("a {} job is already running", kind.as_str()))
                    .await;
                return;
            }
            running.insert(kind, progress_id);
        }

        let progress = ProgressService::new(state.db.clone());
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // A paused row is a soft cancel the engine honoured by
                // bailing out; leave it resumable instead of failing it
                if progress.is_paused(progress_id).await {
                    tracing::info!(kind = kind.as_str(), progress_id, "Job exited on pause");
                } else {
                    tracing::error!(kind = kind.as_str(), progress_id, "Job failed: {:#}", e);
                    let _ = progress.fail(progress_id, format!("{}", e)).await;
                }
            }
            Err(payload) => {
                let msg = panic_message(payload);
                tracing::error!(kind = kind.as_str(), progress_id, panic = %msg, "Job panicked");
                let _ = progress.fail(progress_id, format!("panic: {}", msg)).await;
            }
        }

        state.running_jobs.lock().await.remove(&kind);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::migrate::test_pool;
    use crate::models::progress::ProgressStatus;
    use crate::storage::mock::MockProvider;
    use std::time::Duration;

    fn test_state() -> Arc<AppState> {
        // Config values are irrelevant here; only the pool and the
        // running-jobs map are exercised
        let config = AppConfig::from_env();
        Arc::new(AppState::new(
            test_pool(),
            config,
            Arc::new(MockProvider::new()),
            crate::services::hash::HashAlgorithm::Sha256,
        ))
    }

    async fn wait_terminal(progress: &ProgressService, id: i64) -> ProgressStatus {
        for _ in 0..100 {
            if let Some(p) = progress.get(id).await.unwrap() {
                if p.status.is_terminal() {
                    return p.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn test_panic_is_recovered_into_failed_progress() -> anyhow::Result<()> {
        let state = test_state();
        let progress = ProgressService::new(state.db.clone());
        let p = progress.start(OperationKind::Cleanup, 0).await?;

        spawn_job(state.clone(), OperationKind::Cleanup, p.id, async {
            panic!("boom in engine");
        });

        let status = wait_terminal(&progress, p.id).await;
        assert_eq!(status, ProgressStatus::Failed);
        let row = progress.get(p.id).await?.unwrap();
        assert!(row.error.as_deref().unwrap_or("").starts_with("panic:"));
        assert!(active(&state, OperationKind::Cleanup).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_engine_error_fails_progress() -> anyhow::Result<()> {
        let state = test_state();
        let progress = ProgressService::new(state.db.clone());
        let p = progress.start(OperationKind::FileScan, 0).await?;
        progress.mark_running(p.id).await?;

        spawn_job(state.clone(), OperationKind::FileScan, p.id, async {
            Err(EngineError::BadInput("bad worker count".into()))
        });

        let status = wait_terminal(&progress, p.id).await;
        assert_eq!(status, ProgressStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_start_is_rejected() -> anyhow::Result<()> {
        let state = test_state();
        let progress = ProgressService::new(state.db.clone());

        let first = progress.start(OperationKind::DuplicateSearch, 0).await?;
        let second = progress.start(OperationKind::DuplicateSearch, 0).await?;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        spawn_job(state.clone(), OperationKind::DuplicateSearch, first.id, async move {
            let _ = release_rx.await;
            Ok(())
        });
        // Give the first job time to register
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(active(&state, OperationKind::DuplicateSearch).await, Some(first.id));

        spawn_job(state.clone(), OperationKind::DuplicateSearch, second.id, async { Ok(()) });
        let status = wait_terminal(&progress, second.id).await;
        assert_eq!(status, ProgressStatus::Failed);

        let _ = release_tx.send(());
        Ok(())
    }
}
