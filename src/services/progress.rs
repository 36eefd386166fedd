use crate::db::connection::DbPool;
use crate::models::progress::{self, OperationKind, Progress, ProgressStatus};
use rusqlite::Connection;

/// Checkpoint store handed to every engine. Each call persists
/// immediately; the owning engine is the only writer of its row.
#[derive(Clone)]
pub struct ProgressService {
    db: DbPool,
}

impl ProgressService {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| anyhow::anyhow!(e))?
    }

    pub async fn start(&self, kind: OperationKind, total: i64) -> anyhow::Result<Progress> {
        self.with_conn(move |conn| progress::create(conn, kind, total)).await
    }

    pub async fn get(&self, id: i64) -> anyhow::Result<Option<Progress>> {
        self.with_conn(move |conn| progress::find_by_id(conn, id)).await
    }

    pub async fn mark_running(&self, id: i64) -> anyhow::Result<Progress> {
        self.with_conn(move |conn| progress::set_status(conn, id, ProgressStatus::Running))
            .await
    }

    pub async fn update(&self, id: i64, processed: i64, step: impl Into<String>) -> anyhow::Result<()> {
        let step = step.into();
        self.with_conn(move |conn| progress::update_counts(conn, id, processed, &step))
            .await
    }

    pub async fn set_total(&self, id: i64, total: i64) -> anyhow::Result<()> {
        self.with_conn(move |conn| progress::set_total(conn, id, total)).await
    }

    pub async fn complete(&self, id: i64) -> anyhow::Result<Progress> {
        self.with_conn(move |conn| progress::complete(conn, id)).await
    }

    pub async fn fail(&self, id: i64, error: impl Into<String>) -> anyhow::Result<Progress> {
        let error = error.into();
        self.with_conn(move |conn| progress::fail(conn, id, &error)).await
    }

    pub async fn pause(&self, id: i64) -> anyhow::Result<Progress> {
        self.with_conn(move |conn| progress::set_status(conn, id, ProgressStatus::Paused))
            .await
    }

    pub async fn resume(&self, id: i64) -> anyhow::Result<Progress> {
        self.with_conn(move |conn| progress::set_status(conn, id, ProgressStatus::Running))
            .await
    }

    pub async fn set_metadata(
        &self,
        id: i64,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> anyhow::Result<()> {
        let (key, value) = (key.into(), value.into());
        self.with_conn(move |conn| progress::set_metadata_key(conn, id, &key, &value))
            .await
    }

    pub async fn get_metadata(&self, id: i64, key: impl Into<String>) -> anyhow::Result<Option<String>> {
        let key = key.into();
        self.with_conn(move |conn| progress::get_metadata_key(conn, id, &key))
            .await
    }

    /// Soft-cancel signal: engines poll this at phase and page
    /// boundaries and exit cleanly when the row was paused.
    pub async fn is_paused(&self, id: i64) -> bool {
        matches!(
            self.get(id).await,
            Ok(Some(Progress {
                status: ProgressStatus::Paused,
                ..
            }))
        )
    }

    pub async fn get_active(&self) -> anyhow::Result<Vec<Progress>> {
        self.with_conn(progress::find_active).await
    }

    pub async fn get_by_kind(&self, kind: OperationKind) -> anyhow::Result<Vec<Progress>> {
        self.with_conn(move |conn| progress::find_by_kind(conn, kind)).await
    }

    pub async fn latest_by_kind(&self, kind: OperationKind) -> anyhow::Result<Option<Progress>> {
        self.with_conn(move |conn| progress::find_latest_by_kind(conn, kind))
            .await
    }

    pub async fn get_long_running(&self, minutes: i64) -> anyhow::Result<Vec<Progress>> {
        self.with_conn(move |conn| progress::find_long_running(conn, minutes))
            .await
    }

    pub async fn get_stuck(&self, minutes: i64) -> anyhow::Result<Vec<Progress>> {
        self.with_conn(move |conn| progress::find_stuck(conn, minutes)).await
    }

    pub async fn clear_failed(&self) -> anyhow::Result<usize> {
        self.with_conn(progress::delete_failed).await
    }
}
