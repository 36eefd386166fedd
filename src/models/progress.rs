use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

pub const META_CURRENT_PHASE: &str = "currentPhase";
pub const META_LAST_PAGE_TOKEN: &str = "lastPageToken";
pub const META_LAST_PAGE_INDEX: &str = "lastPageIndex";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FileScan,
    HashCalc,
    DuplicateSearch,
    FolderComparison,
    SingleFolderDup,
    Cleanup,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::FileScan => "file_scan",
            OperationKind::HashCalc => "hash_calc",
            OperationKind::DuplicateSearch => "duplicate_search",
            OperationKind::FolderComparison => "folder_comparison",
            OperationKind::SingleFolderDup => "single_folder_dup",
            OperationKind::Cleanup => "cleanup",
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_scan" => Ok(OperationKind::FileScan),
            "hash_calc" => Ok(OperationKind::HashCalc),
            "duplicate_search" => Ok(OperationKind::DuplicateSearch),
            "folder_comparison" => Ok(OperationKind::FolderComparison),
            "single_folder_dup" => Ok(OperationKind::SingleFolderDup),
            "cleanup" => Ok(OperationKind::Cleanup),
            other => anyhow::bail!("unknown operation type: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::Running => "running",
            ProgressStatus::Paused => "paused",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Failed)
    }

    /// Allowed transitions are monotonic: pending → running →
    /// {completed, failed, paused}; paused → running. Empty jobs may
    /// finish straight from pending.
    fn can_transition_to(&self, next: ProgressStatus) -> bool {
        use ProgressStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Failed)
        )
    }
}

impl std::str::FromStr for ProgressStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProgressStatus::Pending),
            "running" => Ok(ProgressStatus::Running),
            "paused" => Ok(ProgressStatus::Paused),
            "completed" => Ok(ProgressStatus::Completed),
            "failed" => Ok(ProgressStatus::Failed),
            other => anyhow::bail!("unknown progress status: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub id: i64,
    pub operation_type: OperationKind,
    pub status: ProgressStatus,
    pub total_items: i64,
    pub processed_items: i64,
    pub current_step: String,
    pub error: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub started_at: String,
    pub updated_at: String,
}

fn row_to_progress(row: &Row) -> rusqlite::Result<Progress> {
    let kind: String = row.get("operation_type")?;
    let status: String = row.get("status")?;
    let metadata: String = row.get("metadata")?;
    Ok(Progress {
        id: row.get("id")?,
        operation_type: kind.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
        status: status.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
        total_items: row.get("total_items")?,
        processed_items: row.get("processed_items")?,
        current_step: row.get("current_step")?,
        error: row.get("error")?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        started_at: row.get("started_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn create(conn: &Connection, kind: OperationKind, total: i64) -> anyhow::Result<Progress> {
    conn.execute(
        "INSERT INTO progress (operation_type, total_items) VALUES (?1, ?2)",
        params![kind.as_str(), total],
    )?;
    let id = conn.last_insert_rowid();
    find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created progress"))
}

pub fn find_by_id(conn: &Connection, id: i64) -> anyhow::Result<Option<Progress>> {
    let mut stmt = conn.prepare("SELECT * FROM progress WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_progress(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

/// Bump counters and the step label. Processed is clamped to the total
/// when a total is known.
pub fn update_counts(
    conn: &Connection,
    id: i64,
    processed: i64,
    step: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE progress
         SET processed_items = CASE WHEN total_items > 0 THEN MIN(?2, total_items) ELSE ?2 END,
             current_step = ?3,
             updated_at = datetime('now')
         WHERE id = ?1",
        params![id, processed.max(0), step],
    )?;
    Ok(())
}

pub fn set_total(conn: &Connection, id: i64, total: i64) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE progress SET total_items = ?2, updated_at = datetime('now') WHERE id = ?1",
        params![id, total],
    )?;
    Ok(())
}

pub fn set_status(conn: &Connection, id: i64, next: ProgressStatus) -> anyhow::Result<Progress> {
    let current =
        find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Progress {} not found", id))?;
    if current.status == next {
        return Ok(current);
    }
    if !current.status.can_transition_to(next) {
        anyhow::bail!(
            "Invalid progress transition {} -> {} for id {}",
            current.status.as_str(),
            next.as_str(),
            id
        );
    }
    conn.execute(
        "UPDATE progress SET status = ?2, updated_at = datetime('now') WHERE id = ?1",
        params![id, next.as_str()],
    )?;
    find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Progress {} not found", id))
}

pub fn complete(conn: &Connection, id: i64) -> anyhow::Result<Progress> {
    let p = set_status(conn, id, ProgressStatus::Completed)?;
    if p.total_items > 0 {
        conn.execute(
            "UPDATE progress SET processed_items = total_items, updated_at = datetime('now') WHERE id = ?",
            params![id],
        )?;
    }
    find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Progress {} not found", id))
}

pub fn fail(conn: &Connection, id: i64, error: &str) -> anyhow::Result<Progress> {
    let p = set_status(conn, id, ProgressStatus::Failed)?;
    conn.execute(
        "UPDATE progress SET error = ?2, updated_at = datetime('now') WHERE id = ?1",
        params![id, error],
    )?;
    Ok(Progress {
        error: Some(error.to_string()),
        ..p
    })
}

pub fn set_metadata_key(conn: &Connection, id: i64, key: &str, value: &str) -> anyhow::Result<()> {
    let p = find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Progress {} not found", id))?;
    let mut metadata = p.metadata;
    metadata.insert(key.to_string(), serde_json::Value::String(value.to_string()));
    conn.execute(
        "UPDATE progress SET metadata = ?2, updated_at = datetime('now') WHERE id = ?1",
        params![id, serde_json::to_string(&metadata)?],
    )?;
    Ok(())
}

pub fn get_metadata_key(conn: &Connection, id: i64, key: &str) -> anyhow::Result<Option<String>> {
    let p = find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Progress {} not found", id))?;
    Ok(p.metadata
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string()))
}

pub fn find_active(conn: &Connection) -> anyhow::Result<Vec<Progress>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM progress WHERE status IN ('pending','running') ORDER BY started_at DESC",
    )?;
    let rows = stmt.query_map([], |row| row_to_progress(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_latest_by_kind(
    conn: &Connection,
    kind: OperationKind,
) -> anyhow::Result<Option<Progress>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM progress WHERE operation_type = ? ORDER BY id DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![kind.as_str()], |row| row_to_progress(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn find_by_kind(conn: &Connection, kind: OperationKind) -> anyhow::Result<Vec<Progress>> {
    let mut stmt =
        conn.prepare("SELECT * FROM progress WHERE operation_type = ? ORDER BY id DESC")?;
    let rows = stmt.query_map(params![kind.as_str()], |row| row_to_progress(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Running jobs older than the given number of minutes.
pub fn find_long_running(conn: &Connection, minutes: i64) -> anyhow::Result<Vec<Progress>> {
    let cutoff = format!("-{} minutes", minutes);
    let mut stmt = conn.prepare(
        "SELECT * FROM progress WHERE status = 'running' AND started_at < datetime('now', ?)",
    )?;
    let rows = stmt.query_map(params![cutoff], |row| row_to_progress(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Active jobs that have not written an update for the given number of
/// minutes; candidates for operator attention.
pub fn find_stuck(conn: &Connection, minutes: i64) -> anyhow::Result<Vec<Progress>> {
    let cutoff = format!("-{} minutes", minutes);
    let mut stmt = conn.prepare(
        "SELECT * FROM progress WHERE status IN ('pending','running') AND updated_at < datetime('now', ?)",
    )?;
    let rows = stmt.query_map(params![cutoff], |row| row_to_progress(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn delete_failed(conn: &Connection) -> anyhow::Result<usize> {
    let changes = conn.execute("DELETE FROM progress WHERE status = 'failed'", [])?;
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::test_pool;

    #[test]
    fn test_lifecycle_pending_running_completed() -> anyhow::Result<()> {
        let pool = test_pool();
        let conn = pool.get()?;

        let p = create(&conn, OperationKind::FileScan, 100)?;
        assert_eq!(p.status, ProgressStatus::Pending);

        set_status(&conn, p.id, ProgressStatus::Running)?;
        update_counts(&conn, p.id, 42, "page 3")?;
        let done = complete(&conn, p.id)?;
        assert_eq!(done.status, ProgressStatus::Completed);
        assert_eq!(done.processed_items, done.total_items);
        Ok(())
    }

    #[test]
    fn test_terminal_states_are_final() -> anyhow::Result<()> {
        let pool = test_pool();
        let conn = pool.get()?;

        let p = create(&conn, OperationKind::Cleanup, 10)?;
        set_status(&conn, p.id, ProgressStatus::Running)?;
        fail(&conn, p.id, "provider unreachable")?;

        assert!(set_status(&conn, p.id, ProgressStatus::Running).is_err());
        let stored = find_by_id(&conn, p.id)?.unwrap();
        assert_eq!(stored.status, ProgressStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("provider unreachable"));
        Ok(())
    }

    #[test]
    fn test_paused_can_resume() -> anyhow::Result<()> {
        let pool = test_pool();
        let conn = pool.get()?;

        let p = create(&conn, OperationKind::FolderComparison, 0)?;
        set_status(&conn, p.id, ProgressStatus::Running)?;
        set_status(&conn, p.id, ProgressStatus::Paused)?;
        let resumed = set_status(&conn, p.id, ProgressStatus::Running)?;
        assert_eq!(resumed.status, ProgressStatus::Running);
        Ok(())
    }

    #[test]
    fn test_processed_clamped_to_total() -> anyhow::Result<()> {
        let pool = test_pool();
        let conn = pool.get()?;

        let p = create(&conn, OperationKind::HashCalc, 10)?;
        update_counts(&conn, p.id, 500, "overshoot")?;
        let stored = find_by_id(&conn, p.id)?.unwrap();
        assert_eq!(stored.processed_items, 10);
        Ok(())
    }

    #[test]
    fn test_metadata_bag_roundtrip() -> anyhow::Result<()> {
        let pool = test_pool();
        let conn = pool.get()?;

        let p = create(&conn, OperationKind::FileScan, 0)?;
        set_metadata_key(&conn, p.id, META_LAST_PAGE_TOKEN, "tok-6")?;
        set_metadata_key(&conn, p.id, META_LAST_PAGE_INDEX, "6")?;

        assert_eq!(
            get_metadata_key(&conn, p.id, META_LAST_PAGE_TOKEN)?.as_deref(),
            Some("tok-6")
        );
        assert_eq!(
            get_metadata_key(&conn, p.id, META_LAST_PAGE_INDEX)?.as_deref(),
            Some("6")
        );
        assert_eq!(get_metadata_key(&conn, p.id, "missing")?, None);
        Ok(())
    }
}
