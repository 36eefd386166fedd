use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub id: i64,
    pub source_folder_id: String,
    pub source_folder_name: String,
    pub target_folder_id: String,
    pub target_folder_name: String,
    pub source_file_count: i64,
    pub source_total_size: i64,
    pub target_file_count: i64,
    pub target_total_size: i64,
    pub duplicate_file_ids: Vec<String>,
    pub duplication_percent: f64,
    pub target_fully_duplicated: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewComparisonResult {
    pub source_folder_id: String,
    pub source_folder_name: String,
    pub target_folder_id: String,
    pub target_folder_name: String,
    pub source_file_count: i64,
    pub source_total_size: i64,
    pub target_file_count: i64,
    pub target_total_size: i64,
    pub duplicate_file_ids: Vec<String>,
}

impl NewComparisonResult {
    pub fn duplication_percent(&self) -> f64 {
        if self.target_file_count == 0 {
            return 0.0;
        }
        (self.duplicate_file_ids.len() as f64 / self.target_file_count as f64) * 100.0
    }
}

fn row_to_result(row: &Row) -> rusqlite::Result<ComparisonResult> {
    let ids_json: String = row.get("duplicate_file_ids")?;
    Ok(ComparisonResult {
        id: row.get("id")?,
        source_folder_id: row.get("source_folder_id")?,
        source_folder_name: row.get("source_folder_name")?,
        target_folder_id: row.get("target_folder_id")?,
        target_folder_name: row.get("target_folder_name")?,
        source_file_count: row.get("source_file_count")?,
        source_total_size: row.get("source_total_size")?,
        target_file_count: row.get("target_file_count")?,
        target_total_size: row.get("target_total_size")?,
        duplicate_file_ids: serde_json::from_str(&ids_json).unwrap_or_default(),
        duplication_percent: row.get("duplication_percent")?,
        target_fully_duplicated: row.get::<_, i64>("target_fully_duplicated")? != 0,
        created_at: row.get("created_at")?,
    })
}

/// Save a result for a folder pair; the pair carries a unique
/// constraint, so re-running a comparison updates in place.
pub fn save(conn: &Connection, data: &NewComparisonResult) -> anyhow::Result<ComparisonResult> {
    if data.source_folder_id == data.target_folder_id {
        anyhow::bail!("source and target folders must be distinct");
    }
    let percent = data.duplication_percent();
    let fully = (percent - 100.0).abs() < f64::EPSILON && data.target_file_count > 0;
    let ids_json = serde_json::to_string(&data.duplicate_file_ids)?;

    conn.execute(
        "INSERT INTO comparison_results
           (source_folder_id, source_folder_name, target_folder_id, target_folder_name,
            source_file_count, source_total_size, target_file_count, target_total_size,
            duplicate_file_ids, duplication_percent, target_fully_duplicated, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, datetime('now'))
         ON CONFLICT(source_folder_id, target_folder_id) DO UPDATE SET
           source_folder_name = excluded.source_folder_name,
           target_folder_name = excluded.target_folder_name,
           source_file_count = excluded.source_file_count,
           source_total_size = excluded.source_total_size,
           target_file_count = excluded.target_file_count,
           target_total_size = excluded.target_total_size,
           duplicate_file_ids = excluded.duplicate_file_ids,
           duplication_percent = excluded.duplication_percent,
           target_fully_duplicated = excluded.target_fully_duplicated,
           created_at = excluded.created_at",
        params![
            data.source_folder_id,
            data.source_folder_name,
            data.target_folder_id,
            data.target_folder_name,
            data.source_file_count,
            data.source_total_size,
            data.target_file_count,
            data.target_total_size,
            ids_json,
            percent,
            fully as i64,
        ],
    )?;

    find_by_pair(conn, &data.source_folder_id, &data.target_folder_id)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve saved comparison result"))
}

pub fn find_by_pair(
    conn: &Connection,
    source_folder_id: &str,
    target_folder_id: &str,
) -> anyhow::Result<Option<ComparisonResult>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM comparison_results WHERE source_folder_id = ? AND target_folder_id = ?",
    )?;
    let mut rows = stmt.query_map(params![source_folder_id, target_folder_id], |row| {
        row_to_result(row)
    })?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn find_recent(conn: &Connection, limit: i64) -> anyhow::Result<Vec<ComparisonResult>> {
    let mut stmt =
        conn.prepare("SELECT * FROM comparison_results ORDER BY created_at DESC, id DESC LIMIT ?")?;
    let rows = stmt.query_map(params![limit], |row| row_to_result(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn delete(conn: &Connection, id: i64) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM comparison_results WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::test_pool;

    fn sample(duplicates: usize, target_count: i64) -> NewComparisonResult {
        NewComparisonResult {
            source_folder_id: "src".into(),
            source_folder_name: "Source".into(),
            target_folder_id: "dst".into(),
            target_folder_name: "Target".into(),
            source_file_count: 3,
            source_total_size: 3000,
            target_file_count: target_count,
            target_total_size: 3000,
            duplicate_file_ids: (0..duplicates).map(|i| format!("t{}", i)).collect(),
        }
    }

    #[test]
    fn test_percentage_and_flag() -> anyhow::Result<()> {
        let pool = test_pool();
        let conn = pool.get()?;

        let full = save(&conn, &sample(3, 3))?;
        assert_eq!(full.duplication_percent, 100.0);
        assert!(full.target_fully_duplicated);

        let partial = save(&conn, &sample(1, 4))?;
        assert_eq!(partial.duplication_percent, 25.0);
        assert!(!partial.target_fully_duplicated);
        assert!(partial.duplication_percent >= 0.0 && partial.duplication_percent <= 100.0);
        Ok(())
    }

    #[test]
    fn test_same_pair_updates_in_place() -> anyhow::Result<()> {
        let pool = test_pool();
        let conn = pool.get()?;

        let first = save(&conn, &sample(1, 4))?;
        let second = save(&conn, &sample(2, 4))?;
        assert_eq!(first.id, second.id);

        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM comparison_results", [], |r| r.get(0))?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn test_rejects_identical_folders() {
        let pool = test_pool();
        let conn = pool.get().unwrap();

        let mut data = sample(0, 0);
        data.target_folder_id = data.source_folder_id.clone();
        assert!(save(&conn, &data).is_err());
    }

    #[test]
    fn test_empty_target_is_zero_percent() -> anyhow::Result<()> {
        let pool = test_pool();
        let conn = pool.get()?;

        let r = save(&conn, &sample(0, 0))?;
        assert_eq!(r.duplication_percent, 0.0);
        assert!(!r.target_fully_duplicated);
        Ok(())
    }
}
