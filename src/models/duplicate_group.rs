use crate::models::file::{self, FileEntry};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub id: i64,
    pub hash: String,
    pub file_count: i64,
    pub created_at: String,
    pub files: Vec<FileEntry>,
}

impl DuplicateGroup {
    /// Bytes recoverable by keeping a single representative.
    pub fn wasted_bytes(&self) -> i64 {
        match self.files.first() {
            Some(f) => (self.file_count - 1).max(0) * f.size,
            None => 0,
        }
    }
}

fn row_to_group(row: &Row) -> rusqlite::Result<DuplicateGroup> {
    Ok(DuplicateGroup {
        id: row.get("id")?,
        hash: row.get("hash")?,
        file_count: row.get("file_count")?,
        created_at: row.get("created_at")?,
        files: Vec::new(),
    })
}

fn load_members(conn: &Connection, group_id: i64) -> anyhow::Result<Vec<FileEntry>> {
    let mut stmt = conn.prepare(
        "SELECT file_id FROM duplicate_group_files WHERE group_id = ? ORDER BY file_id",
    )?;
    let ids: Vec<String> = stmt
        .query_map(params![group_id], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    file::find_by_ids(conn, &ids)
}

/// Upsert a group by digest: reuse the row for an existing hash,
/// replace its member links and refresh the count, atomically. Every
/// referenced file must already be persisted.
pub fn save_group(conn: &mut Connection, hash: &str, file_ids: &[String]) -> anyhow::Result<i64> {
    if hash.is_empty() {
        anyhow::bail!("duplicate group requires a non-empty hash");
    }

    let tx = conn.transaction()?;

    for id in file_ids {
        let present: i64 = tx.query_row(
            "SELECT COUNT(*) FROM files WHERE id = ?",
            params![id],
            |row| row.get(0),
        )?;
        if present == 0 {
            anyhow::bail!("file {} referenced by group {} is not persisted", id, hash);
        }
    }

    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM duplicate_groups WHERE hash = ?",
            params![hash],
            |row| row.get(0),
        )
        .ok();

    let group_id = match existing {
        Some(id) => {
            tx.execute(
                "DELETE FROM duplicate_group_files WHERE group_id = ?",
                params![id],
            )?;
            tx.execute(
                "UPDATE duplicate_groups SET file_count = ?2 WHERE id = ?1",
                params![id, file_ids.len() as i64],
            )?;
            id
        }
        None => {
            tx.execute(
                "INSERT INTO duplicate_groups (hash, file_count) VALUES (?1, ?2)",
                params![hash, file_ids.len() as i64],
            )?;
            tx.last_insert_rowid()
        }
    };

    for id in file_ids {
        tx.execute(
            "INSERT INTO duplicate_group_files (group_id, file_id) VALUES (?1, ?2)",
            params![group_id, id],
        )?;
    }

    tx.commit()?;
    Ok(group_id)
}

pub fn find_by_id(conn: &Connection, id: i64) -> anyhow::Result<Option<DuplicateGroup>> {
    let mut stmt = conn.prepare("SELECT * FROM duplicate_groups WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_group(row))?;
    match rows.next().and_then(|r| r.ok()) {
        Some(mut g) => {
            g.files = load_members(conn, g.id)?;
            Ok(Some(g))
        }
        None => Ok(None),
    }
}

pub fn delete_group(conn: &Connection, id: i64) -> anyhow::Result<bool> {
    // Member links cascade; the files themselves stay
    let changes = conn.execute("DELETE FROM duplicate_groups WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

/// Remove groups that no longer describe a duplicate (fewer than two
/// surviving members).
pub fn cleanup_empty_groups(conn: &Connection) -> anyhow::Result<usize> {
    conn.execute(
        "UPDATE duplicate_groups SET file_count =
           (SELECT COUNT(*) FROM duplicate_group_files WHERE group_id = duplicate_groups.id)",
        [],
    )?;
    let changes = conn.execute("DELETE FROM duplicate_groups WHERE file_count < 2", [])?;
    Ok(changes)
}

/// One page of valid groups, largest waste first, group id as the
/// tie-break. Returns the page plus the total group count.
pub fn list_page(
    conn: &Connection,
    page: i64,
    limit: i64,
) -> anyhow::Result<(Vec<DuplicateGroup>, i64)> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM duplicate_groups WHERE file_count >= 2",
        [],
        |row| row.get(0),
    )?;

    let offset = (page - 1).max(0) * limit;
    let mut stmt = conn.prepare(
        "SELECT g.* FROM duplicate_groups g
         WHERE g.file_count >= 2
         ORDER BY (g.file_count - 1) * COALESCE(
             (SELECT f.size FROM duplicate_group_files l JOIN files f ON f.id = l.file_id
              WHERE l.group_id = g.id LIMIT 1), 0) DESC,
             g.id ASC
         LIMIT ? OFFSET ?",
    )?;
    let mut groups: Vec<DuplicateGroup> = stmt
        .query_map(params![limit, offset], |row| row_to_group(row))?
        .filter_map(|r| r.ok())
        .collect();
    for g in &mut groups {
        g.files = load_members(conn, g.id)?;
    }
    Ok((groups, total))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub total_groups: i64,
    pub total_duplicate_files: i64,
    pub total_wasted_bytes: i64,
}

pub fn stats(conn: &Connection) -> anyhow::Result<GroupStats> {
    let (total_groups, total_duplicate_files): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(file_count), 0) FROM duplicate_groups WHERE file_count >= 2",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let total_wasted_bytes: i64 = conn.query_row(
        "SELECT COALESCE(SUM((g.file_count - 1) * COALESCE(
            (SELECT f.size FROM duplicate_group_files l JOIN files f ON f.id = l.file_id
             WHERE l.group_id = g.id LIMIT 1), 0)), 0)
         FROM duplicate_groups g WHERE g.file_count >= 2",
        [],
        |row| row.get(0),
    )?;
    Ok(GroupStats {
        total_groups,
        total_duplicate_files,
        total_wasted_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::test_pool;
    use crate::models::file::FileEntry;

    fn seed_file(conn: &Connection, id: &str, size: i64, hash: &str) {
        let mut f = FileEntry::new(id, format!("{}.bin", id), size);
        f.hash = hash.to_string();
        f.hash_calculated = !hash.is_empty();
        file::upsert(conn, &f).unwrap();
    }

    #[test]
    fn test_save_group_upsert_by_digest() -> anyhow::Result<()> {
        let pool = test_pool();
        let mut conn = pool.get()?;

        seed_file(&conn, "a", 100, "h");
        seed_file(&conn, "b", 100, "h");
        seed_file(&conn, "c", 100, "h");

        let first = save_group(&mut conn, "h", &["a".into(), "b".into()])?;
        let second = save_group(&mut conn, "h", &["a".into(), "b".into(), "c".into()])?;
        assert_eq!(first, second);

        let g = find_by_id(&conn, first)?.unwrap();
        assert_eq!(g.file_count, 3);
        assert_eq!(g.files.len(), 3);

        // No orphan links from the first save
        let links: i64 =
            conn.query_row("SELECT COUNT(*) FROM duplicate_group_files", [], |r| r.get(0))?;
        assert_eq!(links, 3);
        Ok(())
    }

    #[test]
    fn test_save_group_rejects_unpersisted_member() -> anyhow::Result<()> {
        let pool = test_pool();
        let mut conn = pool.get()?;

        seed_file(&conn, "a", 10, "h");
        assert!(save_group(&mut conn, "h", &["a".into(), "ghost".into()]).is_err());

        // The failed save must leave nothing behind
        let groups: i64 =
            conn.query_row("SELECT COUNT(*) FROM duplicate_groups", [], |r| r.get(0))?;
        assert_eq!(groups, 0);
        Ok(())
    }

    #[test]
    fn test_cleanup_empty_groups() -> anyhow::Result<()> {
        let pool = test_pool();
        let mut conn = pool.get()?;

        seed_file(&conn, "a", 10, "h1");
        seed_file(&conn, "b", 10, "h1");
        seed_file(&conn, "c", 20, "h2");
        seed_file(&conn, "d", 20, "h2");

        save_group(&mut conn, "h1", &["a".into(), "b".into()])?;
        let g2 = save_group(&mut conn, "h2", &["c".into(), "d".into()])?;

        // Losing a member drops h2 below the duplicate threshold
        file::delete(&conn, "d")?;
        let removed = cleanup_empty_groups(&conn)?;
        assert_eq!(removed, 1);
        assert!(find_by_id(&conn, g2)?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_page_orders_by_wasted_bytes() -> anyhow::Result<()> {
        let pool = test_pool();
        let mut conn = pool.get()?;

        // h-small wastes 50 bytes, h-big wastes 4000
        seed_file(&conn, "s1", 50, "h-small");
        seed_file(&conn, "s2", 50, "h-small");
        seed_file(&conn, "b1", 2000, "h-big");
        seed_file(&conn, "b2", 2000, "h-big");
        seed_file(&conn, "b3", 2000, "h-big");

        save_group(&mut conn, "h-small", &["s1".into(), "s2".into()])?;
        save_group(&mut conn, "h-big", &["b1".into(), "b2".into(), "b3".into()])?;

        let (page, total) = list_page(&conn, 1, 10)?;
        assert_eq!(total, 2);
        assert_eq!(page[0].hash, "h-big");
        assert_eq!(page[0].wasted_bytes(), 4000);
        assert_eq!(page[1].hash, "h-small");

        // All invariants: every member shares the group digest
        for g in &page {
            assert!(g.file_count >= 2);
            for f in &g.files {
                assert_eq!(f.hash, g.hash);
            }
        }
        Ok(())
    }
}
