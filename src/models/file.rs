use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

/// A file row mirrored from the storage provider. The id is the
/// provider-assigned opaque identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub modified_time: String,
    pub parents: Vec<String>,
    pub path: String,
    pub web_view_link: String,
    pub hash: String,
    pub hash_calculated: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl FileEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>, size: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            size,
            mime_type: String::new(),
            modified_time: String::new(),
            parents: Vec::new(),
            path: String::new(),
            web_view_link: String::new(),
            hash: String::new(),
            hash_calculated: false,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

fn row_to_file(row: &Row) -> rusqlite::Result<FileEntry> {
    let parents_json: String = row.get("parents")?;
    Ok(FileEntry {
        id: row.get("id")?,
        name: row.get("name")?,
        size: row.get("size")?,
        mime_type: row.get("mime_type")?,
        modified_time: row.get("modified_time")?,
        parents: serde_json::from_str(&parents_json).unwrap_or_default(),
        path: row.get("path")?,
        web_view_link: row.get("web_view_link")?,
        hash: row.get("hash")?,
        hash_calculated: row.get::<_, i64>("hash_calculated")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Insert or update by provider id. Returns true when a new row was
/// created. An empty incoming hash never clobbers a stored digest.
pub fn upsert(conn: &Connection, file: &FileEntry) -> anyhow::Result<bool> {
    let parents_json = serde_json::to_string(&file.parents)?;
    let now = chrono::Utc::now().to_rfc3339();
    let existed = exists(conn, &file.id)?;
    conn.execute(
        "INSERT INTO files (id, name, size, mime_type, modified_time, parents, path, web_view_link, hash, hash_calculated, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           size = excluded.size,
           mime_type = excluded.mime_type,
           modified_time = excluded.modified_time,
           parents = excluded.parents,
           web_view_link = excluded.web_view_link,
           path = CASE WHEN excluded.path != '' THEN excluded.path ELSE files.path END,
           hash = CASE WHEN excluded.hash != '' THEN excluded.hash ELSE files.hash END,
           hash_calculated = CASE WHEN excluded.hash != '' THEN excluded.hash_calculated ELSE files.hash_calculated END,
           updated_at = excluded.updated_at",
        params![
            file.id,
            file.name,
            file.size,
            file.mime_type,
            file.modified_time,
            parents_json,
            file.path,
            file.web_view_link,
            file.hash,
            file.hash_calculated as i64,
            now,
        ],
    )?;
    Ok(!existed)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<FileEntry>> {
    let mut stmt = conn.prepare("SELECT * FROM files WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_file(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn exists(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM files WHERE id = ?",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn find_by_ids(conn: &Connection, ids: &[String]) -> anyhow::Result<Vec<FileEntry>> {
    let mut out = Vec::with_capacity(ids.len());
    let mut stmt = conn.prepare("SELECT * FROM files WHERE id = ?")?;
    for id in ids {
        let mut rows = stmt.query_map(params![id], |row| row_to_file(row))?;
        if let Some(Ok(f)) = rows.next() {
            out.push(f);
        }
    }
    Ok(out)
}

/// Files still waiting for a digest, smallest first so cheap files
/// clear the queue early.
pub fn find_without_hash(conn: &Connection) -> anyhow::Result<Vec<FileEntry>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM files WHERE hash_calculated = 0 AND size > 0 ORDER BY size ASC",
    )?;
    let rows = stmt.query_map([], |row| row_to_file(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_with_hash(conn: &Connection) -> anyhow::Result<Vec<FileEntry>> {
    let mut stmt =
        conn.prepare("SELECT * FROM files WHERE hash_calculated = 1 AND hash != ''")?;
    let rows = stmt.query_map([], |row| row_to_file(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_parent(conn: &Connection, folder_id: &str) -> anyhow::Result<Vec<FileEntry>> {
    // parents is a JSON array of ids; match the quoted id inside it
    let pattern = format!("%\"{}\"%", folder_id);
    let mut stmt = conn.prepare("SELECT * FROM files WHERE parents LIKE ?")?;
    let rows = stmt.query_map(params![pattern], |row| row_to_file(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn set_hash(conn: &Connection, id: &str, hash: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE files SET hash = ?1, hash_calculated = 1, updated_at = ?2 WHERE id = ?3",
        params![hash, chrono::Utc::now().to_rfc3339(), id],
    )?;
    Ok(())
}

pub fn set_path(conn: &Connection, id: &str, path: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE files SET path = ?1, updated_at = ?2 WHERE id = ?3",
        params![path, chrono::Utc::now().to_rfc3339(), id],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM files WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

pub fn count(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?)
}

pub fn count_with_hash(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM files WHERE hash_calculated = 1",
        [],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::test_pool;

    #[test]
    fn test_upsert_inserts_then_updates() -> anyhow::Result<()> {
        let pool = test_pool();
        let conn = pool.get()?;

        let mut f = FileEntry::new("file-1", "report.pdf", 1024);
        f.parents = vec!["folder-a".into()];
        assert!(upsert(&conn, &f)?);

        f.name = "report-v2.pdf".into();
        assert!(!upsert(&conn, &f)?);

        let stored = find_by_id(&conn, "file-1")?.unwrap();
        assert_eq!(stored.name, "report-v2.pdf");
        assert_eq!(stored.parents, vec!["folder-a".to_string()]);
        Ok(())
    }

    #[test]
    fn test_upsert_preserves_digest_when_omitted() -> anyhow::Result<()> {
        let pool = test_pool();
        let conn = pool.get()?;

        let f = FileEntry::new("file-1", "a.bin", 10);
        upsert(&conn, &f)?;
        set_hash(&conn, "file-1", "abc123")?;

        // Re-scan without a digest must not erase the stored one
        let rescanned = FileEntry::new("file-1", "a.bin", 12);
        upsert(&conn, &rescanned)?;

        let stored = find_by_id(&conn, "file-1")?.unwrap();
        assert_eq!(stored.size, 12);
        assert_eq!(stored.hash, "abc123");
        assert!(stored.hash_calculated);
        Ok(())
    }

    #[test]
    fn test_hash_calculated_implies_nonempty_hash() -> anyhow::Result<()> {
        let pool = test_pool();
        let conn = pool.get()?;

        for i in 0..5 {
            let f = FileEntry::new(format!("f{}", i), "x", 100);
            upsert(&conn, &f)?;
        }
        set_hash(&conn, "f0", "h0")?;
        set_hash(&conn, "f3", "h3")?;

        for f in find_with_hash(&conn)? {
            assert!(!f.hash.is_empty());
        }
        assert_eq!(find_without_hash(&conn)?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_find_by_parent_matches_exact_id() -> anyhow::Result<()> {
        let pool = test_pool();
        let conn = pool.get()?;

        let mut a = FileEntry::new("a", "a.txt", 1);
        a.parents = vec!["folder-1".into()];
        let mut b = FileEntry::new("b", "b.txt", 1);
        b.parents = vec!["folder-2".into(), "folder-1".into()];
        let mut c = FileEntry::new("c", "c.txt", 1);
        c.parents = vec!["folder-3".into()];
        for f in [&a, &b, &c] {
            upsert(&conn, f)?;
        }

        let in_folder = find_by_parent(&conn, "folder-1")?;
        let ids: Vec<_> = in_folder.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        Ok(())
    }
}
