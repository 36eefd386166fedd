use crate::db::connection::DbPool;
use std::fs;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  size INTEGER NOT NULL DEFAULT 0 CHECK(size >= 0),
  mime_type TEXT NOT NULL DEFAULT '',
  modified_time TEXT NOT NULL DEFAULT '',
  parents TEXT NOT NULL DEFAULT '[]',
  path TEXT NOT NULL DEFAULT '',
  web_view_link TEXT NOT NULL DEFAULT '',
  hash TEXT NOT NULL DEFAULT '',
  hash_calculated INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_files_hash ON files(hash) WHERE hash != '';
CREATE INDEX IF NOT EXISTS idx_files_size ON files(size);
CREATE INDEX IF NOT EXISTS idx_files_hash_calculated ON files(hash_calculated);

CREATE TABLE IF NOT EXISTS progress (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  operation_type TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','running','paused','completed','failed')),
  total_items INTEGER NOT NULL DEFAULT 0,
  processed_items INTEGER NOT NULL DEFAULT 0,
  current_step TEXT NOT NULL DEFAULT '',
  error TEXT,
  metadata TEXT NOT NULL DEFAULT '{}',
  started_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_progress_type_status ON progress(operation_type, status);

CREATE TABLE IF NOT EXISTS duplicate_groups (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  hash TEXT NOT NULL UNIQUE,
  file_count INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS duplicate_group_files (
  group_id INTEGER NOT NULL REFERENCES duplicate_groups(id) ON DELETE CASCADE,
  file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
  PRIMARY KEY (group_id, file_id)
);

CREATE INDEX IF NOT EXISTS idx_group_files_file ON duplicate_group_files(file_id);

CREATE TABLE IF NOT EXISTS comparison_results (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_folder_id TEXT NOT NULL,
  source_folder_name TEXT NOT NULL DEFAULT '',
  target_folder_id TEXT NOT NULL,
  target_folder_name TEXT NOT NULL DEFAULT '',
  source_file_count INTEGER NOT NULL DEFAULT 0,
  source_total_size INTEGER NOT NULL DEFAULT 0,
  target_file_count INTEGER NOT NULL DEFAULT 0,
  target_total_size INTEGER NOT NULL DEFAULT 0,
  duplicate_file_ids TEXT NOT NULL DEFAULT '[]',
  duplication_percent REAL NOT NULL DEFAULT 0,
  target_fully_duplicated INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  UNIQUE(source_folder_id, target_folder_id)
);
"#;

pub fn migrate(pool: &DbPool, data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    fs::create_dir_all(data_dir)?;

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for databases created before these columns existed
    let has_column = |table: &str, column: &str| -> bool {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table))
            .unwrap();
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        columns.contains(&column.to_string())
    };

    // files migrations
    if !has_column("files", "parents") {
        conn.execute_batch("ALTER TABLE files ADD COLUMN parents TEXT NOT NULL DEFAULT '[]'")?;
    }
    if !has_column("files", "path") {
        conn.execute_batch("ALTER TABLE files ADD COLUMN path TEXT NOT NULL DEFAULT ''")?;
    }
    if !has_column("files", "web_view_link") {
        conn.execute_batch("ALTER TABLE files ADD COLUMN web_view_link TEXT NOT NULL DEFAULT ''")?;
    }

    // progress migrations: the metadata bag (page checkpoints, phase names)
    // was added after the first release
    if !has_column("progress", "metadata") {
        conn.execute_batch("ALTER TABLE progress ADD COLUMN metadata TEXT NOT NULL DEFAULT '{}'")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

#[cfg(test)]
pub fn test_pool() -> DbPool {
    let manager = r2d2_sqlite::SqliteConnectionManager::memory();
    let pool = r2d2::Pool::builder()
        .max_size(1)
        .build(manager)
        .expect("test pool");
    let conn = pool.get().unwrap();
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
    conn.execute_batch(SCHEMA).unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_migrate_is_idempotent() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("test.db");
        let pool = crate::db::connection::create_pool(db_path.to_str().unwrap(), 1);

        migrate(&pool, temp_dir.path())?;
        migrate(&pool, temp_dir.path())?;

        let conn = pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='files'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn test_metadata_column_added_to_legacy_schema() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("legacy.db");
        let pool = crate::db::connection::create_pool(db_path.to_str().unwrap(), 1);

        // Simulate a pre-metadata progress table
        {
            let conn = pool.get()?;
            conn.execute_batch(
                "CREATE TABLE progress (
                   id INTEGER PRIMARY KEY AUTOINCREMENT,
                   operation_type TEXT NOT NULL,
                   status TEXT NOT NULL DEFAULT 'pending',
                   total_items INTEGER NOT NULL DEFAULT 0,
                   processed_items INTEGER NOT NULL DEFAULT 0,
                   current_step TEXT NOT NULL DEFAULT '',
                   error TEXT,
                   started_at TEXT NOT NULL DEFAULT (datetime('now')),
                   updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                 );
                 INSERT INTO progress (operation_type) VALUES ('file_scan');",
            )?;
        }

        migrate(&pool, temp_dir.path())?;

        let conn = pool.get()?;
        let metadata: String =
            conn.query_row("SELECT metadata FROM progress WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        assert_eq!(metadata, "{}");
        Ok(())
    }
}
