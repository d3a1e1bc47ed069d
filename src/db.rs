use crate::error::StoreError;
use crate::models::{DocumentMeta, DocumentRecord, FileType};
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::collections::HashMap;
use std::path::Path;

/// Upper bound on bound parameters per statement. SQLite builds older than
/// 3.32 reject more than 999.
pub const MAX_PARAMS_PER_STATEMENT: usize = 900;

/// Per-corpus catalog of documents and their embeddings.
pub struct Catalog {
    conn: Connection,
}

/// Open (creating if needed) a catalog database and make sure the schema exists
pub fn init_database(db_path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    create_schema(&conn)?;
    log::debug!("Catalog initialized at {:?}", db_path);
    Ok(conn)
}

fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filepath TEXT NOT NULL UNIQUE,
            filename TEXT NOT NULL,
            file_type TEXT NOT NULL,
            mtime REAL NOT NULL,
            preview_content TEXT NOT NULL DEFAULT '',
            embedding BLOB
        )",
        [],
    )?;
    Ok(())
}

/// Read-only connection for the search path. Never creates the file, so a
/// missing catalog surfaces as an error instead of an empty database.
pub fn get_connection(db_path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

impl Catalog {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            conn: init_database(db_path)?,
        })
    }

    /// Insert or update records keyed by `filepath`, in a single transaction.
    /// An existing path keeps its `id`.
    pub fn upsert_many(&mut self, records: &[DocumentRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO documents
                     (filepath, filename, file_type, mtime, preview_content, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(filepath) DO UPDATE SET
                    filename = excluded.filename,
                    file_type = excluded.file_type,
                    mtime = excluded.mtime,
                    preview_content = excluded.preview_content,
                    embedding = excluded.embedding",
            )?;
            for record in records {
                stmt.execute(params![
                    record.filepath,
                    record.filename,
                    record.file_type.as_str(),
                    record.mtime,
                    record.preview,
                    f32_vec_to_bytes(&record.embedding),
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Delete every row whose path is in `paths`. Statements are chunked to
    /// stay under the parameter limit; the whole deletion is one transaction.
    pub fn delete_by_paths(&mut self, paths: &[String]) -> Result<usize, StoreError> {
        if paths.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut deleted = 0;
        for chunk in paths.chunks(MAX_PARAMS_PER_STATEMENT) {
            let sql = format!(
                "DELETE FROM documents WHERE filepath IN ({})",
                placeholders(chunk.len())
            );
            deleted += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// `(id, filepath, mtime)` for every row, ordered by id.
    pub fn all_ids_and_mtimes(&self) -> Result<Vec<(i64, String, f64)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, filepath, mtime FROM documents ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Path -> mtime map, the shape the change detector diffs against.
    pub fn path_mtimes(&self) -> Result<HashMap<String, f64>, StoreError> {
        Ok(self
            .all_ids_and_mtimes()?
            .into_iter()
            .map(|(_, path, mtime)| (path, mtime))
            .collect())
    }

    pub fn fetch_by_ids(&self, ids: &[i64]) -> Result<Vec<DocumentMeta>, StoreError> {
        fetch_by_ids(&self.conn, ids)
    }

    /// Every stored `(id, embedding)` pair, ordered by id. Rows without an
    /// embedding are left out.
    pub fn all_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, embedding FROM documents WHERE embedding IS NOT NULL ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, bytes_to_f32_vec(&blob)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// Batch metadata lookup, shared by the writable catalog and the per-query
/// search connections. Unknown ids are silently absent from the result.
pub fn fetch_by_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<DocumentMeta>, StoreError> {
    let mut out = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(MAX_PARAMS_PER_STATEMENT) {
        let sql = format!(
            "SELECT id, filepath, filename, file_type, mtime, preview_content
             FROM documents WHERE id IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (id, filepath, filename, file_type, mtime, preview) in rows {
            let file_type =
                FileType::parse(&file_type).ok_or(StoreError::UnknownFileType(file_type))?;
            out.push(DocumentMeta {
                id,
                filepath,
                filename,
                file_type,
                mtime,
                preview,
            });
        }
    }
    Ok(out)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

/// Convert bytes to f32 vector (embedding deserialization)
pub fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Convert f32 vector to bytes (embedding serialization)
pub fn f32_vec_to_bytes(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}
