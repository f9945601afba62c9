//! Relational backend on SQLite

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::debug;

use super::{acquire_lock, not_found, Backend, BasketEntry, BasketSummary};
use crate::basket::{BasketConfig, NamesPage, Page, RequestsPage};
use crate::capture::{CaptureRecord, HeaderValues, QueryMap, StoredRecord};
use crate::config::BackendKind;
use crate::{BasketsError, Result};

/// Target that opens a private in-memory database
pub const IN_MEMORY: &str = ":memory:";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS baskets (
        name TEXT PRIMARY KEY,
        token TEXT NOT NULL,
        forward_url TEXT NOT NULL,
        capacity INTEGER NOT NULL,
        expand_path INTEGER NOT NULL,
        total_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS requests (
        basket TEXT NOT NULL REFERENCES baskets(name) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        method TEXT NOT NULL,
        path TEXT NOT NULL,
        query TEXT NOT NULL,
        raw_query TEXT NOT NULL,
        headers TEXT NOT NULL,
        body BLOB NOT NULL,
        body_truncated INTEGER NOT NULL,
        content_length INTEGER NOT NULL,
        remote_addr TEXT NOT NULL,
        date INTEGER NOT NULL,
        PRIMARY KEY (basket, seq)
    );
";

const SELECT_REQUEST: &str = "SELECT seq, method, path, query, raw_query, headers, body,
        body_truncated, content_length, remote_addr, date
    FROM requests WHERE basket = ?1 ORDER BY seq DESC LIMIT ?2 OFFSET ?3";

/// Backend storing baskets and requests in two SQLite tables
///
/// The connection is not `Sync`, so it sits behind a mutex; every operation
/// that touches both tables runs in one transaction.
pub struct SqlBackend {
    conn: Mutex<Connection>,
}

impl SqlBackend {
    /// Open the database at `target`, or a private in-memory one for `:memory:`
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or its schema created
    pub fn open(target: &str) -> Result<Self> {
        let conn = if target == IN_MEMORY {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(target).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(target)?
        };

        configure_connection(&conn, target != IN_MEMORY)?;
        conn.execute_batch(SCHEMA)?;
        debug!("Opened SQL backend at {}", target);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn configure_connection(conn: &Connection, durable: bool) -> Result<()> {
    if durable {
        // journal_mode answers with the resulting mode as a row
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn load_entry(tx: &Connection, name: &str) -> Result<Option<BasketEntry>> {
    let entry = tx
        .query_row(
            "SELECT token, forward_url, capacity, expand_path, total_count
             FROM baskets WHERE name = ?1",
            params![name],
            |row| {
                Ok(BasketEntry {
                    token: row.get(0)?,
                    config: BasketConfig {
                        forward_url: row.get(1)?,
                        capacity: usize::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
                        expand_path: row.get(3)?,
                    },
                    total_count: from_sql_int(row.get(4)?),
                })
            },
        )
        .optional()?;
    Ok(entry)
}

fn held_count(conn: &Connection, name: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM requests WHERE basket = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or(0))
}

/// Delete every record with a sequence number at or below `floor`
fn evict_through(tx: &Transaction<'_>, name: &str, floor: u64) -> Result<usize> {
    Ok(tx.execute(
        "DELETE FROM requests WHERE basket = ?1 AND seq <= ?2",
        params![name, to_sql_int(floor)],
    )?)
}

fn decode_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| BasketsError::InvalidFormat(format!("Invalid stored JSON: {e}")))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| BasketsError::InvalidFormat(format!("Cannot encode value: {e}")))
}

struct RequestRow {
    seq: i64,
    method: String,
    path: String,
    query: String,
    raw_query: String,
    headers: String,
    body: Vec<u8>,
    body_truncated: bool,
    content_length: i64,
    remote_addr: String,
    date: i64,
}

impl RequestRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            method: row.get(1)?,
            path: row.get(2)?,
            query: row.get(3)?,
            raw_query: row.get(4)?,
            headers: row.get(5)?,
            body: row.get(6)?,
            body_truncated: row.get(7)?,
            content_length: row.get(8)?,
            remote_addr: row.get(9)?,
            date: row.get(10)?,
        })
    }

    fn into_stored(self) -> Result<StoredRecord> {
        Ok(StoredRecord {
            id: from_sql_int(self.seq),
            record: CaptureRecord {
                method: self.method,
                path: self.path,
                query: decode_json::<QueryMap>(&self.query)?,
                raw_query: self.raw_query,
                headers: decode_json::<HeaderValues>(&self.headers)?,
                body: self.body,
                body_truncated: self.body_truncated,
                content_length: from_sql_int(self.content_length),
                remote_addr: self.remote_addr,
                date: from_sql_int(self.date),
            },
        })
    }
}

impl Backend for SqlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sql
    }

    fn create(&self, name: &str, entry: &BasketEntry) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO baskets
                (name, token, forward_url, capacity, expand_path, total_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                name,
                entry.token,
                entry.config.forward_url,
                to_sql_int(entry.config.capacity as u64),
                entry.config.expand_path,
                to_sql_int(entry.total_count),
                to_sql_int(crate::capture::now_millis()),
            ],
        )?;

        if inserted == 0 {
            return Err(BasketsError::NameConflict(name.to_string()));
        }
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<BasketEntry>> {
        let conn = acquire_lock(&self.conn);
        load_entry(&conn, name)
    }

    fn update(&self, name: &str, config: &BasketConfig) -> Result<()> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn.transaction()?;

        let entry = load_entry(&tx, name)?.ok_or_else(|| not_found(name))?;
        tx.execute(
            "UPDATE baskets SET forward_url = ?2, capacity = ?3, expand_path = ?4 WHERE name = ?1",
            params![
                name,
                config.forward_url,
                to_sql_int(config.capacity as u64),
                config.expand_path
            ],
        )?;
        evict_through(
            &tx,
            name,
            entry.total_count.saturating_sub(config.capacity as u64),
        )?;

        tx.commit()?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM requests WHERE basket = ?1", params![name])?;
        let removed = tx.execute("DELETE FROM baskets WHERE name = ?1", params![name])?;

        tx.commit()?;
        Ok(removed > 0)
    }

    fn append(&self, name: &str, record: CaptureRecord) -> Result<StoredRecord> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn.transaction()?;

        let entry = load_entry(&tx, name)?.ok_or_else(|| not_found(name))?;
        let seq = entry.total_count + 1;

        tx.execute(
            "INSERT INTO requests
                (basket, seq, method, path, query, raw_query, headers, body,
                 body_truncated, content_length, remote_addr, date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                name,
                to_sql_int(seq),
                record.method,
                record.path,
                encode_json(&record.query)?,
                record.raw_query,
                encode_json(&record.headers)?,
                record.body,
                record.body_truncated,
                to_sql_int(record.content_length),
                record.remote_addr,
                to_sql_int(record.date),
            ],
        )?;
        evict_through(
            &tx,
            name,
            seq.saturating_sub(entry.config.capacity as u64),
        )?;
        tx.execute(
            "UPDATE baskets SET total_count = ?2 WHERE name = ?1",
            params![name, to_sql_int(seq)],
        )?;

        tx.commit()?;
        Ok(StoredRecord { id: seq, record })
    }

    fn requests(&self, name: &str, page: Page) -> Result<RequestsPage> {
        let conn = acquire_lock(&self.conn);

        let entry = load_entry(&conn, name)?.ok_or_else(|| not_found(name))?;
        let count = held_count(&conn, name)?;

        let mut stmt = conn.prepare_cached(SELECT_REQUEST)?;
        let rows = stmt
            .query_map(
                params![
                    name,
                    to_sql_int(page.max as u64),
                    to_sql_int(page.skip as u64)
                ],
                RequestRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let requests = rows
            .into_iter()
            .map(RequestRow::into_stored)
            .collect::<Result<Vec<_>>>()?;

        Ok(RequestsPage {
            requests,
            count,
            total_count: entry.total_count,
            has_more: page.has_more(count),
        })
    }

    fn clear(&self, name: &str) -> Result<()> {
        let mut conn = acquire_lock(&self.conn);
        let tx = conn.transaction()?;

        let entry = load_entry(&tx, name)?.ok_or_else(|| not_found(name))?;
        evict_through(&tx, name, entry.total_count)?;

        tx.commit()?;
        Ok(())
    }

    fn names(&self, page: Page) -> Result<NamesPage> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn.prepare_cached("SELECT name FROM baskets ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(NamesPage::from_sorted(names, page))
    }

    fn summaries(&self) -> Result<Vec<BasketSummary>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn.prepare_cached(
            "SELECT b.name, COUNT(r.seq), b.total_count, MAX(r.date)
             FROM baskets b LEFT JOIN requests r ON r.basket = b.name
             GROUP BY b.name",
        )?;

        let summaries = stmt
            .query_map([], |row| {
                Ok(BasketSummary {
                    name: row.get(0)?,
                    count: usize::try_from(row.get::<_, i64>(1)?).unwrap_or(0),
                    total_count: from_sql_int(row.get(2)?),
                    last_date: row.get::<_, Option<i64>>(3)?.map(from_sql_int),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{HeaderMap, Method};

    fn record(path: &str) -> CaptureRecord {
        let mut headers = HeaderMap::new();
        headers.append("x-test", "a".parse().unwrap());
        headers.append("x-test", "b".parse().unwrap());
        CaptureRecord::from_parts(
            &Method::POST,
            &path.parse().unwrap(),
            &headers,
            vec![0xFF, 0x00, 0x41],
            false,
            "127.0.0.1:1",
        )
    }

    #[test]
    fn test_record_fields_survive_storage() {
        let backend = SqlBackend::open(IN_MEMORY).unwrap();
        backend
            .create("orders", &BasketEntry::new("t", BasketConfig::with_capacity(5)))
            .unwrap();

        let stored = backend.append("orders", record("/orders?x=2&x=1&flag")).unwrap();
        let page = backend.requests("orders", Page::all()).unwrap();

        assert_eq!(page.requests, vec![stored]);
        assert_eq!(page.requests[0].record.raw_query, "x=2&x=1&flag");
        assert_eq!(page.requests[0].record.body, vec![0xFF, 0x00, 0x41]);
        assert_eq!(page.requests[0].record.headers["X-Test"], vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_create() {
        let backend = SqlBackend::open(IN_MEMORY).unwrap();
        let entry = BasketEntry::new("t", BasketConfig::with_capacity(5));

        backend.create("dup", &entry).unwrap();
        assert!(matches!(
            backend.create("dup", &entry),
            Err(BasketsError::NameConflict(_))
        ));
    }

    #[test]
    fn test_paging_and_eviction() {
        let backend = SqlBackend::open(IN_MEMORY).unwrap();
        backend
            .create("p", &BasketEntry::new("t", BasketConfig::with_capacity(4)))
            .unwrap();
        for i in 1..=6 {
            backend.append("p", record(&format!("/p/{i}"))).unwrap();
        }

        let page = backend.requests("p", Page::new(2, 1)).unwrap();
        let ids: Vec<u64> = page.requests.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 4]);
        assert_eq!(page.count, 4);
        assert_eq!(page.total_count, 6);
        assert!(page.has_more);
    }

    #[test]
    fn test_file_database_reopens() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("baskets.sqlite");
        let target = target.to_str().unwrap();

        {
            let backend = SqlBackend::open(target).unwrap();
            backend
                .create("keep", &BasketEntry::new("t", BasketConfig::with_capacity(5)))
                .unwrap();
            backend.append("keep", record("/keep")).unwrap();
        }

        let backend = SqlBackend::open(target).unwrap();
        assert_eq!(backend.load("keep").unwrap().unwrap().total_count, 1);
        assert_eq!(backend.summaries().unwrap()[0].count, 1);
    }
}
