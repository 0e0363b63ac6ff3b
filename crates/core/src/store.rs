//! Local message store access: snapshot copy, schema listing and record extraction.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde::Serialize;

use crate::conversation::MessageRecord;
use crate::helpers::TapbackFilter;
use crate::{Error, RecordSource, Result, OWNER_SENTINEL};

/// Message store location relative to home (macOS).
const NATIVE_STORE_REL: &str = "Library/Messages/chat.db";

/// Working copy written to the current directory.
const LOCAL_STORE_NAME: &str = "imessages.db";

/// Where the store lives and where the working copy goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        Self {
            source_path: home.join(NATIVE_STORE_REL),
            destination_path: PathBuf::from(LOCAL_STORE_NAME),
        }
    }
}

/// Which conversations to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordScope {
    #[default]
    All,
    /// Only the first non-group conversation; useful for a quick check.
    FirstConversation,
}

/// Column description as reported by `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub cid: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    pub notnull: bool,
    pub dflt_value: Option<String>,
    pub pk: i64,
}

/// Copy the store to its working location and check the copy opens as SQLite.
///
/// Nothing downstream should run over a snapshot that fails here.
pub fn copy_message_store(config: &StoreConfig) -> Result<PathBuf> {
    let source = &config.source_path;
    let destination = &config.destination_path;

    if !source.exists() {
        return Err(Error::StoreNotFound(source.clone()));
    }

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    fs::copy(source, destination).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => Error::PermissionDenied(source.clone()),
        _ => Error::Io(e),
    })?;
    tracing::info!("copied message store to {:?}", destination);

    verify_store(destination)?;
    tracing::info!("verified the copied message store");

    Ok(destination.clone())
}

/// Open read-only and touch the schema; fails on anything that isn't SQLite.
fn verify_store(path: &Path) -> Result<()> {
    let conn = open_read_only(path)?;
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(())
}

pub fn open_read_only(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(Error::StoreNotFound(path.to_path_buf()));
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

/// List every table with its columns.
pub fn describe_schema(conn: &Connection) -> Result<BTreeMap<String, Vec<ColumnInfo>>> {
    let mut tables_stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let tables = tables_stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut columns_stmt = conn.prepare(
        "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1)",
    )?;

    let mut structure = BTreeMap::new();
    for table in tables {
        let columns = columns_stmt
            .query_map([&table], |row| {
                Ok(ColumnInfo {
                    cid: row.get(0)?,
                    name: row.get(1)?,
                    column_type: row.get(2)?,
                    notnull: row.get::<_, i64>(3)? != 0,
                    dflt_value: row.get(4)?,
                    pk: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<ColumnInfo>>>()?;
        structure.insert(table, columns);
    }

    Ok(structure)
}

/// Options for the record query.
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub scope: RecordScope,
    pub tapbacks: TapbackFilter,
    /// Sender value given to messages the owner wrote.
    pub owner_sentinel: String,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            scope: RecordScope::default(),
            tapbacks: TapbackFilter::default(),
            owner_sentinel: OWNER_SENTINEL.to_string(),
        }
    }
}

/// Escape `%`, `_` and `\` so a pattern matches literally under `LIKE ... ESCAPE '\'`.
fn like_literal(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('%');
    for ch in pattern.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

fn build_record_sql(query: &RecordQuery) -> String {
    let mut base = String::from(
        "SELECT
            CASE WHEN m.is_from_me = 1 THEN ?1 ELSE h.id END AS sender,
            m.text AS message,
            c.chat_identifier AS chat_identifier,
            m.date AS message_date
        FROM message m
        JOIN chat_message_join cmj ON cmj.message_id = m.ROWID
        JOIN chat c ON c.ROWID = cmj.chat_id
        LEFT JOIN handle h ON h.ROWID = m.handle_id
        WHERE c.chat_identifier NOT LIKE 'chat%'
            AND m.text IS NOT NULL
            AND m.text != ''
            AND (m.is_from_me = 1 OR h.id IS NOT NULL)",
    );
    for i in 0..query.tapbacks.patterns().len() {
        base.push_str(&format!("\n            AND m.text NOT LIKE ?{} ESCAPE '\\'", i + 2));
    }

    match query.scope {
        RecordScope::All => format!(
            "WITH base AS ({base})
            SELECT sender, message, chat_identifier, message_date FROM base
            ORDER BY chat_identifier, message_date"
        ),
        RecordScope::FirstConversation => format!(
            "WITH base AS ({base})
            SELECT sender, message, chat_identifier, message_date FROM base
            WHERE chat_identifier = (
                SELECT chat_identifier FROM base ORDER BY chat_identifier LIMIT 1
            )
            ORDER BY message_date"
        ),
    }
}

/// Extract ordered non-group records with reactions removed.
///
/// SQLite `LIKE` is case-insensitive for ASCII, so the store-side filter is
/// broader than `TapbackFilter::is_tapback`.
pub fn read_records(conn: &Connection, query: &RecordQuery) -> Result<Vec<MessageRecord>> {
    let sql = build_record_sql(query);
    let mut params = vec![query.owner_sentinel.clone()];
    params.extend(query.tapbacks.patterns().iter().map(|p| like_literal(p)));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        Ok(MessageRecord {
            sender: row.get(0)?,
            text: row.get(1)?,
            conversation_id: row.get(2)?,
            timestamp: row.get(3)?,
        })
    })?;

    let records = rows.collect::<rusqlite::Result<Vec<MessageRecord>>>()?;
    tracing::info!(records = records.len(), scope = ?query.scope, "read message records");
    Ok(records)
}

/// A message store snapshot used as a record source.
#[derive(Debug, Clone)]
pub struct MessageStore {
    pub path: PathBuf,
    pub query: RecordQuery,
}

impl MessageStore {
    pub fn new(path: impl Into<PathBuf>, query: RecordQuery) -> Self {
        Self {
            path: path.into(),
            query,
        }
    }
}

impl RecordSource for MessageStore {
    fn records(&self) -> Result<Vec<MessageRecord>> {
        let conn = open_read_only(&self.path)?;
        read_records(&conn, &self.query)
    }
}
