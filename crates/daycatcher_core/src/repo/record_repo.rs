//! Record repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Save, fetch, probe and delete records of one partition.
//! - Apply remote upserts through an explicit merge policy.
//!
//! # Invariants
//! - A repository only accepts records whose home partition matches its own.
//! - `record_presence` never dereferences the full row.

use crate::db::DbError;
use crate::model::grant::GrantValidationError;
use crate::model::partition::Partition;
use crate::model::record::{Record, RecordId, RecordKind, RecordValidationError};
use crate::repo::bool_to_int;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};

const RECORD_SELECT_SQL: &str = "SELECT
    record_id,
    kind,
    partition,
    root_id,
    title,
    remote_deleted,
    created_at,
    updated_at
FROM records";

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error shared by record, asset and grant persistence.
#[derive(Debug)]
pub enum RepoError {
    Validation(RecordValidationError),
    InvalidGrant(GrantValidationError),
    Db(DbError),
    NotFound(String),
    PartitionMismatch {
        expected: Partition,
        actual: Partition,
    },
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::InvalidGrant(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "row not found: {id}"),
            Self::PartitionMismatch { expected, actual } => write!(
                f,
                "record belongs to partition `{}`, store is `{}`",
                actual.as_str(),
                expected.as_str()
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::InvalidGrant(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::NotFound(_) | Self::PartitionMismatch { .. } | Self::InvalidData(_) => None,
        }
    }
}

impl From<RecordValidationError> for RepoError {
    fn from(value: RecordValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<GrantValidationError> for RepoError {
    fn from(value: GrantValidationError) -> Self {
        Self::InvalidGrant(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// How remote upserts resolve against the local row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The externally applied value always replaces the local row.
    #[default]
    ExternalWins,
    /// The row with the later `updated_at` survives.
    NewestWins,
}

/// Outcome of the cheap existence probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPresence {
    Missing,
    Tombstoned,
    Live { root_id: RecordId },
}

/// Predicate query for record fetches.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub kind: Option<RecordKind>,
    /// Restricts to one aggregate root, including the root itself.
    pub root_id: Option<RecordId>,
    pub include_remote_deleted: bool,
    pub limit: Option<u32>,
}

/// Typed CRUD over records of one partition.
pub trait RecordRepository {
    /// Inserts or replaces a locally written record.
    fn save_record(&self, record: &Record) -> RepoResult<()>;
    /// Applies a remote upsert; returns whether the local row changed.
    fn apply_remote_record(&self, record: &Record, policy: MergePolicy) -> RepoResult<bool>;
    fn get_record(&self, id: &RecordId) -> RepoResult<Option<Record>>;
    fn record_presence(&self, id: &RecordId) -> RepoResult<RecordPresence>;
    fn fetch_records(&self, query: &RecordQuery) -> RepoResult<Vec<Record>>;
    /// Flags a row as remotely deleted without removing it.
    fn mark_remote_deleted(&self, id: &RecordId) -> RepoResult<bool>;
    fn delete_record(&self, id: &RecordId) -> RepoResult<bool>;
}

/// SQLite-backed record repository scoped to one partition.
pub struct SqliteRecordRepository<'conn> {
    conn: &'conn Connection,
    partition: Partition,
}

impl<'conn> SqliteRecordRepository<'conn> {
    pub fn new(conn: &'conn Connection, partition: Partition) -> Self {
        Self { conn, partition }
    }

    fn check_partition(&self, record: &Record) -> RepoResult<()> {
        if record.partition != self.partition {
            return Err(RepoError::PartitionMismatch {
                expected: self.partition,
                actual: record.partition,
            });
        }
        Ok(())
    }

    fn upsert(&self, record: &Record) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO records (
                record_id,
                kind,
                partition,
                root_id,
                title,
                remote_deleted,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(record_id) DO UPDATE SET
                kind = excluded.kind,
                root_id = excluded.root_id,
                title = excluded.title,
                remote_deleted = excluded.remote_deleted,
                updated_at = excluded.updated_at;",
            params![
                record.id.as_str(),
                record.kind.as_str(),
                record.partition.as_str(),
                record.root_id.as_ref().map(RecordId::as_str),
                record.title.as_str(),
                bool_to_int(record.remote_deleted),
                record.created_at_ms,
                record.updated_at_ms,
            ],
        )?;
        Ok(())
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn save_record(&self, record: &Record) -> RepoResult<()> {
        record.validate()?;
        self.check_partition(record)?;
        self.upsert(record)
    }

    fn apply_remote_record(&self, record: &Record, policy: MergePolicy) -> RepoResult<bool> {
        record.validate()?;
        self.check_partition(record)?;

        if policy == MergePolicy::NewestWins {
            let local_updated_at: Option<i64> = self
                .conn
                .query_row(
                    "SELECT updated_at FROM records WHERE record_id = ?1;",
                    [record.id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if matches!(local_updated_at, Some(local) if local > record.updated_at_ms) {
                return Ok(false);
            }
        }

        self.upsert(record)?;
        Ok(true)
    }

    fn get_record(&self, id: &RecordId) -> RepoResult<Option<Record>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{RECORD_SELECT_SQL} WHERE record_id = ?1;"))?;
        let mut rows = stmt.query([id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_record_row(row)?)),
            None => Ok(None),
        }
    }

    fn record_presence(&self, id: &RecordId) -> RepoResult<RecordPresence> {
        let probe: Option<(Option<String>, i64)> = self
            .conn
            .query_row(
                "SELECT root_id, remote_deleted FROM records WHERE record_id = ?1;",
                [id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(match probe {
            None => RecordPresence::Missing,
            Some((_, 1)) => RecordPresence::Tombstoned,
            Some((root_id, _)) => RecordPresence::Live {
                root_id: root_id.map(RecordId::new).unwrap_or_else(|| id.clone()),
            },
        })
    }

    fn fetch_records(&self, query: &RecordQuery) -> RepoResult<Vec<Record>> {
        let mut sql = format!("{RECORD_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();

        if !query.include_remote_deleted {
            sql.push_str(" AND remote_deleted = 0");
        }
        if let Some(kind) = query.kind {
            sql.push_str(" AND kind = ?");
            bind_values.push(Value::Text(kind.as_str().to_string()));
        }
        if let Some(root_id) = &query.root_id {
            sql.push_str(" AND (root_id = ? OR record_id = ?)");
            bind_values.push(Value::Text(root_id.as_str().to_string()));
            bind_values.push(Value::Text(root_id.as_str().to_string()));
        }

        sql.push_str(" ORDER BY updated_at DESC, record_id ASC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row(row)?);
        }
        Ok(records)
    }

    fn mark_remote_deleted(&self, id: &RecordId) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE records SET remote_deleted = 1 WHERE record_id = ?1;",
            [id.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn delete_record(&self, id: &RecordId) -> RepoResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM records WHERE record_id = ?1;", [id.as_str()])?;
        Ok(changed > 0)
    }
}

fn parse_record_row(row: &Row<'_>) -> RepoResult<Record> {
    let kind_text: String = row.get("kind")?;
    let kind = RecordKind::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid record kind `{kind_text}` in records.kind"))
    })?;

    let partition_text: String = row.get("partition")?;
    let partition = Partition::parse(&partition_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid partition `{partition_text}` in records.partition"
        ))
    })?;

    let remote_deleted = match row.get::<_, i64>("remote_deleted")? {
        0 => false,
        1 => true,
        other => {
            return Err(RepoError::InvalidData(format!(
                "invalid remote_deleted value `{other}` in records.remote_deleted"
            )));
        }
    };

    let record = Record {
        id: RecordId::new(row.get::<_, String>("record_id")?),
        kind,
        partition,
        root_id: row.get::<_, Option<String>>("root_id")?.map(RecordId::new),
        title: row.get("title")?,
        remote_deleted,
        created_at_ms: row.get("created_at")?,
        updated_at_ms: row.get("updated_at")?,
    };
    record.validate()?;
    Ok(record)
}
