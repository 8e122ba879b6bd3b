//! Media asset persistence and state-machine writes.
//!
//! # Responsibility
//! - Persist per-asset upload/download state for one partition store.
//! - Expose each state transition as one SQL write that bumps `sequence`.
//!
//! # Invariants
//! - Transition writes that may lose a race take an expected `sequence`;
//!   completion writes do not, so completion always wins.
//! - Interrupted transfers are reset to resumable states, never to success.

use crate::model::asset::{AssetId, DownloadState, MediaAsset, UploadState};
use crate::model::partition::Partition;
use crate::model::record::RecordId;
use crate::repo::record_repo::{RepoError, RepoResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const ASSET_SELECT_SQL: &str = "SELECT
    asset_id,
    memory_id,
    media_path,
    remote_ref,
    upload_state,
    download_state,
    last_attempt_at,
    last_error,
    byte_size,
    progress,
    attempt_count,
    content_sha256,
    sequence
FROM media_assets";

/// Persistence contract for media assets of one partition.
pub trait AssetRepository {
    fn create_asset(&self, asset: &MediaAsset) -> RepoResult<()>;
    /// Inserts or refreshes asset metadata learned from a remote device.
    fn apply_remote_asset(&self, asset: &MediaAsset) -> RepoResult<()>;
    fn get_asset(&self, id: AssetId) -> RepoResult<Option<MediaAsset>>;
    fn get_asset_for_memory(&self, memory_id: &RecordId) -> RepoResult<Option<MediaAsset>>;
    fn list_assets(&self) -> RepoResult<Vec<MediaAsset>>;
    fn list_by_upload_state(&self, states: &[UploadState]) -> RepoResult<Vec<MediaAsset>>;
    /// Assets with a remote reference that are not mid-download. Callers
    /// filter by local presence.
    fn list_download_candidates(&self) -> RepoResult<Vec<MediaAsset>>;
    /// Persists `uploading` and returns the new sequence.
    fn mark_upload_started(&self, id: AssetId, at_ms: i64) -> RepoResult<i64>;
    fn mark_upload_succeeded(&self, id: AssetId, receipt: &UploadCompletion) -> RepoResult<()>;
    /// Records a failure; returns `false` when `expected_sequence` no longer matches.
    fn mark_upload_failed(
        &self,
        id: AssetId,
        error: &str,
        at_ms: i64,
        expected_sequence: i64,
    ) -> RepoResult<bool>;
    fn mark_download_started(&self, id: AssetId, at_ms: i64) -> RepoResult<i64>;
    fn mark_download_succeeded(&self, id: AssetId, media_path: &str) -> RepoResult<()>;
    fn mark_download_failed(
        &self,
        id: AssetId,
        error: &str,
        at_ms: i64,
        expected_sequence: i64,
    ) -> RepoResult<bool>;
    fn update_progress(&self, id: AssetId, fraction: f64) -> RepoResult<()>;
    /// Resets `uploading -> pending` and `downloading -> absent`.
    fn reset_interrupted(&self) -> RepoResult<usize>;
    fn delete_asset(&self, id: AssetId) -> RepoResult<bool>;
}

/// Fields written when an upload is confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCompletion {
    pub remote_ref: String,
    pub byte_size: u64,
    pub content_sha256: String,
}

/// SQLite-backed asset repository scoped to one partition.
pub struct SqliteAssetRepository<'conn> {
    conn: &'conn Connection,
    partition: Partition,
}

impl<'conn> SqliteAssetRepository<'conn> {
    pub fn new(conn: &'conn Connection, partition: Partition) -> Self {
        Self { conn, partition }
    }

    fn query_assets(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> RepoResult<Vec<MediaAsset>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        let mut assets = Vec::new();
        while let Some(row) = rows.next()? {
            assets.push(parse_asset_row(row, self.partition)?);
        }
        Ok(assets)
    }

    fn require_changed(changed: usize, id: AssetId) -> RepoResult<()> {
        if changed == 0 {
            return Err(RepoError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn current_sequence(&self, id: AssetId) -> RepoResult<i64> {
        self.conn
            .query_row(
                "SELECT sequence FROM media_assets WHERE asset_id = ?1;",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepoError::NotFound(id.to_string()))
    }
}

impl AssetRepository for SqliteAssetRepository<'_> {
    fn create_asset(&self, asset: &MediaAsset) -> RepoResult<()> {
        if asset.partition != self.partition {
            return Err(RepoError::PartitionMismatch {
                expected: self.partition,
                actual: asset.partition,
            });
        }
        self.conn.execute(
            "INSERT INTO media_assets (
                asset_id,
                memory_id,
                media_path,
                remote_ref,
                upload_state,
                download_state,
                last_attempt_at,
                last_error,
                byte_size,
                progress,
                attempt_count,
                content_sha256,
                sequence
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13);",
            params![
                asset.asset_id.to_string(),
                asset.memory_id.as_str(),
                asset.media_path.as_deref(),
                asset.remote_ref.as_deref(),
                asset.upload_state.as_str(),
                asset.download_state.as_str(),
                asset.last_attempt_at_ms,
                asset.last_error.as_deref(),
                asset.byte_size as i64,
                asset.progress.clamp(0.0, 1.0),
                asset.attempt_count,
                asset.content_sha256.as_deref(),
                asset.sequence,
            ],
        )?;
        Ok(())
    }

    fn apply_remote_asset(&self, asset: &MediaAsset) -> RepoResult<()> {
        let existing = self.get_asset_for_memory(&asset.memory_id)?;
        match existing {
            // Remote file names are discarded; payloads land at `{asset_id}.bin`.
            None => self.create_asset(&MediaAsset {
                media_path: None,
                ..asset.clone()
            }),
            Some(local) => {
                self.conn.execute(
                    "UPDATE media_assets
                     SET
                        remote_ref = COALESCE(?1, remote_ref),
                        byte_size = ?2,
                        content_sha256 = COALESCE(?3, content_sha256),
                        sequence = sequence + 1
                     WHERE asset_id = ?4;",
                    params![
                        asset.remote_ref.as_deref(),
                        asset.byte_size as i64,
                        asset.content_sha256.as_deref(),
                        local.asset_id.to_string(),
                    ],
                )?;
                Ok(())
            }
        }
    }

    fn get_asset(&self, id: AssetId) -> RepoResult<Option<MediaAsset>> {
        let id_text = id.to_string();
        let mut assets = self.query_assets(
            &format!("{ASSET_SELECT_SQL} WHERE asset_id = ?1;"),
            &[&id_text],
        )?;
        Ok(assets.pop())
    }

    fn get_asset_for_memory(&self, memory_id: &RecordId) -> RepoResult<Option<MediaAsset>> {
        let mut assets = self.query_assets(
            &format!("{ASSET_SELECT_SQL} WHERE memory_id = ?1;"),
            &[&memory_id.as_str()],
        )?;
        Ok(assets.pop())
    }

    fn list_assets(&self) -> RepoResult<Vec<MediaAsset>> {
        self.query_assets(&format!("{ASSET_SELECT_SQL} ORDER BY asset_id ASC;"), &[])
    }

    fn list_by_upload_state(&self, states: &[UploadState]) -> RepoResult<Vec<MediaAsset>> {
        let mut assets = Vec::new();
        for state in states {
            assets.extend(self.query_assets(
                &format!("{ASSET_SELECT_SQL} WHERE upload_state = ?1 ORDER BY asset_id ASC;"),
                &[&state.as_str()],
            )?);
        }
        Ok(assets)
    }

    fn list_download_candidates(&self) -> RepoResult<Vec<MediaAsset>> {
        self.query_assets(
            &format!(
                "{ASSET_SELECT_SQL}
                 WHERE remote_ref IS NOT NULL AND download_state != 'downloading'
                 ORDER BY asset_id ASC;"
            ),
            &[],
        )
    }

    fn mark_upload_started(&self, id: AssetId, at_ms: i64) -> RepoResult<i64> {
        let changed = self.conn.execute(
            "UPDATE media_assets
             SET
                upload_state = 'uploading',
                last_attempt_at = ?1,
                progress = 0,
                sequence = sequence + 1
             WHERE asset_id = ?2;",
            params![at_ms, id.to_string()],
        )?;
        Self::require_changed(changed, id)?;
        self.current_sequence(id)
    }

    fn mark_upload_succeeded(&self, id: AssetId, receipt: &UploadCompletion) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE media_assets
             SET
                upload_state = 'synced',
                remote_ref = ?1,
                byte_size = ?2,
                content_sha256 = ?3,
                last_error = NULL,
                attempt_count = 0,
                progress = 1,
                sequence = sequence + 1
             WHERE asset_id = ?4;",
            params![
                receipt.remote_ref.as_str(),
                receipt.byte_size as i64,
                receipt.content_sha256.as_str(),
                id.to_string(),
            ],
        )?;
        Self::require_changed(changed, id)
    }

    fn mark_upload_failed(
        &self,
        id: AssetId,
        error: &str,
        at_ms: i64,
        expected_sequence: i64,
    ) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE media_assets
             SET
                upload_state = 'failed',
                last_error = ?1,
                last_attempt_at = ?2,
                attempt_count = attempt_count + 1,
                sequence = sequence + 1
             WHERE asset_id = ?3 AND sequence = ?4;",
            params![error, at_ms, id.to_string(), expected_sequence],
        )?;
        Ok(changed > 0)
    }

    fn mark_download_started(&self, id: AssetId, at_ms: i64) -> RepoResult<i64> {
        let changed = self.conn.execute(
            "UPDATE media_assets
             SET
                download_state = 'downloading',
                last_attempt_at = ?1,
                progress = 0,
                sequence = sequence + 1
             WHERE asset_id = ?2;",
            params![at_ms, id.to_string()],
        )?;
        Self::require_changed(changed, id)?;
        self.current_sequence(id)
    }

    fn mark_download_succeeded(&self, id: AssetId, media_path: &str) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE media_assets
             SET
                download_state = 'present',
                media_path = ?1,
                last_error = NULL,
                attempt_count = 0,
                progress = 1,
                sequence = sequence + 1
             WHERE asset_id = ?2;",
            params![media_path, id.to_string()],
        )?;
        Self::require_changed(changed, id)
    }

    fn mark_download_failed(
        &self,
        id: AssetId,
        error: &str,
        at_ms: i64,
        expected_sequence: i64,
    ) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE media_assets
             SET
                download_state = 'absent',
                last_error = ?1,
                last_attempt_at = ?2,
                attempt_count = attempt_count + 1,
                progress = 0,
                sequence = sequence + 1
             WHERE asset_id = ?3 AND sequence = ?4;",
            params![error, at_ms, id.to_string(), expected_sequence],
        )?;
        Ok(changed > 0)
    }

    fn update_progress(&self, id: AssetId, fraction: f64) -> RepoResult<()> {
        self.conn.execute(
            "UPDATE media_assets SET progress = ?1 WHERE asset_id = ?2;",
            params![fraction.clamp(0.0, 1.0), id.to_string()],
        )?;
        Ok(())
    }

    fn reset_interrupted(&self) -> RepoResult<usize> {
        let uploads = self.conn.execute(
            "UPDATE media_assets
             SET upload_state = 'pending', progress = 0, sequence = sequence + 1
             WHERE upload_state = 'uploading';",
            [],
        )?;
        let downloads = self.conn.execute(
            "UPDATE media_assets
             SET download_state = 'absent', progress = 0, sequence = sequence + 1
             WHERE download_state = 'downloading';",
            [],
        )?;
        Ok(uploads + downloads)
    }

    fn delete_asset(&self, id: AssetId) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM media_assets WHERE asset_id = ?1;",
            [id.to_string()],
        )?;
        Ok(changed > 0)
    }
}

fn parse_asset_row(row: &Row<'_>, partition: Partition) -> RepoResult<MediaAsset> {
    let id_text: String = row.get("asset_id")?;
    let asset_id = Uuid::parse_str(&id_text).map_err(|_| {
        RepoError::InvalidData(format!("invalid uuid `{id_text}` in media_assets.asset_id"))
    })?;

    let upload_text: String = row.get("upload_state")?;
    let upload_state = UploadState::parse(&upload_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid upload state `{upload_text}` in media_assets.upload_state"
        ))
    })?;

    let download_text: String = row.get("download_state")?;
    let download_state = DownloadState::parse(&download_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid download state `{download_text}` in media_assets.download_state"
        ))
    })?;

    let byte_size: i64 = row.get("byte_size")?;
    let byte_size = u64::try_from(byte_size).map_err(|_| {
        RepoError::InvalidData(format!("negative byte_size `{byte_size}` in media_assets"))
    })?;

    Ok(MediaAsset {
        asset_id,
        memory_id: RecordId::new(row.get::<_, String>("memory_id")?),
        partition,
        media_path: row.get("media_path")?,
        remote_ref: row.get("remote_ref")?,
        upload_state,
        download_state,
        last_attempt_at_ms: row.get("last_attempt_at")?,
        last_error: row.get("last_error")?,
        byte_size,
        progress: row.get("progress")?,
        attempt_count: row.get("attempt_count")?,
        content_sha256: row.get("content_sha256")?,
        sequence: row.get("sequence")?,
    })
}
