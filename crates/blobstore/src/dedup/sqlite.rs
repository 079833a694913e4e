//! SQLite-backed catalog

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::catalog::{BlobCatalog, locator_volume};
use crate::models::{
    BlobReference, Mailbox, MailboxBlobInfo, MailboxId, Volume, VolumeId, VolumeKind,
    VolumeMetadata,
};

/// Database migrations
///
/// Applied in order; `user_version` tracks progress.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: volumes, mailboxes and item blobs
        M::up(
            r#"
            CREATE TABLE volumes (
                id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                root TEXT NOT NULL,
                mailbox_group_bits INTEGER NOT NULL,
                mailbox_bits INTEGER NOT NULL,
                file_group_bits INTEGER NOT NULL,
                file_bits INTEGER NOT NULL,
                compress_blobs INTEGER NOT NULL DEFAULT 0,
                compression_threshold INTEGER NOT NULL,
                last_sync_date INTEGER NOT NULL DEFAULT 0,
                current_sync_date INTEGER NOT NULL DEFAULT 0,
                group_id INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE mailboxes (
                id INTEGER PRIMARY KEY,
                group_id INTEGER NOT NULL,
                account_id TEXT NOT NULL
            );

            CREATE INDEX idx_mailboxes_group ON mailboxes(group_id);

            -- One row per item revision whose blob lives on a volume
            CREATE TABLE item_blobs (
                mailbox_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL,
                revision INTEGER NOT NULL,
                volume_id INTEGER NOT NULL,
                digest TEXT NOT NULL,
                size INTEGER NOT NULL,
                created INTEGER NOT NULL,
                PRIMARY KEY (mailbox_id, item_id, revision)
            );

            CREATE INDEX idx_item_blobs_volume ON item_blobs(volume_id, created);
            "#,
        ),
        // Migration 2: dedup references
        M::up(
            r#"
            CREATE TABLE volume_blobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                volume_id INTEGER NOT NULL,
                mailbox_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL,
                revision INTEGER NOT NULL,
                digest TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                UNIQUE (volume_id, mailbox_id, item_id, revision)
            );

            CREATE INDEX idx_volume_blobs_digest ON volume_blobs(volume_id, digest);
            "#,
        ),
    ])
}

const VOLUME_COLUMNS: &str = "id, kind, root, mailbox_group_bits, mailbox_bits, file_group_bits, \
     file_bits, compress_blobs, compression_threshold, last_sync_date, current_sync_date, group_id";

const REF_COLUMNS: &str = "id, mailbox_id, volume_id, item_id, revision, digest, processed";

/// SQLite catalog
///
/// A single connection behind a mutex; the deduper is the only heavy user.
pub struct SqliteBlobCatalog {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteBlobCatalog {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let mut conn = Connection::open(&path)
            .with_context(|| format!("Failed to open catalog at {:?}", path))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run catalog migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("catalog connection lock poisoned"))
    }
}

fn volume_from_row(row: &Row) -> rusqlite::Result<Volume> {
    let kind: String = row.get(1)?;
    let root: String = row.get(2)?;
    let kind = VolumeKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown volume kind {kind}").into(),
        )
    })?;
    let mut volume = Volume::new(row.get(0)?, kind, root);
    volume.mailbox_group_bits = row.get(3)?;
    volume.mailbox_bits = row.get(4)?;
    volume.file_group_bits = row.get(5)?;
    volume.file_bits = row.get(6)?;
    volume.compress_blobs = row.get(7)?;
    volume.compression_threshold = row.get::<_, i64>(8)? as u64;
    volume.metadata = VolumeMetadata::new(row.get(9)?, row.get(10)?, row.get(11)?);
    Ok(volume)
}

fn reference_from_row(row: &Row) -> rusqlite::Result<BlobReference> {
    Ok(BlobReference {
        id: row.get(0)?,
        mailbox_id: MailboxId(row.get(1)?),
        volume_id: row.get(2)?,
        item_id: row.get(3)?,
        revision: row.get(4)?,
        digest: row.get(5)?,
        processed: row.get(6)?,
        file_info: None,
    })
}

impl BlobCatalog for SqliteBlobCatalog {
    fn upsert_volume(&self, volume: &Volume) -> Result<()> {
        let conn = self.conn()?;
        // The scan cursor columns are only set on first insert
        conn.execute(
            r#"
            INSERT INTO volumes (id, kind, root, mailbox_group_bits, mailbox_bits,
                file_group_bits, file_bits, compress_blobs, compression_threshold,
                last_sync_date, current_sync_date, group_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                root = excluded.root,
                mailbox_group_bits = excluded.mailbox_group_bits,
                mailbox_bits = excluded.mailbox_bits,
                file_group_bits = excluded.file_group_bits,
                file_bits = excluded.file_bits,
                compress_blobs = excluded.compress_blobs,
                compression_threshold = excluded.compression_threshold
            "#,
            params![
                volume.id,
                volume.kind.as_str(),
                volume.root.to_string_lossy(),
                volume.mailbox_group_bits,
                volume.mailbox_bits,
                volume.file_group_bits,
                volume.file_bits,
                volume.compress_blobs,
                volume.compression_threshold as i64,
                volume.metadata.last_sync_date,
                volume.metadata.current_sync_date,
                volume.metadata.group_id,
            ],
        )?;
        Ok(())
    }

    fn volume(&self, id: VolumeId) -> Result<Option<Volume>> {
        let conn = self.conn()?;
        let volume = conn
            .query_row(
                &format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE id = ?1"),
                [id],
                volume_from_row,
            )
            .optional()?;
        Ok(volume)
    }

    fn volumes(&self) -> Result<Vec<Volume>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {VOLUME_COLUMNS} FROM volumes ORDER BY id"))?;
        let volumes = stmt
            .query_map([], volume_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(volumes)
    }

    fn update_volume_metadata(&self, id: VolumeId, metadata: VolumeMetadata) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE volumes SET last_sync_date = ?2, current_sync_date = ?3, group_id = ?4 WHERE id = ?1",
            params![
                id,
                metadata.last_sync_date,
                metadata.current_sync_date,
                metadata.group_id
            ],
        )?;
        if updated == 0 {
            return Err(anyhow!("unknown volume {}", id));
        }
        Ok(())
    }

    fn upsert_mailbox(&self, mailbox: &Mailbox) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO mailboxes (id, group_id, account_id) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                group_id = excluded.group_id,
                account_id = excluded.account_id
            "#,
            params![mailbox.id.as_i32(), mailbox.group_id, mailbox.account_id],
        )?;
        Ok(())
    }

    fn mailbox_group_ids(&self) -> Result<Vec<i32>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT group_id FROM mailboxes ORDER BY group_id")?;
        let groups = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i32>, _>>()?;
        Ok(groups)
    }

    fn record_item_blob(
        &self,
        info: &MailboxBlobInfo,
        volume_id: VolumeId,
        created: i64,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO item_blobs (mailbox_id, item_id, revision, volume_id, digest, size, created)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(mailbox_id, item_id, revision) DO UPDATE SET
                volume_id = excluded.volume_id,
                digest = excluded.digest,
                size = excluded.size,
                created = excluded.created
            "#,
            params![
                info.mailbox_id.as_i32(),
                info.item_id,
                info.revision,
                volume_id,
                info.digest,
                info.size as i64,
                created
            ],
        )?;
        Ok(())
    }

    fn all_blobs(
        &self,
        group_id: Option<i32>,
        volume_id: VolumeId,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<MailboxBlobInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT b.mailbox_id, b.item_id, b.revision, b.volume_id, b.digest, b.size
            FROM item_blobs b
            LEFT JOIN mailboxes m ON m.id = b.mailbox_id
            WHERE b.volume_id = ?1
              AND (?2 IS NULL OR m.group_id = ?2)
              AND (?3 IS NULL OR b.created >= ?3)
              AND (?4 IS NULL OR b.created <= ?4)
            ORDER BY b.mailbox_id, b.item_id, b.revision
            "#,
        )?;
        let blobs = stmt
            .query_map(params![volume_id, group_id, from, to], |row| {
                let volume: VolumeId = row.get(3)?;
                Ok(MailboxBlobInfo {
                    mailbox_id: MailboxId(row.get(0)?),
                    item_id: row.get(1)?,
                    revision: row.get(2)?,
                    locator: volume.to_string(),
                    digest: row.get(4)?,
                    size: row.get::<_, i64>(5)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blobs)
    }

    fn add_blob_reference(&self, info: &MailboxBlobInfo) -> Result<bool> {
        let volume_id = locator_volume(&info.locator)?;
        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
            INSERT INTO volume_blobs (volume_id, mailbox_id, item_id, revision, digest, processed)
            VALUES (?1, ?2, ?3, ?4, ?5, 0)
            ON CONFLICT(volume_id, mailbox_id, item_id, revision) DO NOTHING
            "#,
            params![
                volume_id,
                info.mailbox_id.as_i32(),
                info.item_id,
                info.revision,
                info.digest
            ],
        )?;
        Ok(inserted == 1)
    }

    fn blob_references(&self, digest: &str, volume_id: VolumeId) -> Result<Vec<BlobReference>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REF_COLUMNS} FROM volume_blobs WHERE volume_id = ?1 AND digest = ?2 ORDER BY id"
        ))?;
        let refs = stmt
            .query_map(params![volume_id, digest], reference_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(refs)
    }

    fn volume_blob_references(&self, volume_id: VolumeId) -> Result<Vec<BlobReference>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REF_COLUMNS} FROM volume_blobs WHERE volume_id = ?1 ORDER BY id"
        ))?;
        let refs = stmt
            .query_map([volume_id], reference_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(refs)
    }

    fn unique_digests(&self, volume_id: VolumeId) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT digest FROM volume_blobs WHERE volume_id = ?1 ORDER BY digest",
        )?;
        let digests = stmt
            .query_map([volume_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(digests)
    }

    fn update_processed(&self, id: i64, processed: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE volume_blobs SET processed = ?2 WHERE id = ?1",
            params![id, processed],
        )?;
        Ok(())
    }

    fn delete_blob_ref(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM volume_blobs WHERE id = ?1", [id])? > 0)
    }

    fn delete_blob_refs(&self, volume_id: VolumeId) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM volume_blobs WHERE volume_id = ?1", [volume_id])?)
    }

    fn delete_all_blob_refs(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM volume_blobs", [])?)
    }
}
