//! SQLite-backed [`RecordStore`] implementation.
//!
//! Record inserts run in one transaction per call: the record row, any new
//! tag rows, and the join rows commit together or not at all. Tag creation
//! is `INSERT .. ON CONFLICT(name) DO NOTHING` followed by a lookup, so two
//! writers racing on the same new tag name both end up with the same id.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use hack_timeline_core::models::{
    normalize_tag_names, NewRecord, Record, RecordFields, RecordKind, Tag, Watermark,
};
use hack_timeline_core::store::RecordStore;

use crate::config::Config;
use crate::{db, migrate};

/// SQLite implementation of the [`RecordStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and apply migrations.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Load the tag sets of `records` and attach them, one query per
    /// [`TAG_LOOKUP_CHUNK`] records.
    async fn attach_tags(&self, kind: RecordKind, records: &mut [Record]) -> Result<()> {
        let mut by_record: HashMap<i64, Vec<Tag>> = HashMap::new();

        for chunk in records.chunks(TAG_LOOKUP_CHUNK) {
            let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT rt.record_id, t.id, t.name FROM {} rt JOIN tags t ON t.id = rt.tag_id \
                 WHERE rt.record_id IN ({}) ORDER BY t.name",
                link_table(kind),
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for record in chunk {
                query = query.bind(record.id);
            }
            for row in query.fetch_all(&self.pool).await? {
                by_record.entry(row.get(0)).or_default().push(Tag {
                    id: row.get(1),
                    name: row.get(2),
                });
            }
        }
        for record in records.iter_mut() {
            record.tags = by_record.remove(&record.id).unwrap_or_default();
        }
        Ok(())
    }
}

/// Ids bound per tag lookup; SQLite caps host parameters per statement.
const TAG_LOOKUP_CHUNK: usize = 500;

fn record_table(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Hacking => "hacking_records",
        RecordKind::Transfer => "transfer_records",
    }
}

fn link_table(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Hacking => "hacking_record_tags",
        RecordKind::Transfer => "transfer_record_tags",
    }
}

fn field_columns(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Hacking => "r.protocol, r.network, r.amount, r.tx_hash",
        RecordKind::Transfer => "r.token, r.amount, r.from_address, r.to_address",
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).with_context(|| format!("timestamp out of range: {}ms", ms))
}

fn secs_to_utc(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).with_context(|| format!("timestamp out of range: {}s", secs))
}

fn record_from_row(kind: RecordKind, row: &SqliteRow) -> Result<Record> {
    let fields = match kind {
        RecordKind::Hacking => RecordFields::Hacking {
            protocol: row.get("protocol"),
            network: row.get("network"),
            amount: row.get("amount"),
            tx_hash: row.get("tx_hash"),
        },
        RecordKind::Transfer => RecordFields::Transfer {
            token: row.get("token"),
            amount: row.get("amount"),
            from: row.get("from_address"),
            to: row.get("to_address"),
        },
    };
    Ok(Record {
        id: row.get("id"),
        kind,
        channel: row.get("channel"),
        message_id: row.get("message_id"),
        report_time: millis_to_utc(row.get("report_time_ms"))?,
        fields,
        tags: Vec::new(),
    })
}

fn watermark_from_row(row: &SqliteRow) -> Result<Watermark> {
    let kind: String = row.get("kind");
    Ok(Watermark {
        kind: kind.parse()?,
        channel: row.get("channel"),
        last_message_id: row.get("last_message_id"),
        updated_at: secs_to_utc(row.get("updated_at"))?,
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_record(&self, record: &NewRecord, tag_names: &[String]) -> Result<i64> {
        let names = normalize_tag_names(tag_names);
        let kind = record.kind();
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        let inserted = match &record.fields {
            RecordFields::Hacking {
                protocol,
                network,
                amount,
                tx_hash,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO hacking_records (channel, message_id, report_time_ms, protocol, network, amount, tx_hash, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&record.channel)
                .bind(record.message_id)
                .bind(record.report_time.timestamp_millis())
                .bind(protocol)
                .bind(network)
                .bind(amount)
                .bind(tx_hash)
                .bind(now)
                .execute(&mut *tx)
                .await?
            }
            RecordFields::Transfer {
                token,
                amount,
                from,
                to,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO transfer_records (channel, message_id, report_time_ms, token, amount, from_address, to_address, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&record.channel)
                .bind(record.message_id)
                .bind(record.report_time.timestamp_millis())
                .bind(token)
                .bind(amount)
                .bind(from)
                .bind(to)
                .bind(now)
                .execute(&mut *tx)
                .await?
            }
        };
        let record_id = inserted.last_insert_rowid();

        let link_sql = format!(
            "INSERT INTO {} (record_id, tag_id) VALUES (?, ?)",
            link_table(kind)
        );
        for name in &names {
            sqlx::query("INSERT INTO tags (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
                .bind(name)
                .execute(&mut *tx)
                .await?;

            let tag_id: i64 = sqlx::query_scalar("SELECT id FROM tags WHERE name = ?")
                .bind(name)
                .fetch_one(&mut *tx)
                .await
                .with_context(|| format!("tag '{}' missing after insert", name))?;

            sqlx::query(&link_sql)
                .bind(record_id)
                .bind(tag_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(record_id)
    }

    async fn list_by_tags_before(
        &self,
        kind: RecordKind,
        tag_names: &[String],
        cursor_id: i64,
        limit: i64,
    ) -> Result<Vec<Record>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let names = normalize_tag_names(tag_names);

        let mut sql = format!(
            "SELECT DISTINCT r.id, r.channel, r.message_id, r.report_time_ms, {} FROM {} r",
            field_columns(kind),
            record_table(kind)
        );
        let mut clauses = Vec::new();
        if !names.is_empty() {
            sql.push_str(&format!(
                " JOIN {} rt ON rt.record_id = r.id JOIN tags t ON t.id = rt.tag_id",
                link_table(kind)
            ));
            let placeholders = names.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            clauses.push(format!("t.name IN ({})", placeholders));
        }
        if cursor_id > 0 {
            clauses.push("r.id < ?".to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY r.id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        for name in &names {
            query = query.bind(name);
        }
        if cursor_id > 0 {
            query = query.bind(cursor_id);
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;

        let mut records = rows
            .iter()
            .map(|r| record_from_row(kind, r))
            .collect::<Result<Vec<_>>>()?;
        self.attach_tags(kind, &mut records).await?;
        Ok(records)
    }

    async fn list_all_tags(&self) -> Result<Vec<Tag>> {
        let rows = sqlx::query("SELECT id, name FROM tags ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| Tag {
                id: row.get("id"),
                name: row.get("name"),
            })
            .collect())
    }

    async fn get_watermark(&self, kind: RecordKind, channel: &str) -> Result<Option<Watermark>> {
        let row = sqlx::query(
            "SELECT kind, channel, last_message_id, updated_at FROM watermarks WHERE kind = ? AND channel = ?",
        )
        .bind(kind.as_str())
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(watermark_from_row).transpose()
    }

    async fn insert_watermark(
        &self,
        kind: RecordKind,
        channel: &str,
        last_message_id: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO watermarks (kind, channel, last_message_id, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(kind.as_str())
        .bind(channel)
        .bind(last_message_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create watermark for {}:{}", kind, channel))?;
        Ok(())
    }

    async fn update_watermark(
        &self,
        kind: RecordKind,
        channel: &str,
        last_message_id: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE watermarks
            SET last_message_id = MAX(last_message_id, ?), updated_at = ?
            WHERE kind = ? AND channel = ?
            "#,
        )
        .bind(last_message_id)
        .bind(Utc::now().timestamp())
        .bind(kind.as_str())
        .bind(channel)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("no watermark for {}:{}", kind, channel);
        }
        Ok(())
    }

    async fn list_watermarks(&self) -> Result<Vec<Watermark>> {
        let rows = sqlx::query(
            "SELECT kind, channel, last_message_id, updated_at FROM watermarks ORDER BY kind, channel",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(watermark_from_row).collect()
    }
}
