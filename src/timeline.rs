//! Read-only CLI commands: `htl timeline`, `htl tags`, `htl watermarks`.

use anyhow::Result;

use hack_timeline_core::models::{normalize_tag_names, RecordFields, RecordKind};
use hack_timeline_core::store::RecordStore;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

/// Print one page of the timeline, newest first.
///
/// With `before`, only records with an id strictly below it are shown; the
/// last printed id is the cursor for the next page.
pub async fn run_timeline(
    config: &Config,
    kind: RecordKind,
    tags: Option<String>,
    count: i64,
    before: Option<i64>,
) -> Result<()> {
    if count <= 0 {
        anyhow::bail!("--count must be positive");
    }
    let store = SqliteStore::open(config).await?;
    let raw: Vec<&str> = tags.as_deref().unwrap_or_default().split(',').collect();
    let tags = normalize_tag_names(&raw);

    let records = match before {
        Some(cursor) => store.list_by_tags_before(kind, &tags, cursor, count).await?,
        None => store.list_by_tags(kind, &tags, count).await?,
    };

    if records.is_empty() {
        println!("No {} records found.", kind);
        return Ok(());
    }

    for record in &records {
        let tag_list: Vec<&str> = record.tags.iter().map(|t| t.name.as_str()).collect();
        let detail = match &record.fields {
            RecordFields::Hacking {
                protocol,
                network,
                amount,
                tx_hash,
            } => format!("{} on {}  {}  tx {}", protocol, network, amount, tx_hash),
            RecordFields::Transfer {
                token,
                amount,
                from,
                to,
            } => format!("{} {}  {} -> {}", amount, token, from, to),
        };
        println!(
            "#{:<6} {}  {}#{}",
            record.id,
            record.report_time.format("%Y-%m-%d %H:%M"),
            record.channel,
            record.message_id
        );
        println!("        {}", detail);
        println!("        tags: {}", tag_list.join(", "));
    }

    if let Some(last) = records.last() {
        println!();
        println!("next page: --before {}", last.id);
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_tags(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let tags = store.list_all_tags().await?;
    println!("{:<8} NAME", "ID");
    for tag in &tags {
        println!("{:<8} {}", tag.id, tag.name);
    }
    store.pool().close().await;
    Ok(())
}

pub async fn run_watermarks(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let watermarks = store.list_watermarks().await?;
    println!(
        "{:<10} {:<24} {:<16} UPDATED",
        "KIND", "CHANNEL", "LAST MESSAGE"
    );
    for wm in &watermarks {
        println!(
            "{:<10} {:<24} {:<16} {}",
            wm.kind,
            wm.channel,
            wm.last_message_id,
            wm.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    store.pool().close().await;
    Ok(())
}
