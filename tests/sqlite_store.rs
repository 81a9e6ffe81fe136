//! SQLite store properties: tag idempotence, pagination, atomicity, watermarks.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use hack_timeline::config::Config;
use hack_timeline::migrate;
use hack_timeline::models::{NewRecord, RecordFields, RecordKind};
use hack_timeline::sqlite_store::SqliteStore;
use hack_timeline::store::RecordStore;

async fn open_store() -> (TempDir, SqliteStore) {
    let dir = TempDir::new().unwrap();
    let config = Config::minimal(dir.path().join("data").join("htl.sqlite"));
    let store = SqliteStore::open(&config).await.unwrap();
    (dir, store)
}

fn hack(message_id: i64, protocol: &str) -> NewRecord {
    NewRecord {
        channel: "defimon".into(),
        message_id,
        report_time: Utc.timestamp_opt(1_700_000_000 + message_id, 0).unwrap(),
        fields: RecordFields::Hacking {
            protocol: protocol.into(),
            network: "ethereum".into(),
            amount: "1200000".into(),
            tx_hash: format!("0x{:x}", message_id),
        },
    }
}

fn tags(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

async fn link_count(store: &SqliteStore) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM hacking_record_tags")
        .fetch_one(store.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn shared_new_tag_is_created_once() {
    let (_dir, store) = open_store().await;

    store
        .insert_record(&hack(1, "Curve"), &tags(&["bridge"]))
        .await
        .unwrap();
    store
        .insert_record(&hack(2, "Sonne"), &tags(&[" Bridge ", "BRIDGE"]))
        .await
        .unwrap();

    let all = store.list_all_tags().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "bridge");
    assert_eq!(link_count(&store).await, 2);
}

#[tokio::test]
async fn record_round_trips_with_fields_and_tags() {
    let (_dir, store) = open_store().await;
    let id = store
        .insert_record(&hack(42, "Onyx Protocol"), &tags(&["onyx", "eth"]))
        .await
        .unwrap();

    let records = store
        .list_by_tags(RecordKind::Hacking, &[], 10)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.id, id);
    assert_eq!(record.kind, RecordKind::Hacking);
    assert_eq!(record.message_id, 42);
    assert_eq!(record.report_time.timestamp(), 1_700_000_042);
    assert_eq!(record.fields, hack(42, "Onyx Protocol").fields);
    let names: Vec<&str> = record.tags.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["eth", "onyx"]);
}

#[tokio::test]
async fn tag_filter_matches_any_tag_once_and_keeps_full_tag_sets() {
    let (_dir, store) = open_store().await;
    store
        .insert_record(&hack(1, "A"), &tags(&["eth", "bridge"]))
        .await
        .unwrap();
    store
        .insert_record(&hack(2, "B"), &tags(&["btc"]))
        .await
        .unwrap();
    store
        .insert_record(&hack(3, "C"), &tags(&["bridge"]))
        .await
        .unwrap();

    let records = store
        .list_by_tags(RecordKind::Hacking, &tags(&["ETH", "bridge"]), 10)
        .await
        .unwrap();
    let ids: Vec<i64> = records.iter().map(|r| r.message_id).collect();
    assert_eq!(ids, vec![3, 1]);
    assert_eq!(records[1].tags.len(), 2);

    let none = store
        .list_by_tags(RecordKind::Hacking, &tags(&["unknown"]), 10)
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn pagination_visits_every_match_once_in_descending_order() {
    let (_dir, store) = open_store().await;
    let mut expected = HashSet::new();
    for i in 1..=23 {
        let t = if i % 3 == 0 { "btc" } else { "eth" };
        let id = store
            .insert_record(&hack(i, "P"), &tags(&[t, "defi"]))
            .await
            .unwrap();
        if t == "eth" {
            expected.insert(id);
        }
    }

    let filter = tags(&["eth"]);
    let mut seen = Vec::new();
    let mut page = store
        .list_by_tags(RecordKind::Hacking, &filter, 4)
        .await
        .unwrap();
    while !page.is_empty() {
        seen.extend(page.iter().map(|r| r.id));
        let cursor = page.iter().map(|r| r.id).min().unwrap();
        page = store
            .list_by_tags_before(RecordKind::Hacking, &filter, cursor, 4)
            .await
            .unwrap();
    }

    assert!(seen.windows(2).all(|w| w[0] > w[1]));
    assert_eq!(seen.len(), expected.len());
    assert_eq!(seen.into_iter().collect::<HashSet<_>>(), expected);
}

#[tokio::test]
async fn report_time_keeps_milliseconds() {
    let (_dir, store) = open_store().await;
    let mut record = hack(3, "Sonne");
    record.report_time = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
    store.insert_record(&record, &[]).await.unwrap();

    let records = store
        .list_by_tags(RecordKind::Hacking, &[], 1)
        .await
        .unwrap();
    assert_eq!(records[0].report_time, record.report_time);
}

#[tokio::test]
async fn out_of_range_report_time_is_an_error() {
    let (_dir, store) = open_store().await;
    store.insert_record(&hack(1, "A"), &[]).await.unwrap();
    sqlx::query("UPDATE hacking_records SET report_time_ms = ?")
        .bind(i64::MAX)
        .execute(store.pool())
        .await
        .unwrap();

    let err = store
        .list_by_tags(RecordKind::Hacking, &[], 10)
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("out of range"));
}

#[tokio::test]
async fn large_pages_carry_every_tag_set() {
    let (_dir, store) = open_store().await;
    let total = 1_100;
    for i in 1..=total {
        store
            .insert_record(&hack(i, "P"), &tags(&["eth"]))
            .await
            .unwrap();
    }

    let records = store
        .list_by_tags(RecordKind::Hacking, &[], total + 10)
        .await
        .unwrap();
    assert_eq!(records.len() as i64, total);
    assert!(records
        .iter()
        .all(|r| r.tags.len() == 1 && r.tags[0].name == "eth"));
}

#[tokio::test]
async fn cursor_of_zero_means_no_bound() {
    let (_dir, store) = open_store().await;
    for i in 1..=3 {
        store.insert_record(&hack(i, "P"), &[]).await.unwrap();
    }
    let all = store
        .list_by_tags_before(RecordKind::Hacking, &[], 0, 10)
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|r| r.tags.is_empty()));
}

#[tokio::test]
async fn failed_tag_link_rolls_back_the_record() {
    let (_dir, store) = open_store().await;
    sqlx::query(
        r#"
        CREATE TRIGGER reject_poison BEFORE INSERT ON hacking_record_tags
        WHEN NEW.tag_id = (SELECT id FROM tags WHERE name = 'poison')
        BEGIN
            SELECT RAISE(ABORT, 'poisoned tag');
        END
        "#,
    )
    .execute(store.pool())
    .await
    .unwrap();

    let result = store
        .insert_record(&hack(9, "Doomed"), &tags(&["fresh", "poison"]))
        .await;
    assert!(result.is_err());

    let records = store
        .list_by_tags(RecordKind::Hacking, &[], 10)
        .await
        .unwrap();
    assert!(records.is_empty());
    assert!(store.list_all_tags().await.unwrap().is_empty());
    assert_eq!(link_count(&store).await, 0);

    store
        .insert_record(&hack(10, "Fine"), &tags(&["fresh"]))
        .await
        .unwrap();
    let records = store
        .list_by_tags(RecordKind::Hacking, &tags(&["fresh"]), 10)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message_id, 10);
}

#[tokio::test]
async fn concurrent_inserts_of_a_new_tag_do_not_fail() {
    let (_dir, store) = open_store().await;
    let store = Arc::new(store);

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .insert_record(&hack(i, "Curve"), &tags(&["curve", "crv"]))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let names: Vec<String> = store
        .list_all_tags()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["crv", "curve"]);
    assert_eq!(link_count(&store).await, 16);
}

#[tokio::test]
async fn kinds_are_stored_separately() {
    let (_dir, store) = open_store().await;
    store
        .insert_record(&hack(1, "A"), &tags(&["eth"]))
        .await
        .unwrap();
    let transfer = NewRecord {
        channel: "whales".into(),
        message_id: 1,
        report_time: Utc::now(),
        fields: RecordFields::Transfer {
            token: "ETH".into(),
            amount: "5000".into(),
            from: "0xa".into(),
            to: "0xb".into(),
        },
    };
    store
        .insert_record(&transfer, &tags(&["eth"]))
        .await
        .unwrap();

    let hacks = store
        .list_by_tags(RecordKind::Hacking, &tags(&["eth"]), 10)
        .await
        .unwrap();
    let transfers = store
        .list_by_tags(RecordKind::Transfer, &tags(&["eth"]), 10)
        .await
        .unwrap();
    assert_eq!(hacks.len(), 1);
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].fields, transfer.fields);
    assert_eq!(store.list_all_tags().await.unwrap().len(), 1);
}

#[tokio::test]
async fn watermark_rows() {
    let (_dir, store) = open_store().await;
    let kind = RecordKind::Transfer;

    assert!(store.get_watermark(kind, "whales").await.unwrap().is_none());
    assert!(store.update_watermark(kind, "whales", 5).await.is_err());

    store.insert_watermark(kind, "whales", 0).await.unwrap();
    assert!(store.insert_watermark(kind, "whales", 0).await.is_err());

    store.update_watermark(kind, "whales", 120).await.unwrap();
    store.update_watermark(kind, "whales", 80).await.unwrap();
    let wm = store.get_watermark(kind, "whales").await.unwrap().unwrap();
    assert_eq!(wm.last_message_id, 120);

    store
        .insert_watermark(RecordKind::Hacking, "defimon", 7)
        .await
        .unwrap();
    let listed: Vec<(RecordKind, String)> = store
        .list_watermarks()
        .await
        .unwrap()
        .into_iter()
        .map(|w| (w.kind, w.channel))
        .collect();
    assert_eq!(
        listed,
        vec![
            (RecordKind::Hacking, "defimon".to_string()),
            (RecordKind::Transfer, "whales".to_string()),
        ]
    );
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (_dir, store) = open_store().await;
    store.insert_record(&hack(1, "A"), &[]).await.unwrap();
    migrate::migrate(store.pool()).await.unwrap();
    migrate::migrate(store.pool()).await.unwrap();
    let records = store
        .list_by_tags(RecordKind::Hacking, &[], 10)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
}
