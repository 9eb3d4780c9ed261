use std::path::{Path, PathBuf};

use auction_adapters::{classify_shape, parse_page, Flattener, NestedPrefix, PageShape};
use auction_core::{CellValue, TableSchema};
use chrono::{TimeZone, Utc};
use serde_json::Value as JsonValue;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture(rel: &str) -> PathBuf {
    workspace_root().join("fixtures").join(rel)
}

fn read_json(rel: &str) -> JsonValue {
    let text = std::fs::read_to_string(fixture(rel)).expect("read fixture");
    serde_json::from_str(&text).expect("parse fixture")
}

fn flattener() -> Flattener {
    let schema = TableSchema::load(fixture("schema/sale_format.json")).expect("schema");
    Flattener::new(schema).with_ingested_at(Utc.with_ymd_and_hms(2025, 10, 26, 0, 0, 0).unwrap())
}

#[test]
fn search_page_matches_snapshot() {
    let flattener = flattener();
    let page = read_json("pages/search_page1.json");
    let outcome = flattener.flatten_page(&page);
    assert_eq!(outcome.coercion_failures, 1, "odometer 'unknown' is nulled");

    let actual: Vec<JsonValue> = outcome
        .records
        .iter()
        .map(|r| JsonValue::Object(r.to_json_object(flattener.schema())))
        .collect();
    let expected = read_json("pages/search_page1.snapshot.json");
    assert_eq!(JsonValue::Array(actual), expected);
}

#[test]
fn sale_lots_page_agrees_with_search_page_on_every_column() {
    let flattener = flattener();
    let lots_page = read_json("pages/sale_lots_page.json");
    assert!(matches!(classify_shape(&lots_page), PageShape::SaleLots { .. }));

    let outcome = flattener.flatten_page(&lots_page);
    assert_eq!(outcome.skipped_items, 1);
    assert_eq!(outcome.records.len(), 1);

    let search = flattener.flatten(&read_json("pages/search_page1.json"));
    let schema = flattener.schema();
    for (idx, column) in schema.columns().iter().enumerate() {
        let a = outcome.records[0].value_at(idx);
        let b = search[0].value_at(idx);
        assert_eq!(a, b, "column {} differs", column.name);
    }
    assert_eq!(
        search[0].get(schema, "businessUnitName"),
        Some(&CellValue::Text("Pickles Adelaide".into()))
    );
}

#[test]
fn tracking_response_flattens_into_prefixed_columns() {
    let schema = TableSchema::load(fixture("schema/vehicle_tracking.json")).expect("schema");
    let flattener = Flattener::new(schema.clone()).with_nested(vec![
        NestedPrefix::new("data.item", "item_"),
        NestedPrefix::new("data.bidding", "bidding_"),
        NestedPrefix::new("data.sale", "sale_"),
        NestedPrefix::new("data", ""),
    ]);
    let response = read_json("tracking/vehicle_60712345.json");
    assert!(matches!(classify_shape(&response), PageShape::SingleItem(_)));

    let outcome = flattener.flatten_page(&response);
    assert_eq!(outcome.coercion_failures, 0);
    assert_eq!(outcome.records.len(), 1);
    let record = &outcome.records[0];
    let end = Utc.timestamp_millis_opt(1761186600000).unwrap();
    assert_eq!(record.get(&schema, "item_itemId"), Some(&CellValue::Integer(60712345)));
    assert_eq!(record.get(&schema, "item_itemBidEndTimestamp"), Some(&CellValue::Timestamp(end)));
    assert_eq!(record.get(&schema, "sale_saleEndTimestamp"), Some(&CellValue::Timestamp(end)));
    assert_eq!(record.get(&schema, "item_isClosed"), Some(&CellValue::Boolean(false)));
    assert_eq!(record.get(&schema, "bidding_currentBid"), Some(&CellValue::Decimal(31250.0)));
    assert_eq!(
        record.get(&schema, "bidding_userItemBidStatus"),
        Some(&CellValue::Json(serde_json::json!({"isWinning": false, "hasBid": false})))
    );
    assert_eq!(
        record.get(&schema, "currentServerTime"),
        Some(&CellValue::Timestamp(Utc.with_ymd_and_hms(2025, 10, 22, 10, 0, 0).unwrap()))
    );
}

#[test]
fn stored_pages_parse_with_their_reported_totals() {
    for (rel, total, items) in [
        ("pages/search_page1.json", 3, 2),
        ("pages/search_page2.json", 3, 1),
        ("pages/sale_lots_page.json", 2, 2),
    ] {
        let bytes = std::fs::read(fixture(rel)).expect("read");
        let page = parse_page("national-online-11924", 1, &bytes).expect("parse");
        assert_eq!(page.reported_total, total, "{rel}");
        assert_eq!(page.item_count(), items, "{rel}");
    }
}
