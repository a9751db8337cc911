use std::collections::HashMap;
use std::sync::Arc;
use test_log::test;
use tiledb_core::array::{Array, QueryType};
use tiledb_core::config::Config;
use tiledb_core::consolidator::Consolidator;
use tiledb_core::context::Context;
use tiledb_core::datatype::Datatype;
use tiledb_core::domain::{Dimension, Domain, Order};
use tiledb_core::query::{Layout, Query};
use tiledb_core::schema::{ArrayType, Attribute, Schema};
use tiledb_core::uri::Uri;
use tiledb_core::writer::{CellBatch, Writer};

fn sparse_schema() -> tiledb_core::Result<Schema> {
    Schema::new(
        ArrayType::Sparse,
        Domain::new(vec![Dimension::new_integral("x", Datatype::Int32, 1, 1000, 10)]),
        Order::RowMajor,
        Order::RowMajor,
        4,
        vec![Attribute::new("a", Datatype::Int32, 1)],
    )
}

fn write_cell(array: &Array, coord: i64, value: i32) {
    let mut writer = Writer::new(array, Layout::Unordered);
    let mut attrs = HashMap::new();
    attrs.insert("a".to_string(), value.to_le_bytes().to_vec());
    writer
        .write_batch(CellBatch { coords: vec![coord], attributes: attrs, ..Default::default() })
        .expect("write batch");
    writer.finalize().expect("finalize fragment");
    std::thread::sleep(std::time::Duration::from_millis(2));
}

/// Consolidation must not change what a subsequent read observes (§8),
/// and running it again once everything has already been merged is a
/// no-op rather than an error.
#[test]
fn consolidation_preserves_read_results_and_is_idempotent() -> tiledb_core::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = Arc::new(Context::new(Config::new().consolidation_step(2, 10)));
    let uri = Uri::new(dir.path().join("idem"));
    Array::create(&ctx, &uri, &sparse_schema()?)?;

    let array = Array::open(ctx.clone(), &uri, QueryType::Write)?;
    write_cell(&array, 10, 100);
    write_cell(&array, 20, 200);
    write_cell(&array, 30, 300);
    write_cell(&array, 40, 400);
    array.close()?;

    let expected_coords = vec![10, 20, 30, 40];
    let expected_values = vec![100, 200, 300, 400];

    let array = Array::open(ctx.clone(), &uri, QueryType::Read)?;
    Consolidator::new(&array).consolidate()?;
    array.close()?;

    let array = Array::open(ctx.clone(), &uri, QueryType::Read)?;
    let mut query = Query::new(&array);
    query.submit()?;
    assert_eq!(query.result_coords, expected_coords);
    let values: Vec<i32> = query
        .results
        .get("a")
        .expect("attribute a present")
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().expect("4 bytes")))
        .collect();
    assert_eq!(values, expected_values);

    // Consolidating again with no further eligible window is a no-op.
    let before = array.fragment_uris()?;
    let result = Consolidator::new(&array).consolidate()?;
    assert!(result.is_none());
    assert_eq!(array.fragment_uris()?, before);
    array.close()?;

    let array = Array::open(ctx, &uri, QueryType::Read)?;
    let mut query = Query::new(&array);
    query.submit()?;
    assert_eq!(query.result_coords, expected_coords);
    Ok(())
}
