use std::collections::HashMap;
use std::sync::Arc;
use test_log::test;
use tiledb_core::array::{Array, QueryType};
use tiledb_core::config::Config;
use tiledb_core::context::Context;
use tiledb_core::datatype::Datatype;
use tiledb_core::domain::{Dimension, Domain, Order};
use tiledb_core::query::{Layout, Query};
use tiledb_core::schema::{ArrayType, Attribute, Schema};
use tiledb_core::uri::Uri;
use tiledb_core::writer::CellBatch;

fn dense_2x2_schema() -> tiledb_core::Result<Schema> {
    Schema::new(
        ArrayType::Dense,
        Domain::new(vec![
            Dimension::new_integral("row", Datatype::Int32, 1, 4, 2),
            Dimension::new_integral("col", Datatype::Int32, 1, 4, 2),
        ]),
        Order::RowMajor,
        Order::RowMajor,
        0,
        vec![Attribute::new("a", Datatype::Int32, 1).fill_value((-1i32).to_le_bytes().to_vec())],
    )
}

#[test]
fn dense_full_tile_write_then_read_back() -> tiledb_core::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = Arc::new(Context::new(Config::new()));
    let uri = Uri::new(dir.path().join("dense"));
    Array::create(&ctx, &uri, &dense_2x2_schema()?)?;

    let array = Array::open(ctx.clone(), &uri, QueryType::Write)?;
    let mut query = Query::new(&array);
    query.set_layout(Layout::RowMajor)?;

    let mut coords = Vec::new();
    let mut values = Vec::new();
    for row in 1..=2 {
        for col in 1..=2 {
            coords.extend_from_slice(&[row, col]);
            values.push((row * 10 + col) as i32);
        }
    }
    let mut attrs = HashMap::new();
    attrs.insert(
        "a".to_string(),
        values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    );
    query.set_data(CellBatch { coords, attributes: attrs, ..Default::default() })?;
    query.finalize()?;
    array.close()?;

    let array = Array::open(ctx, &uri, QueryType::Read)?;
    let mut query = Query::new(&array);
    query.set_layout(Layout::RowMajor)?;
    query.set_subarray(&[(1, 2), (1, 2)])?;
    query.submit()?;

    let read_values: Vec<i32> = query
        .results
        .get("a")
        .expect("attribute a present")
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().expect("4 bytes")))
        .collect();
    assert_eq!(read_values, vec![11, 12, 21, 22]);
    Ok(())
}

#[test]
fn dense_unwritten_cells_backfill_with_fill_value() -> tiledb_core::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = Arc::new(Context::new(Config::new()));
    let uri = Uri::new(dir.path().join("dense_fill"));
    Array::create(&ctx, &uri, &dense_2x2_schema()?)?;

    // Write only the top-left tile (rows/cols 1..=2); rows/cols 3..=4 stay
    // unwritten.
    let array = Array::open(ctx.clone(), &uri, QueryType::Write)?;
    let mut query = Query::new(&array);
    query.set_layout(Layout::RowMajor)?;
    let mut attrs = HashMap::new();
    attrs.insert("a".to_string(), vec![1, 2, 3, 4].into_iter().flat_map(i32::to_le_bytes).collect());
    query.set_data(CellBatch { coords: vec![1, 1, 1, 2, 2, 1, 2, 2], attributes: attrs, ..Default::default() })?;
    query.finalize()?;
    array.close()?;

    let array = Array::open(ctx, &uri, QueryType::Read)?;
    let mut query = Query::new(&array);
    query.set_layout(Layout::RowMajor)?;
    query.set_subarray(&[(3, 3), (3, 3)])?;
    query.submit()?;

    let read_values: Vec<i32> = query
        .results
        .get("a")
        .expect("attribute a present")
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().expect("4 bytes")))
        .collect();
    assert_eq!(read_values, vec![-1]);
    Ok(())
}
