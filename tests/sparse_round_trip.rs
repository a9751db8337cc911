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

fn sparse_2d_schema() -> tiledb_core::Result<Schema> {
    Schema::new(
        ArrayType::Sparse,
        Domain::new(vec![
            Dimension::new_integral("x", Datatype::Int32, 1, 100, 10),
            Dimension::new_integral("y", Datatype::Int32, 1, 100, 10),
        ]),
        Order::RowMajor,
        Order::RowMajor,
        4,
        vec![Attribute::new("a", Datatype::Int32, 1)],
    )
}

#[test]
fn sparse_write_then_range_read_filters_and_orders() -> tiledb_core::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = Arc::new(Context::new(Config::new()));
    let uri = Uri::new(dir.path().join("sparse"));
    Array::create(&ctx, &uri, &sparse_2d_schema()?)?;

    let array = Array::open(ctx.clone(), &uri, QueryType::Write)?;
    let mut query = Query::new(&array);
    query.set_layout(Layout::Unordered)?;

    let points = [(5, 5, 1), (50, 50, 2), (90, 1, 3), (6, 4, 4)];
    let mut coords = Vec::new();
    let mut values = Vec::new();
    for &(x, y, v) in &points {
        coords.extend_from_slice(&[x, y]);
        values.push(v as i32);
    }
    let mut attrs = HashMap::new();
    attrs.insert("a".to_string(), values.iter().flat_map(|v| v.to_le_bytes()).collect());
    query.set_data(CellBatch { coords, attributes: attrs, ..Default::default() })?;
    query.finalize()?;
    array.close()?;

    let array = Array::open(ctx, &uri, QueryType::Read)?;
    let mut query = Query::new(&array);
    query.set_layout(Layout::RowMajor)?;
    query.set_subarray(&[(1, 10), (1, 10)])?;
    query.submit()?;

    assert_eq!(query.result_coords, vec![5, 5, 6, 4]);
    let values: Vec<i32> = query
        .results
        .get("a")
        .expect("attribute a present")
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().expect("4 bytes")))
        .collect();
    assert_eq!(values, vec![1, 4]);
    Ok(())
}

#[test]
fn sparse_later_fragment_shadows_earlier_one_at_same_coordinate() -> tiledb_core::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = Arc::new(Context::new(Config::new()));
    let uri = Uri::new(dir.path().join("sparse_overwrite"));
    Array::create(&ctx, &uri, &sparse_2d_schema()?)?;

    for value in [1i32, 2i32] {
        let array = Array::open(ctx.clone(), &uri, QueryType::Write)?;
        let mut query = Query::new(&array);
        query.set_layout(Layout::Unordered)?;
        let mut attrs = HashMap::new();
        attrs.insert("a".to_string(), value.to_le_bytes().to_vec());
        query.set_data(CellBatch { coords: vec![7, 7], attributes: attrs, ..Default::default() })?;
        query.finalize()?;
        array.close()?;
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    let array = Array::open(ctx, &uri, QueryType::Read)?;
    let mut query = Query::new(&array);
    query.submit()?;
    assert_eq!(query.result_coords, vec![7, 7]);
    let value = i32::from_le_bytes(
        query.results.get("a").expect("attribute a present")[..4]
            .try_into()
            .expect("4 bytes"),
    );
    assert_eq!(value, 2);
    Ok(())
}
