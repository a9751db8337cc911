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

/// A fragment directory left without its publication sentinel (simulating
/// a crash mid-write) is removed by vacuum, while committed fragments and
/// their data survive untouched.
#[test]
fn vacuum_drops_crashed_write_but_keeps_committed_data() -> tiledb_core::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = Arc::new(Context::new(Config::new()));
    let uri = Uri::new(dir.path().join("vacuum"));
    Array::create(&ctx, &uri, &sparse_schema()?)?;

    let array = Array::open(ctx.clone(), &uri, QueryType::Write)?;
    let mut writer = Writer::new(&array, Layout::Unordered);
    let mut attrs = HashMap::new();
    attrs.insert("a".to_string(), 42i32.to_le_bytes().to_vec());
    writer.write_batch(CellBatch { coords: vec![5], attributes: attrs, ..Default::default() })?;
    writer.finalize()?;
    array.close()?;

    // Simulate a crash: a fragment directory with data but no sentinel.
    let partial = uri.join("__999_999999_0");
    ctx.vfs.create_dir(&partial)?;
    ctx.vfs.create_file(&partial.join("junk"))?;

    let array = Array::open(ctx.clone(), &uri, QueryType::Read)?;
    assert_eq!(array.fragment_uris()?.len(), 1, "the partial fragment must not be listed as committed");

    let removed = Consolidator::new(&array).vacuum()?;
    assert_eq!(removed, 1);
    assert!(!ctx.vfs.is_dir(&partial)?);
    array.close()?;

    let array = Array::open(ctx, &uri, QueryType::Read)?;
    let mut query = Query::new(&array);
    query.submit()?;
    assert_eq!(query.result_coords, vec![5]);
    Ok(())
}
