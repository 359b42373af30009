mod common;

use std::io::Cursor;

use bytes::Bytes;
use litereader::{Database, DecodeError, DecodeOptions, PageType, Value};

use common::{
    catalog_record, file_image, interior_table_page, leaf_table_page,
    leaf_table_page_with_overflow, open, overflow_page, record, Col,
};

const PAGE_SIZE: usize = 4096;

#[test]
fn three_rows_come_back_in_rowid_order() {
    let rows = vec![
        (1, record(&[Col::text("2006-01-05"), Col::text("BUY"), Col::Int(100)])),
        (2, record(&[Col::text("2006-01-06"), Col::text("SELL"), Col::Int(250)])),
        (3, record(&[Col::text("2006-01-07"), Col::text("BUY"), Col::Int(75)])),
    ];
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("stocks", 2))]),
            leaf_table_page(PAGE_SIZE, 0, &rows),
        ],
    );
    let mut db = open(image);

    let rows = db.rows("stocks").unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows.iter().map(|r| r.rowid).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(
        rows[0].values,
        vec![
            Value::Text("2006-01-05".to_string()),
            Value::Text("BUY".to_string()),
            Value::Int(100),
        ]
    );
    assert_eq!(rows[1].values[1], Value::Text("SELL".to_string()));
}

#[test]
fn reading_the_same_table_twice_is_identical() {
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("t", 2))]),
            leaf_table_page(
                PAGE_SIZE,
                0,
                &[(1, record(&[Col::Int(7), Col::text("x")]))],
            ),
        ],
    );
    let mut db = open(image.clone());
    let first = db.rows("t").unwrap();
    let second = db.rows("t").unwrap();
    assert_eq!(first, second);

    // a fresh handle over the same bytes agrees as well
    let mut db2 = open(image);
    assert_eq!(db2.rows("t").unwrap(), first);
}

#[test]
fn interior_pages_are_walked_in_key_order() {
    let leaf_a = leaf_table_page(
        PAGE_SIZE,
        0,
        &[
            (1, record(&[Col::Int(10)])),
            (2, record(&[Col::Int(20)])),
        ],
    );
    let leaf_b = leaf_table_page(
        PAGE_SIZE,
        0,
        &[
            (3, record(&[Col::Int(30)])),
            (4, record(&[Col::Int(40)])),
        ],
    );
    let leaf_c = leaf_table_page(PAGE_SIZE, 0, &[(5, record(&[Col::Int(50)]))]);
    // root at page 2 (1-based): children 3 and 4, right-most 5
    let root = interior_table_page(PAGE_SIZE, 0, &[(3, 2), (4, 4)], 5);
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("nums", 2))]),
            root,
            leaf_a,
            leaf_b,
            leaf_c,
        ],
    );
    let mut db = open(image);

    let rows = db.rows("nums").unwrap();
    let rowids: Vec<i64> = rows.iter().map(|r| r.rowid).collect();
    assert_eq!(rowids, vec![1, 2, 3, 4, 5]);
    // strictly ascending, no duplicates, nothing dropped
    assert!(rowids.windows(2).all(|w| w[0] < w[1]));
    let values: Vec<i64> = rows
        .iter()
        .map(|r| r.values[0].as_int().unwrap())
        .collect();
    assert_eq!(values, vec![10, 20, 30, 40, 50]);
}

#[test]
fn overflowing_payloads_are_reassembled_in_chain_order() {
    // a 12274-byte record keeps 489 bytes inline on a 4096-byte page
    // and spills {4092, 4092, 3601} across three overflow pages
    let blob: Vec<u8> = (0..12270u32).map(|i| (i % 251) as u8).collect();
    let payload = record(&[Col::Blob(blob.clone())]);
    assert_eq!(payload.len(), 12274);
    let local = 489;

    let leaf = leaf_table_page_with_overflow(PAGE_SIZE, 1, &payload, local, 3);
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("big", 2))]),
            leaf,
            overflow_page(PAGE_SIZE, 4, &payload[local..local + 4092]),
            overflow_page(PAGE_SIZE, 5, &payload[local + 4092..local + 8184]),
            overflow_page(PAGE_SIZE, 0, &payload[local + 8184..]),
        ],
    );
    let mut db = open(image);

    let rows = db.rows("big").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values, vec![Value::Blob(Bytes::from(blob))]);
}

#[test]
fn short_overflow_chains_are_an_error() {
    let blob: Vec<u8> = vec![0x42; 12270];
    let payload = record(&[Col::Blob(blob)]);
    let local = 489;

    let leaf = leaf_table_page_with_overflow(PAGE_SIZE, 1, &payload, local, 3);
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("big", 2))]),
            leaf,
            overflow_page(PAGE_SIZE, 4, &payload[local..local + 4092]),
            // next pointer 0 ends the chain 3600 bytes early
            overflow_page(PAGE_SIZE, 0, &payload[local + 4092..local + 8184]),
        ],
    );
    let mut db = open(image);

    let err = db.rows("big").unwrap_err();
    assert!(matches!(
        err,
        DecodeError::OverflowChainBroken {
            expected: 12274,
            actual: 8673,
            ..
        }
    ));
}

#[test]
fn cyclic_overflow_chains_are_an_error() {
    let blob: Vec<u8> = vec![0x42; 12270];
    let payload = record(&[Col::Blob(blob)]);
    let local = 489;

    let leaf = leaf_table_page_with_overflow(PAGE_SIZE, 1, &payload, local, 3);
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("big", 2))]),
            leaf,
            overflow_page(PAGE_SIZE, 4, &payload[local..local + 4092]),
            // points back to the previous overflow page
            overflow_page(PAGE_SIZE, 3, &payload[local + 4092..local + 8184]),
        ],
    );
    let mut db = open(image);

    let err = db.rows("big").unwrap_err();
    assert!(matches!(err, DecodeError::OverflowChainBroken { .. }));
}

#[test]
fn table_lookup_is_exact_and_case_sensitive() {
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("stocks", 2))]),
            leaf_table_page(PAGE_SIZE, 0, &[(1, record(&[Col::Int(1)]))]),
        ],
    );
    let mut db = open(image);

    assert!(db.rows("stocks").is_ok());
    for missing in ["Stocks", "stock", "stocks ", "bonds"] {
        let err = db.rows(missing).unwrap_err();
        assert!(
            matches!(err, DecodeError::TableNotFound { ref name } if name == missing),
            "lookup of {missing:?} should fail"
        );
    }
}

#[test]
fn an_empty_table_is_not_an_error() {
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("empty", 2))]),
            leaf_table_page(PAGE_SIZE, 0, &[]),
        ],
    );
    let mut db = open(image);
    assert_eq!(db.rows("empty").unwrap(), vec![]);
}

#[test]
fn every_serial_type_shape_decodes() {
    let row = record(&[
        Col::Null,
        Col::Int(-1),
        Col::Int(70_000),
        Col::Int(i64::MIN),
        Col::Float(3.5),
        Col::text(""),
        Col::Blob(vec![1, 2, 3]),
    ]);
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("misc", 2))]),
            leaf_table_page(PAGE_SIZE, 0, &[(1, row)]),
        ],
    );
    let mut db = open(image);

    let rows = db.rows("misc").unwrap();
    assert_eq!(
        rows[0].values,
        vec![
            Value::Null,
            Value::Int(-1),
            Value::Int(70_000),
            Value::Int(i64::MIN),
            Value::Float(3.5),
            Value::Text(String::new()),
            Value::Blob(Bytes::from_static(&[1, 2, 3])),
        ]
    );
}

#[test]
fn tables_lists_catalog_entries() {
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(
                PAGE_SIZE,
                100,
                &[
                    (1, catalog_record("stocks", 2)),
                    (2, catalog_record("bonds", 3)),
                ],
            ),
            leaf_table_page(PAGE_SIZE, 0, &[]),
            leaf_table_page(PAGE_SIZE, 0, &[]),
        ],
    );
    let mut db = open(image);

    let tables = db.tables().unwrap();
    let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["stocks", "bonds"]);
    assert_eq!(tables[0].root_page, 2);
    assert!(tables[0].sql.as_deref().unwrap().starts_with("CREATE TABLE"));
}

#[test]
fn diagnostics_expose_page_structure() {
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("t", 2))]),
            leaf_table_page(PAGE_SIZE, 0, &[(1, record(&[Col::Int(5)]))]),
        ],
    );
    let mut db = open(image);

    let page = db.page(1).unwrap();
    assert_eq!(page.header.page_type, PageType::LeafTable);
    assert_eq!(page.header.cell_count, 1);
    assert_eq!(page.cells.len(), 1);
    assert_eq!(page.cells[0].rowid, Some(1));
    let record = page.payloads[0].as_ref().unwrap();
    assert_eq!(record.columns, vec![Value::Int(5)]);
}

#[test]
fn unrecognized_page_types_fail_traversal() {
    let mut bogus = vec![0u8; PAGE_SIZE];
    bogus[0] = 10; // leaf index page, which table traversal rejects
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("t", 2))]),
            bogus,
        ],
    );
    let mut db = open(image);
    let err = db.rows("t").unwrap_err();
    assert!(matches!(
        err,
        DecodeError::UnknownPageType { page: 1, value: 10 }
    ));

    let mut bogus = vec![0u8; PAGE_SIZE];
    bogus[0] = 7; // not a recognized type byte at all
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("t", 2))]),
            bogus,
        ],
    );
    let mut db = open(image);
    let err = db.rows("t").unwrap_err();
    assert!(matches!(
        err,
        DecodeError::UnknownPageType { page: 1, value: 7 }
    ));
}

#[test]
fn header_validation_rejects_corrupt_files() {
    let good = file_image(
        PAGE_SIZE,
        vec![leaf_table_page(PAGE_SIZE, 100, &[])],
    );

    let mut bad_magic = good.clone();
    bad_magic[0] = b'X';
    let err = Database::open(Cursor::new(bad_magic)).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::MalformedHeader { field: "_magic", .. }
    ));

    let mut bad_page_size = good.clone();
    bad_page_size[16..18].copy_from_slice(&256u16.to_be_bytes());
    let err = Database::open(Cursor::new(bad_page_size)).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::MalformedHeader {
            field: "page_size",
            ..
        }
    ));

    let mut bad_schema_format = good.clone();
    bad_schema_format[44..48].copy_from_slice(&9u32.to_be_bytes());
    let err = Database::open(Cursor::new(bad_schema_format)).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::MalformedHeader {
            field: "schema_format",
            ..
        }
    ));

    let mut dirty_reserved = good.clone();
    dirty_reserved[80] = 1;
    let err = Database::open(Cursor::new(dirty_reserved.clone())).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::MalformedHeader {
            field: "_reserved",
            ..
        }
    ));

    // the same file opens when the caller opts into lenient checks
    let opts = DecodeOptions {
        lenient_checks: true,
    };
    assert!(Database::open_with(Cursor::new(dirty_reserved), opts).is_ok());
}

#[test]
fn truncated_files_are_reported_as_truncated() {
    let image = file_image(
        PAGE_SIZE,
        vec![
            leaf_table_page(PAGE_SIZE, 100, &[(1, catalog_record("t", 2))]),
            leaf_table_page(PAGE_SIZE, 0, &[(1, record(&[Col::Int(5)]))]),
        ],
    );

    // cut the file off in the middle of the table's root page
    let mut db = open(image[..PAGE_SIZE + 100].to_vec());
    let err = db.rows("t").unwrap_err();
    assert!(matches!(err, DecodeError::Truncated { .. }));

    // too short for even the file header
    let err = Database::open(Cursor::new(vec![0u8; 40])).unwrap_err();
    assert!(matches!(err, DecodeError::Truncated { .. }));
}
