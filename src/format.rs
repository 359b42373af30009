use bytes::Bytes;

use crate::decode::{DecodeCache, Value};
use crate::error::{DecodeError, SchemaError};
use crate::expr::{Deps, Expr};
use crate::record;
use crate::schema::{Check, FieldDescriptor, FieldFormat, Prim, Registry, Schema};
use crate::varint;
use crate::{DB_HEADER_SIZE, OVERFLOW_HEADER_SIZE};

/// First 16 bytes of every database file.
pub const MAGIC: &[u8; 16] = b"SQLite format 3\0";

// B-tree page types
pub const INTERIOR_INDEX_PAGE: i64 = 2;
pub const INTERIOR_TABLE_PAGE: i64 = 5;
pub const LEAF_INDEX_PAGE: i64 = 10;
pub const LEAF_TABLE_PAGE: i64 = 13;

const INTERIOR_TYPES: &[i64] = &[INTERIOR_INDEX_PAGE, INTERIOR_TABLE_PAGE];
const PAYLOAD_TYPES: &[i64] = &[INTERIOR_INDEX_PAGE, LEAF_INDEX_PAGE, LEAF_TABLE_PAGE];
const ROWID_TYPES: &[i64] = &[INTERIOR_TABLE_PAGE, LEAF_TABLE_PAGE];

/// The two delegated decoders every schema below is compiled against.
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register("varint", decode_varint);
    registry.register("variable", decode_variable);
    registry
}

fn decode_varint(
    buf: &[u8],
    cur: usize,
    _cache: &DecodeCache,
) -> Result<(usize, Value), DecodeError> {
    let (value, size) = varint::read_varint(buf, cur)?;
    Ok((size, Value::Int(value as i64)))
}

/// Serial-type-directed column decoder; the serial type arrives through
/// the cache's reserved argument slot.
fn decode_variable(
    buf: &[u8],
    cur: usize,
    cache: &DecodeCache,
) -> Result<(usize, Value), DecodeError> {
    let serial_type = cache
        .arg()
        .and_then(Value::as_int)
        .ok_or_else(|| DecodeError::UnpackFailed {
            offset: cur,
            detail: "serial type argument missing".to_string(),
        })?;
    record::read_serial(buf, cur, serial_type)
}

/// How many payload bytes stay inline in a cell before overflow
/// begins. Arguments: page type, payload size, page size. Pages that
/// carry no payload get no value.
pub fn local_payload_size(args: &[Value]) -> Option<Value> {
    let [page_type, payload_size, page_size] = args else {
        return None;
    };
    let page_type = page_type.as_int()?;
    let p = payload_size.as_int()?;
    let u = page_size.as_int()?;
    if !PAYLOAD_TYPES.contains(&page_type) {
        return None;
    }
    let x = if page_type == LEAF_TABLE_PAGE {
        u - 35
    } else {
        (u - 12) * 64 / 255 - 23
    };
    let m = (u - 12) * 32 / 255 - 23;
    let k = m + (p - m).rem_euclid(u - 4);
    let local = if p <= x {
        p
    } else if k <= x {
        k
    } else {
        m
    };
    Some(Value::Int(local))
}

/// The 100-byte file header at absolute offset 0.
/// <https://www.sqlite.org/fileformat2.html>
pub fn file_header_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::checked(
            "_magic",
            FieldFormat::Bytes(16),
            Check::Eq(Value::Blob(Bytes::from_static(MAGIC))),
        ),
        FieldDescriptor::checked(
            "page_size",
            FieldFormat::Prim(Prim::U16),
            Check::InRange { lo: 512, hi: 32768 },
        ),
        FieldDescriptor::new("write_version", FieldFormat::Prim(Prim::U8)),
        FieldDescriptor::new("read_version", FieldFormat::Prim(Prim::U8)),
        FieldDescriptor::new("reserved_space", FieldFormat::Prim(Prim::U8)),
        FieldDescriptor::checked(
            "max_payload_fraction",
            FieldFormat::Prim(Prim::U8),
            Check::Eq(Value::Int(64)),
        ),
        FieldDescriptor::checked(
            "min_payload_fraction",
            FieldFormat::Prim(Prim::U8),
            Check::Eq(Value::Int(32)),
        ),
        FieldDescriptor::checked(
            "leaf_payload_fraction",
            FieldFormat::Prim(Prim::U8),
            Check::Eq(Value::Int(32)),
        ),
        FieldDescriptor::new("change_counter", FieldFormat::Prim(Prim::U32)),
        FieldDescriptor::new("page_count", FieldFormat::Prim(Prim::U32)),
        FieldDescriptor::new("freelist_head", FieldFormat::Prim(Prim::U32)),
        FieldDescriptor::new("freelist_count", FieldFormat::Prim(Prim::U32)),
        FieldDescriptor::new("schema_cookie", FieldFormat::Prim(Prim::U32)),
        FieldDescriptor::checked(
            "schema_format",
            FieldFormat::Prim(Prim::U32),
            Check::InRange { lo: 1, hi: 4 },
        ),
        FieldDescriptor::new("default_cache_size", FieldFormat::Prim(Prim::I32)),
        FieldDescriptor::new("largest_root_page", FieldFormat::Prim(Prim::U32)),
        FieldDescriptor::checked(
            "text_encoding",
            FieldFormat::Prim(Prim::U32),
            Check::OneOf(&[1, 2, 3]),
        ),
        FieldDescriptor::new("user_version", FieldFormat::Prim(Prim::I32)),
        FieldDescriptor::new("incremental_vacuum", FieldFormat::Prim(Prim::U32)),
        FieldDescriptor::new("application_id", FieldFormat::Prim(Prim::U32)),
        FieldDescriptor::checked("_reserved", FieldFormat::Bytes(20), Check::AllZero),
        FieldDescriptor::new("version_valid_for", FieldFormat::Prim(Prim::U32)),
        FieldDescriptor::new("sqlite_version", FieldFormat::Prim(Prim::U32)),
    ]
}

/// The page header: 8 bytes on leaf pages, 12 on interior pages, then
/// the cell offset array. Sits at offset 100 within page index 0.
pub fn page_header_fields() -> Vec<FieldDescriptor> {
    vec![
        // the type byte is validated during typed extraction so an
        // unrecognized value surfaces as UnknownPageType
        FieldDescriptor::new("page_type", FieldFormat::Prim(Prim::U8)),
        FieldDescriptor::new("first_freeblock", FieldFormat::Prim(Prim::U16)),
        FieldDescriptor::new("cell_count", FieldFormat::Prim(Prim::U16)),
        FieldDescriptor::new("cell_content_start", FieldFormat::Prim(Prim::U16)),
        FieldDescriptor::new("fragmented_free_bytes", FieldFormat::Prim(Prim::U8)),
        FieldDescriptor::new(
            "right_most_page",
            FieldFormat::when(
                Expr::field("page_type").one_of(INTERIOR_TYPES),
                FieldFormat::Prim(Prim::U32),
            ),
        ),
        FieldDescriptor::new(
            "cell_offset_array",
            FieldFormat::PrimArray(Prim::U16, Expr::field("cell_count")),
        ),
    ]
}

/// One B-tree cell, decoded at its offset-array position. Ambient
/// entries: `page_type` and `page_size`.
pub fn cell_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new(
            "left_child_page",
            FieldFormat::when(
                Expr::field("page_type").one_of(INTERIOR_TYPES),
                FieldFormat::Prim(Prim::U32),
            ),
        ),
        FieldDescriptor::new(
            "payload_size",
            FieldFormat::when(
                Expr::field("page_type").one_of(PAYLOAD_TYPES),
                FieldFormat::Named("varint"),
            ),
        ),
        FieldDescriptor::new(
            "local_payload_size",
            FieldFormat::Set(Expr::apply(
                local_payload_size,
                vec![
                    Expr::field("page_type"),
                    Expr::field("payload_size"),
                    Expr::field("page_size"),
                ],
            )),
        ),
        FieldDescriptor::new(
            "rowid",
            FieldFormat::when(
                Expr::field("page_type").one_of(ROWID_TYPES),
                FieldFormat::Named("varint"),
            ),
        ),
        FieldDescriptor::new(
            "payload",
            FieldFormat::BytesExpr(Expr::field("local_payload_size")),
        ),
        // present only when part of the payload spilled to overflow
        FieldDescriptor::new(
            "first_overflow_page",
            FieldFormat::when(
                Expr::field("page_type").one_of(PAYLOAD_TYPES),
                FieldFormat::when(
                    Expr::field("payload_size")
                        .eq(Expr::field("local_payload_size"))
                        .not(),
                    FieldFormat::Prim(Prim::U32),
                ),
            ),
        ),
    ]
}

/// The 4-byte header at the start of an overflow page; content runs
/// from `content_start` to the end of the page.
pub fn overflow_header_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new("next_page", FieldFormat::Prim(Prim::U32)),
        FieldDescriptor::new("content_start", FieldFormat::Set(Expr::Cursor)),
    ]
}

/// A cell's payload blob: serial-type header then one value per type.
pub fn record_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new("header_size", FieldFormat::Named("varint")),
        FieldDescriptor::new(
            "column_types",
            FieldFormat::RepeatUntilOffset(
                Box::new(FieldFormat::Named("varint")),
                Expr::field("header_size"),
            ),
        ),
        FieldDescriptor::new(
            "column_contents",
            FieldFormat::Dynamic {
                deps: Deps::Fields(vec!["column_types"]),
                resolve: resolve_column_contents,
            },
        ),
    ]
}

// the column list is only known once the serial types are decoded, so
// the value fields are generated against the partial cache
fn resolve_column_contents(cache: &DecodeCache) -> Option<FieldFormat> {
    let types = cache.value("column_types")?.as_ints()?;
    let columns = types
        .into_iter()
        .map(|serial_type| {
            FieldDescriptor::new(
                "",
                FieldFormat::NamedArg("variable", Expr::Lit(Value::Int(serial_type))),
            )
        })
        .collect();
    Some(FieldFormat::List(columns))
}

/// All format schemas, compiled once per database handle.
#[derive(Debug)]
pub struct Schemas {
    pub file_header: Schema,
    pub page_header: Schema,
    pub cell: Schema,
    pub overflow: Schema,
    pub record: Schema,
}

impl Schemas {
    pub fn compile(registry: &Registry) -> Result<Schemas, SchemaError> {
        Ok(Schemas {
            file_header: Schema::compile_sized(
                "file_header",
                file_header_fields(),
                registry,
                &[],
                DB_HEADER_SIZE,
            )?,
            page_header: Schema::compile("page_header", page_header_fields(), registry, &[])?,
            cell: Schema::compile(
                "cell",
                cell_fields(),
                registry,
                &["page_type", "page_size"],
            )?,
            overflow: Schema::compile_sized(
                "overflow_header",
                overflow_header_fields(),
                registry,
                &[],
                OVERFLOW_HEADER_SIZE,
            )?,
            record: Schema::compile("record", record_fields(), registry, &[])?,
        })
    }
}
