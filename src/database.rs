use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use crate::decode::{run_schema, DecodeCache, DecodeOptions, DecodedFields, Value};
use crate::error::DecodeError;
use crate::format::{self, Schemas};
use crate::record::Record;
use crate::schema::Registry;
use crate::DB_HEADER_SIZE;

/// The four recognized B-tree page kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    InteriorIndex,
    InteriorTable,
    LeafIndex,
    LeafTable,
}

impl PageType {
    fn from_decoded(page: u32, value: i64) -> Result<PageType, DecodeError> {
        match value {
            format::INTERIOR_INDEX_PAGE => Ok(PageType::InteriorIndex),
            format::INTERIOR_TABLE_PAGE => Ok(PageType::InteriorTable),
            format::LEAF_INDEX_PAGE => Ok(PageType::LeafIndex),
            format::LEAF_TABLE_PAGE => Ok(PageType::LeafTable),
            _ => Err(DecodeError::UnknownPageType { page, value }),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            PageType::InteriorIndex => 2,
            PageType::InteriorTable => 5,
            PageType::LeafIndex => 10,
            PageType::LeafTable => 13,
        }
    }

    pub fn is_interior(self) -> bool {
        matches!(self, PageType::InteriorIndex | PageType::InteriorTable)
    }
}

/// The decoded 100-byte file header.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub page_size: u32,
    pub write_version: u8,
    pub read_version: u8,
    pub reserved_space: u8,
    pub change_counter: u32,
    pub page_count: u32,
    pub freelist_head: u32,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_cache_size: i32,
    pub largest_root_page: u32,
    pub text_encoding: u32,
    pub user_version: i32,
    pub incremental_vacuum: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub sqlite_version: u32,
}

impl FileHeader {
    fn from_decoded(fields: &DecodedFields) -> Result<FileHeader, DecodeError> {
        Ok(FileHeader {
            page_size: fields.require_int("page_size")? as u32,
            write_version: fields.require_int("write_version")? as u8,
            read_version: fields.require_int("read_version")? as u8,
            reserved_space: fields.require_int("reserved_space")? as u8,
            change_counter: fields.require_int("change_counter")? as u32,
            page_count: fields.require_int("page_count")? as u32,
            freelist_head: fields.require_int("freelist_head")? as u32,
            freelist_count: fields.require_int("freelist_count")? as u32,
            schema_cookie: fields.require_int("schema_cookie")? as u32,
            schema_format: fields.require_int("schema_format")? as u32,
            default_cache_size: fields.require_int("default_cache_size")? as i32,
            largest_root_page: fields.require_int("largest_root_page")? as u32,
            text_encoding: fields.require_int("text_encoding")? as u32,
            user_version: fields.require_int("user_version")? as i32,
            incremental_vacuum: fields.require_int("incremental_vacuum")? as u32,
            application_id: fields.require_int("application_id")? as u32,
            version_valid_for: fields.require_int("version_valid_for")? as u32,
            sqlite_version: fields.require_int("sqlite_version")? as u32,
        })
    }
}

/// The decoded page header plus the cell offset array.
#[derive(Debug, Clone)]
pub struct PageHeader {
    pub page_type: PageType,
    pub first_freeblock: u16,
    pub cell_count: u16,
    pub cell_content_start: u16,
    pub fragmented_free_bytes: u8,
    /// Child covering keys greater than every cell key; interior pages
    /// only.
    pub right_most_page: Option<u32>,
    pub cell_offsets: Vec<u16>,
}

impl PageHeader {
    fn from_decoded(page: u32, fields: &DecodedFields) -> Result<PageHeader, DecodeError> {
        let page_type = PageType::from_decoded(page, fields.require_int("page_type")?)?;
        let cell_offsets = fields
            .require("cell_offset_array")?
            .as_ints()
            .ok_or_else(|| DecodeError::UnpackFailed {
                offset: 0,
                detail: "cell_offset_array is not an integer sequence".to_string(),
            })?
            .into_iter()
            .map(|v| v as u16)
            .collect();
        Ok(PageHeader {
            page_type,
            first_freeblock: fields.require_int("first_freeblock")? as u16,
            cell_count: fields.require_int("cell_count")? as u16,
            cell_content_start: fields.require_int("cell_content_start")? as u16,
            fragmented_free_bytes: fields.require_int("fragmented_free_bytes")? as u8,
            right_most_page: fields.get_int("right_most_page").map(|v| v as u32),
            cell_offsets,
        })
    }
}

/// One B-tree entry. Interior cells carry a child pointer and a key;
/// leaf cells carry a rowid and a payload.
#[derive(Debug, Clone)]
pub struct Cell {
    pub left_child_page: Option<u32>,
    pub payload_size: Option<u64>,
    pub local_payload_size: Option<u64>,
    pub rowid: Option<i64>,
    pub first_overflow_page: Option<u32>,
    /// Full payload; overflow content has already been spliced back in.
    pub payload: Option<Bytes>,
}

impl Cell {
    fn from_decoded(fields: &DecodedFields) -> Cell {
        Cell {
            left_child_page: fields.get_int("left_child_page").map(|v| v as u32),
            payload_size: fields.get_int("payload_size").map(|v| v as u64),
            local_payload_size: fields.get_int("local_payload_size").map(|v| v as u64),
            rowid: fields.get_int("rowid"),
            first_overflow_page: fields.get_int("first_overflow_page").map(|v| v as u32),
            payload: fields.get("payload").and_then(Value::as_blob).cloned(),
        }
    }
}

/// One fully decoded page: header, cells, and the record decoded from
/// each payload-bearing cell.
#[derive(Debug)]
pub struct Page {
    pub index: u32,
    pub header: PageHeader,
    pub cells: Vec<Cell>,
    pub payloads: Vec<Option<Record>>,
}

/// A logical table row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub rowid: i64,
    pub values: Vec<Value>,
}

/// One catalog entry of type `table`.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    /// Stored page number, 1-based as on disk.
    pub root_page: u32,
    pub sql: Option<String>,
}

// catalog rows are (type, name, tbl_name, rootpage, sql)
const CATALOG_TYPE_COLUMN: usize = 0;
const CATALOG_NAME_COLUMN: usize = 1;
const CATALOG_ROOT_COLUMN: usize = 3;
const CATALOG_SQL_COLUMN: usize = 4;

/// Read-only handle over one database file.
///
/// Pages are decoded lazily and memoized for the lifetime of the
/// handle; the byte source is treated as immutable for the session.
#[derive(Debug)]
pub struct Database<S> {
    source: S,
    header: FileHeader,
    registry: Registry,
    schemas: Schemas,
    opts: DecodeOptions,
    pages: HashMap<u32, Rc<Page>>,
}

impl Database<File> {
    pub fn open_file(path: impl AsRef<Path>) -> Result<Database<File>, DecodeError> {
        Database::open(File::open(path)?)
    }
}

impl<S: Read + Seek> Database<S> {
    /// Opens a byte source, validating the 100-byte file header.
    pub fn open(source: S) -> Result<Database<S>, DecodeError> {
        Database::open_with(source, DecodeOptions::default())
    }

    pub fn open_with(mut source: S, opts: DecodeOptions) -> Result<Database<S>, DecodeError> {
        let registry = format::registry();
        let schemas = Schemas::compile(&registry)?;

        source.seek(SeekFrom::Start(0))?;
        let header_bytes = read_exactly(&mut source, 0, DB_HEADER_SIZE)?;
        let mut cache = DecodeCache::new();
        let (_, fields) = run_schema(&schemas.file_header, &header_bytes, &mut cache, &registry, &opts)?;
        let header = FileHeader::from_decoded(&fields)?;
        tracing::debug!(
            page_size = header.page_size,
            schema_format = header.schema_format,
            "opened database"
        );

        Ok(Database {
            source,
            header,
            registry,
            schemas,
            opts,
            pages: HashMap::new(),
        })
    }

    pub fn file_header(&self) -> &FileHeader {
        &self.header
    }

    pub fn page_size(&self) -> usize {
        self.header.page_size as usize
    }

    /// Decodes the page at a zero-based index, memoized per handle.
    pub fn page(&mut self, index: u32) -> Result<Rc<Page>, DecodeError> {
        if let Some(page) = self.pages.get(&index) {
            return Ok(page.clone());
        }

        let data = self.read_page_bytes(index)?;
        // page 0 carries the file header ahead of its page header
        let header_offset = if index == 0 { DB_HEADER_SIZE } else { 0 };
        let mut cache = DecodeCache::new();
        let (_, fields) = run_schema(
            &self.schemas.page_header,
            &data[header_offset..],
            &mut cache,
            &self.registry,
            &self.opts,
        )?;
        let header = PageHeader::from_decoded(index, &fields)?;
        tracing::debug!(
            page = index,
            page_type = header.page_type.code(),
            cells = header.cell_offsets.len(),
            "decoded page header"
        );

        let mut cells = Vec::with_capacity(header.cell_offsets.len());
        for &offset in &header.cell_offsets {
            let slice = data
                .get(offset as usize..)
                .ok_or(DecodeError::Truncated {
                    offset: offset as usize,
                    needed: 1,
                    available: 0,
                })?;
            let mut cache = DecodeCache::new();
            cache.seed("page_type", Value::Int(i64::from(header.page_type.code())));
            cache.seed("page_size", Value::Int(i64::from(self.header.page_size)));
            let (_, fields) = run_schema(
                &self.schemas.cell,
                slice,
                &mut cache,
                &self.registry,
                &self.opts,
            )?;
            cells.push(Cell::from_decoded(&fields));
        }

        for cell in &mut cells {
            let (Some(total), Some(local)) = (cell.payload_size, cell.local_payload_size) else {
                continue;
            };
            if total > local {
                let first = cell.first_overflow_page.ok_or(DecodeError::OverflowChainBroken {
                    page: index,
                    expected: total as usize,
                    actual: local as usize,
                })?;
                let inline = cell.payload.take().unwrap_or_default();
                cell.payload = Some(self.assemble_overflow(inline, total as usize, first)?);
            }
        }

        let mut payloads = Vec::with_capacity(cells.len());
        for cell in &cells {
            let record = match &cell.payload {
                Some(payload) => {
                    let mut cache = DecodeCache::new();
                    let (_, fields) = run_schema(
                        &self.schemas.record,
                        payload,
                        &mut cache,
                        &self.registry,
                        &self.opts,
                    )?;
                    Some(Record::from_decoded(&fields)?)
                }
                None => None,
            };
            payloads.push(record);
        }

        let page = Rc::new(Page {
            index,
            header,
            cells,
            payloads,
        });
        self.pages.insert(index, page.clone());
        Ok(page)
    }

    /// Rows of the table B-tree rooted at a zero-based page index, in
    /// ascending rowid order.
    pub fn rows_at(&mut self, root_index: u32) -> Result<Vec<Row>, DecodeError> {
        let page = self.page(root_index)?;
        match page.header.page_type {
            PageType::LeafTable => {
                let mut rows = Vec::with_capacity(page.cells.len());
                for (cell, record) in page.cells.iter().zip(&page.payloads) {
                    let rowid = cell.rowid.ok_or_else(|| DecodeError::UnpackFailed {
                        offset: 0,
                        detail: format!("leaf cell on page {root_index} has no rowid"),
                    })?;
                    let record = record.as_ref().ok_or_else(|| DecodeError::UnpackFailed {
                        offset: 0,
                        detail: format!("leaf cell on page {root_index} has no payload"),
                    })?;
                    rows.push(Row {
                        rowid,
                        values: record.columns.clone(),
                    });
                }
                Ok(rows)
            }
            PageType::InteriorTable => {
                // children in offset-array order, then the right-most
                // pointer, keeps rowids ascending
                let mut rows = Vec::new();
                for cell in &page.cells {
                    let child = cell.left_child_page.ok_or_else(|| DecodeError::UnpackFailed {
                        offset: 0,
                        detail: format!("interior cell on page {root_index} has no child pointer"),
                    })?;
                    rows.extend(self.rows_at(page_index(child, root_index)?)?);
                }
                let right = page.header.right_most_page.ok_or_else(|| {
                    DecodeError::UnpackFailed {
                        offset: 0,
                        detail: format!("interior page {root_index} has no right-most pointer"),
                    }
                })?;
                rows.extend(self.rows_at(page_index(right, root_index)?)?);
                Ok(rows)
            }
            other => Err(DecodeError::UnknownPageType {
                page: root_index,
                value: i64::from(other.code()),
            }),
        }
    }

    /// Rows of the named table. Lookup against the catalog is exact
    /// and case-sensitive.
    pub fn rows(&mut self, table: &str) -> Result<Vec<Row>, DecodeError> {
        for row in self.rows_at(0)? {
            let name = row
                .values
                .get(CATALOG_NAME_COLUMN)
                .and_then(Value::as_text);
            if name == Some(table) {
                let root = row
                    .values
                    .get(CATALOG_ROOT_COLUMN)
                    .and_then(Value::as_int)
                    .ok_or_else(|| DecodeError::UnpackFailed {
                        offset: 0,
                        detail: format!("catalog entry for {table} has no root page"),
                    })?;
                return self.rows_at(page_index(root as u32, 0)?);
            }
        }
        Err(DecodeError::TableNotFound {
            name: table.to_string(),
        })
    }

    /// Catalog entries of type `table`.
    pub fn tables(&mut self) -> Result<Vec<TableInfo>, DecodeError> {
        let mut tables = Vec::new();
        for row in self.rows_at(0)? {
            let kind = row.values.get(CATALOG_TYPE_COLUMN).and_then(Value::as_text);
            if kind != Some("table") {
                continue;
            }
            let Some(name) = row.values.get(CATALOG_NAME_COLUMN).and_then(Value::as_text) else {
                continue;
            };
            let Some(root) = row.values.get(CATALOG_ROOT_COLUMN).and_then(Value::as_int) else {
                continue;
            };
            let sql = row
                .values
                .get(CATALOG_SQL_COLUMN)
                .and_then(Value::as_text)
                .map(str::to_string);
            tables.push(TableInfo {
                name: name.to_string(),
                root_page: root as u32,
                sql,
            });
        }
        Ok(tables)
    }

    /// Follows an overflow chain until the payload is complete.
    /// Pointers on disk are 1-based; a zero next-pointer ends the
    /// chain.
    fn assemble_overflow(
        &mut self,
        inline: Bytes,
        total: usize,
        first_page: u32,
    ) -> Result<Bytes, DecodeError> {
        let page_size = self.page_size();
        let mut out = BytesMut::with_capacity(total);
        out.extend_from_slice(&inline);

        let mut next = first_page;
        let mut visited = HashSet::new();
        while next != 0 && out.len() < total {
            let index = next - 1;
            if !visited.insert(index) {
                return Err(DecodeError::OverflowChainBroken {
                    page: index,
                    expected: total,
                    actual: out.len(),
                });
            }
            let data = self.read_page_bytes(index)?;
            let mut cache = DecodeCache::new();
            let (_, fields) = run_schema(
                &self.schemas.overflow,
                &data,
                &mut cache,
                &self.registry,
                &self.opts,
            )?;
            let content_start = fields.require_usize("content_start")?;
            let take = (total - out.len()).min(page_size - content_start);
            out.extend_from_slice(&data[content_start..content_start + take]);
            tracing::debug!(page = index, took = take, "followed overflow page");
            next = fields.require_int("next_page")? as u32;
        }

        if out.len() < total {
            return Err(DecodeError::OverflowChainBroken {
                page: first_page.saturating_sub(1),
                expected: total,
                actual: out.len(),
            });
        }
        Ok(out.freeze())
    }

    fn read_page_bytes(&mut self, index: u32) -> Result<Bytes, DecodeError> {
        let page_size = self.page_size();
        let offset = u64::from(index) * page_size as u64;
        self.source.seek(SeekFrom::Start(offset))?;
        read_exactly(&mut self.source, offset as usize, page_size)
    }
}

fn read_exactly(
    source: &mut impl Read,
    offset: usize,
    len: usize,
) -> Result<Bytes, DecodeError> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(DecodeError::Truncated {
                offset,
                needed: len,
                available: filled,
            });
        }
        filled += n;
    }
    Ok(Bytes::from(buf))
}

/// Converts a stored 1-based page pointer to a zero-based index.
fn page_index(pointer: u32, referencing_page: u32) -> Result<u32, DecodeError> {
    pointer.checked_sub(1).ok_or_else(|| DecodeError::UnpackFailed {
        offset: 0,
        detail: format!("page {referencing_page} references page number 0"),
    })
}
