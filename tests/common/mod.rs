//! Builders for small synthetic database images, used to drive the
//! reader end-to-end without a SQLite binary.

use std::io::Cursor;

use litereader::{Database, DB_HEADER_SIZE};

pub const MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Minimal-length SQLite varint encoding.
pub fn varint(mut value: u64) -> Vec<u8> {
    if value >> 56 != 0 {
        let mut out = Vec::with_capacity(9);
        for i in (1..9).rev() {
            out.push(0x80 | ((value >> (8 + 7 * (i - 1))) & 0x7F) as u8);
        }
        out.push((value & 0xFF) as u8);
        return out;
    }
    let mut groups = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value != 0 {
        groups.push(0x80 | (value & 0x7F) as u8);
        value >>= 7;
    }
    groups.reverse();
    groups
}

/// A column value to encode into a record body.
#[derive(Clone)]
pub enum Col {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Col {
    pub fn text(s: &str) -> Col {
        Col::Text(s.to_string())
    }

    fn serial_type(&self) -> u64 {
        match self {
            Col::Null => 0,
            Col::Int(v) => {
                if i8::try_from(*v).is_ok() {
                    1
                } else if i16::try_from(*v).is_ok() {
                    2
                } else if i32::try_from(*v).is_ok() {
                    4
                } else {
                    6
                }
            }
            Col::Float(_) => 7,
            Col::Text(s) => 13 + 2 * s.len() as u64,
            Col::Blob(b) => 12 + 2 * b.len() as u64,
        }
    }

    fn body(&self) -> Vec<u8> {
        match self {
            Col::Null => Vec::new(),
            Col::Int(v) => match self.serial_type() {
                1 => vec![*v as u8],
                2 => (*v as i16).to_be_bytes().to_vec(),
                4 => (*v as i32).to_be_bytes().to_vec(),
                _ => v.to_be_bytes().to_vec(),
            },
            Col::Float(v) => v.to_be_bytes().to_vec(),
            Col::Text(s) => s.as_bytes().to_vec(),
            Col::Blob(b) => b.clone(),
        }
    }
}

/// Encodes a record payload: serial-type header then column bodies.
pub fn record(cols: &[Col]) -> Vec<u8> {
    let type_bytes: Vec<u8> = cols
        .iter()
        .flat_map(|c| varint(c.serial_type()))
        .collect();
    // the header size varint counts itself
    let mut header_size = type_bytes.len() as u64 + 1;
    while varint(header_size).len() as u64 + type_bytes.len() as u64 != header_size {
        header_size = varint(header_size).len() as u64 + type_bytes.len() as u64;
    }
    let mut out = varint(header_size);
    out.extend(type_bytes);
    for col in cols {
        out.extend(col.body());
    }
    out
}

/// The record layout of a catalog entry for a table.
pub fn catalog_record(name: &str, root_page_1based: u32) -> Vec<u8> {
    record(&[
        Col::text("table"),
        Col::text(name),
        Col::text(name),
        Col::Int(i64::from(root_page_1based)),
        Col::text(&format!("CREATE TABLE {name} (a, b)")),
    ])
}

fn place_cells(
    page: &mut [u8],
    header_at: usize,
    page_type: u8,
    right_most: Option<u32>,
    cells: &[Vec<u8>],
) {
    page[header_at] = page_type;
    page[header_at + 3..header_at + 5].copy_from_slice(&(cells.len() as u16).to_be_bytes());
    let mut offset_array = header_at + 8;
    if let Some(right) = right_most {
        page[header_at + 8..header_at + 12].copy_from_slice(&right.to_be_bytes());
        offset_array = header_at + 12;
    }
    let mut content_end = page.len();
    for (i, cell) in cells.iter().enumerate() {
        content_end -= cell.len();
        page[content_end..content_end + cell.len()].copy_from_slice(cell);
        page[offset_array + 2 * i..offset_array + 2 * i + 2]
            .copy_from_slice(&(content_end as u16).to_be_bytes());
    }
    page[header_at + 5..header_at + 7].copy_from_slice(&(content_end as u16).to_be_bytes());
}

/// A leaf table page whose payloads all fit inline.
pub fn leaf_table_page(
    page_size: usize,
    header_at: usize,
    rows: &[(i64, Vec<u8>)],
) -> Vec<u8> {
    let mut page = vec![0u8; page_size];
    let cells: Vec<Vec<u8>> = rows
        .iter()
        .map(|(rowid, payload)| {
            let mut cell = varint(payload.len() as u64);
            cell.extend(varint(*rowid as u64));
            cell.extend(payload);
            cell
        })
        .collect();
    place_cells(&mut page, header_at, 13, None, &cells);
    page
}

/// A leaf table page with a single cell whose payload spills to an
/// overflow chain. `local` must match the reader's inline formula.
pub fn leaf_table_page_with_overflow(
    page_size: usize,
    rowid: i64,
    payload: &[u8],
    local: usize,
    first_overflow_1based: u32,
) -> Vec<u8> {
    let mut page = vec![0u8; page_size];
    let mut cell = varint(payload.len() as u64);
    cell.extend(varint(rowid as u64));
    cell.extend(&payload[..local]);
    cell.extend(first_overflow_1based.to_be_bytes());
    place_cells(&mut page, 0, 13, None, &[cell]);
    page
}

/// An interior table page: `(child page number, key)` cells plus the
/// right-most pointer, all 1-based as on disk.
pub fn interior_table_page(
    page_size: usize,
    header_at: usize,
    children: &[(u32, i64)],
    right_most_1based: u32,
) -> Vec<u8> {
    let mut page = vec![0u8; page_size];
    let cells: Vec<Vec<u8>> = children
        .iter()
        .map(|(child, key)| {
            let mut cell = child.to_be_bytes().to_vec();
            cell.extend(varint(*key as u64));
            cell
        })
        .collect();
    place_cells(&mut page, header_at, 5, Some(right_most_1based), &cells);
    page
}

/// An overflow page: next pointer then content from offset 4.
pub fn overflow_page(page_size: usize, next_1based: u32, content: &[u8]) -> Vec<u8> {
    let mut page = vec![0u8; page_size];
    page[0..4].copy_from_slice(&next_1based.to_be_bytes());
    page[4..4 + content.len()].copy_from_slice(content);
    page
}

/// Assembles a file image: the header is spliced into page 0, whose
/// page header must therefore start at offset 100.
pub fn file_image(page_size: usize, pages: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::with_capacity(page_size * pages.len());
    for page in &pages {
        assert_eq!(page.len(), page_size);
        out.extend_from_slice(page);
    }
    let header = file_header(page_size as u16, pages.len() as u32);
    out[..DB_HEADER_SIZE].copy_from_slice(&header);
    out
}

pub fn file_header(page_size: u16, page_count: u32) -> [u8; 100] {
    let mut header = [0u8; 100];
    header[0..16].copy_from_slice(MAGIC);
    header[16..18].copy_from_slice(&page_size.to_be_bytes());
    header[18] = 1; // write version
    header[19] = 1; // read version
    header[21] = 64;
    header[22] = 32;
    header[23] = 32;
    header[24..28].copy_from_slice(&1u32.to_be_bytes()); // change counter
    header[28..32].copy_from_slice(&page_count.to_be_bytes());
    header[44..48].copy_from_slice(&1u32.to_be_bytes()); // schema format
    header[56..60].copy_from_slice(&1u32.to_be_bytes()); // text encoding
    header[92..96].copy_from_slice(&1u32.to_be_bytes()); // version valid for
    header[96..100].copy_from_slice(&3_045_001u32.to_be_bytes());
    header
}

pub fn open(image: Vec<u8>) -> Database<Cursor<Vec<u8>>> {
    Database::open(Cursor::new(image)).expect("image should open")
}
