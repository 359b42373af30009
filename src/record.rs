use bytes::Bytes;

use crate::decode::{take, DecodedFields, Value};
use crate::error::DecodeError;

/// Decodes one column value directed by its serial type.
/// Returns `(bytes_consumed, value)`.
pub fn read_serial(data: &[u8], offset: usize, serial_type: i64) -> Result<(usize, Value), DecodeError> {
    match serial_type {
        0 => Ok((0, Value::Null)),
        1 => read_int(data, offset, 1), // 8-bit twos-complement
        2 => read_int(data, offset, 2), // 16-bit twos-complement
        3 => read_int(data, offset, 3), // 24-bit twos-complement
        4 => read_int(data, offset, 4), // 32-bit twos-complement
        5 => read_int(data, offset, 6), // 48-bit twos-complement
        6 => read_int(data, offset, 8), // 64-bit twos-complement
        7 => {
            let bytes = take(data, offset, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            Ok((8, Value::Float(f64::from_be_bytes(raw))))
        }
        // integer constants stored entirely in the type
        8 => Ok((0, Value::Int(0))),
        9 => Ok((0, Value::Int(1))),
        10 | 11 => Err(DecodeError::UnpackFailed {
            offset,
            detail: format!("reserved serial type {serial_type}"),
        }),
        n if n >= 12 && n % 2 == 0 => {
            let len = ((n - 12) / 2) as usize;
            let bytes = take(data, offset, len)?;
            Ok((len, Value::Blob(Bytes::copy_from_slice(bytes))))
        }
        n if n >= 13 => {
            let len = ((n - 13) / 2) as usize;
            let bytes = take(data, offset, len)?;
            let text = String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::UnpackFailed {
                offset,
                detail: "text value is not valid UTF-8".to_string(),
            })?;
            Ok((len, Value::Text(text)))
        }
        _ => Err(DecodeError::UnpackFailed {
            offset,
            detail: format!("invalid serial type {serial_type}"),
        }),
    }
}

fn read_int(data: &[u8], offset: usize, size: usize) -> Result<(usize, Value), DecodeError> {
    let bytes = take(data, offset, size)?;
    let mut padded = [0u8; 8];
    padded[8 - size..].copy_from_slice(bytes);
    // sign-extend from the top bit of the stored width
    if bytes[0] & 0x80 != 0 {
        for pad in padded.iter_mut().take(8 - size) {
            *pad = 0xFF;
        }
    }
    Ok((size, Value::Int(i64::from_be_bytes(padded))))
}

/// The decoded form of a leaf payload: the serial-type header plus one
/// value per column.
#[derive(Debug, Clone)]
pub struct Record {
    pub header_size: u64,
    pub serial_types: Vec<i64>,
    pub columns: Vec<Value>,
}

impl Record {
    /// Pulls the typed record out of a record-schema decode pass.
    pub fn from_decoded(fields: &DecodedFields) -> Result<Record, DecodeError> {
        let header_size = fields.require_int("header_size")? as u64;
        let serial_types = fields
            .require("column_types")?
            .as_ints()
            .ok_or_else(|| DecodeError::UnpackFailed {
                offset: 0,
                detail: "column_types is not an integer sequence".to_string(),
            })?;
        let columns = match fields.require("column_contents")? {
            Value::List(values) => values.clone(),
            other => {
                return Err(DecodeError::UnpackFailed {
                    offset: 0,
                    detail: format!("column_contents is not a list: {other:?}"),
                })
            }
        };
        Ok(Record {
            header_size,
            serial_types,
            columns,
        })
    }
}
