use std::collections::HashMap;

use bytes::Bytes;

use crate::error::DecodeError;
use crate::schema::{Check, FieldDescriptor, FieldFormat, Registry, Schema};

/// A decoded value. Closed sum over everything the schemas produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Blob(Bytes),
    Text(String),
    /// Unpacked integer sequence (offset arrays, serial-type lists).
    Ints(Vec<i64>),
    /// Results of a nested sub-record, one per sub-field.
    List(Vec<Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer as a byte count; negative counts are rejected.
    pub fn as_usize(&self) -> Option<usize> {
        self.as_int().and_then(|v| usize::try_from(v).ok())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Bytes> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<Vec<i64>> {
        match self {
            Value::Ints(vs) => Some(vs.clone()),
            Value::List(vs) => vs.iter().map(Value::as_int).collect(),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(v) => *v != 0,
            _ => true,
        }
    }

    /// Format the value for display.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => format!("<BLOB {} bytes>", b.len()),
            Value::Ints(vs) => format!("{vs:?}"),
            Value::List(vs) => format!(
                "[{}]",
                vs.iter()
                    .map(Value::to_display_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

/// Where a field landed and what it decoded to.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub offset: usize,
    pub size: usize,
    pub value: Value,
}

/// Per-pass field cache: name to `(offset, size, value)` plus the
/// synthetic cursor and the reserved delegate-argument slot.
///
/// Created for one decode pass over one buffer and discarded after.
/// Ambient entries (page type, page size) are seeded before the pass.
#[derive(Debug, Default)]
pub struct DecodeCache {
    entries: HashMap<&'static str, CacheEntry>,
    cursor: usize,
    arg: Option<Value>,
}

impl DecodeCache {
    pub fn new() -> DecodeCache {
        DecodeCache::default()
    }

    /// Seeds an ambient entry that does not correspond to buffer bytes.
    pub fn seed(&mut self, name: &'static str, value: Value) {
        self.entries.insert(
            name,
            CacheEntry {
                offset: 0,
                size: 0,
                value,
            },
        );
    }

    pub fn insert(&mut self, name: &'static str, offset: usize, size: usize, value: Value) {
        self.entries.insert(
            name,
            CacheEntry {
                offset,
                size,
                value,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&CacheEntry> {
        self.entries.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).map(|e| &e.value)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor;
    }

    pub fn set_arg(&mut self, value: Value) {
        self.arg = Some(value);
    }

    pub fn clear_arg(&mut self) {
        self.arg = None;
    }

    pub fn arg(&self) -> Option<&Value> {
        self.arg.as_ref()
    }
}

/// Knobs for a decode pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Downgrade failed field checks to warnings instead of returning
    /// `MalformedHeader`.
    pub lenient_checks: bool,
}

/// One decoded field in schema order.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
    pub value: Value,
}

/// Ordered decode results with by-name access.
#[derive(Debug, Clone, Default)]
pub struct DecodedFields {
    fields: Vec<Decoded>,
}

impl DecodedFields {
    pub fn iter(&self) -> impl Iterator<Item = &Decoded> {
        self.fields.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.value)
    }

    pub fn require(&self, name: &'static str) -> Result<&Value, DecodeError> {
        self.get(name).ok_or_else(|| DecodeError::UnpackFailed {
            offset: 0,
            detail: format!("decoded result is missing field {name}"),
        })
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    pub fn require_int(&self, name: &'static str) -> Result<i64, DecodeError> {
        self.require(name)?
            .as_int()
            .ok_or_else(|| DecodeError::UnpackFailed {
                offset: 0,
                detail: format!("field {name} is not an integer"),
            })
    }

    pub fn require_usize(&self, name: &'static str) -> Result<usize, DecodeError> {
        self.require(name)?
            .as_usize()
            .ok_or_else(|| DecodeError::UnpackFailed {
                offset: 0,
                detail: format!("field {name} is not a byte count"),
            })
    }

    pub fn into_values(self) -> Vec<Value> {
        self.fields.into_iter().map(|f| f.value).collect()
    }
}

/// Slices `n` bytes at `cur` or reports how short the buffer is.
pub(crate) fn take(buf: &[u8], cur: usize, n: usize) -> Result<&[u8], DecodeError> {
    let end = cur.checked_add(n).ok_or(DecodeError::Truncated {
        offset: cur,
        needed: n,
        available: buf.len().saturating_sub(cur),
    })?;
    buf.get(cur..end).ok_or(DecodeError::Truncated {
        offset: cur,
        needed: n,
        available: buf.len().saturating_sub(cur),
    })
}

/// Executes a compiled schema against `buf`, starting at offset 0.
///
/// Returns the total bytes consumed and the decoded fields in schema
/// order. The cache accumulates `name -> (offset, size, value)` for
/// every named field, so later fields can read earlier results.
pub fn run_schema(
    schema: &Schema,
    buf: &[u8],
    cache: &mut DecodeCache,
    registry: &Registry,
    opts: &DecodeOptions,
) -> Result<(usize, DecodedFields), DecodeError> {
    run_fields(schema.name(), schema.fields(), buf, cache, registry, opts)
}

fn run_fields(
    schema: &'static str,
    fields: &[FieldDescriptor],
    buf: &[u8],
    cache: &mut DecodeCache,
    registry: &Registry,
    opts: &DecodeOptions,
) -> Result<(usize, DecodedFields), DecodeError> {
    let mut cur = 0usize;
    let mut out = Vec::with_capacity(fields.len());

    for field in fields {
        // peel conditional and dynamic formats against the cache until
        // the field is concrete or known to be absent
        let mut format = field.format.clone();
        let format = loop {
            match format {
                FieldFormat::When(cond, inner) => match cond.eval(cache) {
                    Some(v) if v.is_truthy() => format = *inner,
                    _ => break None,
                },
                FieldFormat::Dynamic { resolve, .. } => match resolve(cache) {
                    Some(resolved) => format = resolved,
                    None => break None,
                },
                concrete => break Some(concrete),
            }
        };
        let Some(format) = format else { continue };

        let decoded = match &format {
            FieldFormat::Set(expr) => expr.eval(cache).map(|v| (0, v)),
            FieldFormat::List(sub) => {
                let slice = buf.get(cur..).unwrap_or(&[]);
                let (size, sub_fields) = run_fields(schema, sub, slice, cache, registry, opts)?;
                Some((size, Value::List(sub_fields.into_values())))
            }
            FieldFormat::RepeatUntilSize(inner, budget) => {
                match budget.eval(cache).and_then(|v| v.as_usize()) {
                    None => None,
                    Some(budget) => Some(run_repeat(
                        schema, field.name, inner, buf, cur, cur + budget, cache, registry,
                    )?),
                }
            }
            FieldFormat::RepeatUntilOffset(inner, target) => {
                match target.eval(cache).and_then(|v| v.as_usize()) {
                    None => None,
                    Some(target) => Some(run_repeat(
                        schema, field.name, inner, buf, cur, target, cache, registry,
                    )?),
                }
            }
            leaf => decode_leaf(leaf, buf, cur, cache, registry)?,
        };
        let Some((size, value)) = decoded else { continue };

        if let Some(check) = &field.check {
            apply_check(schema, field.name, cur, &value, check, opts)?;
        }

        if !field.name.is_empty() {
            cache.insert(field.name, cur, size, value.clone());
        }
        cur += size;
        cache.set_cursor(cur);
        out.push(Decoded {
            name: field.name,
            offset: cur - size,
            size,
            value,
        });
    }

    Ok((cur, DecodedFields { fields: out }))
}

/// Decodes a format that consumes bytes without further resolution.
/// `Ok(None)` means the field is absent (an absent size expression).
fn decode_leaf(
    format: &FieldFormat,
    buf: &[u8],
    cur: usize,
    cache: &mut DecodeCache,
    registry: &Registry,
) -> Result<Option<(usize, Value)>, DecodeError> {
    match format {
        FieldFormat::Prim(p) => {
            let bytes = take(buf, cur, p.size())?;
            Ok(Some((p.size(), p.decode(bytes))))
        }
        FieldFormat::Bytes(n) => {
            let bytes = take(buf, cur, *n)?;
            Ok(Some((*n, Value::Blob(Bytes::copy_from_slice(bytes)))))
        }
        FieldFormat::BytesExpr(expr) => {
            let Some(n) = expr.eval(cache).and_then(|v| v.as_usize()) else {
                return Ok(None);
            };
            let bytes = take(buf, cur, n)?;
            Ok(Some((n, Value::Blob(Bytes::copy_from_slice(bytes)))))
        }
        FieldFormat::PrimArray(p, count) => {
            let Some(count) = count.eval(cache).and_then(|v| v.as_usize()) else {
                return Ok(None);
            };
            let width = p.size();
            let bytes = take(buf, cur, count * width)?;
            let values = bytes
                .chunks_exact(width)
                .map(|chunk| match p.decode(chunk) {
                    Value::Int(v) => v,
                    _ => 0,
                })
                .collect();
            Ok(Some((count * width, Value::Ints(values))))
        }
        FieldFormat::Named(name) => {
            let decoder = lookup(registry, name, cur)?;
            decoder(buf, cur, cache).map(Some)
        }
        FieldFormat::NamedArg(name, arg) => {
            let Some(arg) = arg.eval(cache) else {
                return Ok(None);
            };
            let decoder = lookup(registry, name, cur)?;
            cache.set_arg(arg);
            let result = decoder(buf, cur, cache);
            cache.clear_arg();
            result.map(Some)
        }
        // resolution happens in the main loop; reaching here means the
        // schema put a structured format inside a repetition
        _ => Err(DecodeError::UnpackFailed {
            offset: cur,
            detail: "format cannot be decoded as a flat item".to_string(),
        }),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_repeat(
    schema: &'static str,
    field: &'static str,
    inner: &FieldFormat,
    buf: &[u8],
    start: usize,
    stop: usize,
    cache: &mut DecodeCache,
    registry: &Registry,
) -> Result<(usize, Value), DecodeError> {
    let mut cur = start;
    let mut items = Vec::new();
    while cur < stop {
        let Some((size, value)) = decode_leaf(inner, buf, cur, cache, registry)? else {
            break;
        };
        if size == 0 {
            // a zero-width item would never reach the stop condition
            return Err(DecodeError::UnpackFailed {
                offset: cur,
                detail: format!("{schema}.{field}: repetition item consumed no bytes"),
            });
        }
        items.push(value);
        cur += size;
    }
    let value = if items.iter().all(|v| matches!(v, Value::Int(_))) {
        Value::Ints(items.iter().filter_map(Value::as_int).collect())
    } else {
        Value::List(items)
    };
    Ok((cur - start, value))
}

fn lookup(
    registry: &Registry,
    name: &str,
    offset: usize,
) -> Result<crate::schema::DecodeFn, DecodeError> {
    registry.get(name).ok_or_else(|| DecodeError::UnpackFailed {
        offset,
        detail: format!("no decoder named {name}"),
    })
}

fn apply_check(
    schema: &'static str,
    field: &'static str,
    offset: usize,
    value: &Value,
    check: &Check,
    opts: &DecodeOptions,
) -> Result<(), DecodeError> {
    if check.matches(value) {
        return Ok(());
    }
    let detail = format!("{}; got {:?}", check.expectation(), value);
    if opts.lenient_checks {
        tracing::warn!(schema, field, offset, %detail, "field check failed");
        return Ok(());
    }
    Err(DecodeError::MalformedHeader {
        schema,
        field,
        offset,
        detail,
    })
}
