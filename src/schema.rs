use std::collections::{HashMap, HashSet};

use crate::decode::{DecodeCache, Value};
use crate::error::{DecodeError, SchemaError};
use crate::expr::{Deps, Expr};

/// A delegated decoder: `(buffer, offset, cache)` to `(consumed, value)`.
pub type DecodeFn = fn(&[u8], usize, &DecodeCache) -> Result<(usize, Value), DecodeError>;

/// Resolves a format against the partially decoded cache; `None` means
/// the field is absent for this input.
pub type ResolveFn = fn(&DecodeCache) -> Option<FieldFormat>;

/// Lookup table from format names to delegated decoder functions.
///
/// Built once at startup and shared read-only by the compiler and the
/// decode loop.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<&'static str, DecodeFn>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register(&mut self, name: &'static str, decoder: DecodeFn) {
        self.entries.insert(name, decoder);
    }

    pub fn get(&self, name: &str) -> Option<DecodeFn> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// Fixed-width big-endian primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prim {
    U8,
    I8,
    U16,
    U32,
    I32,
}

impl Prim {
    pub fn size(self) -> usize {
        match self {
            Prim::U8 | Prim::I8 => 1,
            Prim::U16 => 2,
            Prim::U32 | Prim::I32 => 4,
        }
    }

    /// Decodes from a slice of exactly `self.size()` bytes.
    pub fn decode(self, bytes: &[u8]) -> Value {
        let v = match self {
            Prim::U8 => i64::from(bytes[0]),
            Prim::I8 => i64::from(bytes[0] as i8),
            Prim::U16 => i64::from(u16::from_be_bytes([bytes[0], bytes[1]])),
            Prim::U32 => i64::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            Prim::I32 => i64::from(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        };
        Value::Int(v)
    }
}

/// How a field's bytes are decoded.
///
/// This is a closed set of decode strategies; anything that depends on
/// earlier fields is expressed through an explicit variant (`When`,
/// `Dynamic`, `Set`, the repetitions) rather than a late-bound format
/// value.
#[derive(Debug, Clone)]
pub enum FieldFormat {
    /// Fixed-width packed primitive.
    Prim(Prim),
    /// Fixed-width raw byte run.
    Bytes(usize),
    /// Raw byte run whose length comes from the cache; an absent
    /// length makes the field absent.
    BytesExpr(Expr),
    /// Repeated primitive, count from the cache, kept as a sequence.
    PrimArray(Prim, Expr),
    /// Delegated decoder from the registry.
    Named(&'static str),
    /// Delegated decoder with an argument threaded through the cache's
    /// reserved slot for the duration of the call.
    NamedArg(&'static str, Expr),
    /// Nested sub-record, one decoded value per sub-field.
    List(Vec<FieldDescriptor>),
    /// Present only when the condition holds.
    When(Expr, Box<FieldFormat>),
    /// Format resolved at decode time from earlier fields.
    Dynamic { deps: Deps, resolve: ResolveFn },
    /// Repeat the sub-format until the byte budget is consumed.
    RepeatUntilSize(Box<FieldFormat>, Expr),
    /// Repeat the sub-format until the cursor reaches an absolute
    /// offset within the current buffer.
    RepeatUntilOffset(Box<FieldFormat>, Expr),
    /// Zero-byte synthesized value; an absent expression synthesizes
    /// nothing.
    Set(Expr),
}

impl FieldFormat {
    pub fn when(cond: Expr, then: FieldFormat) -> FieldFormat {
        FieldFormat::When(cond, Box::new(then))
    }

    /// Cache entries this format reads before any bytes are consumed.
    pub fn deps(&self) -> Deps {
        match self {
            FieldFormat::Prim(_) | FieldFormat::Bytes(_) | FieldFormat::Named(_) => Deps::none(),
            FieldFormat::BytesExpr(e) | FieldFormat::NamedArg(_, e) | FieldFormat::Set(e) => {
                e.deps()
            }
            FieldFormat::PrimArray(_, e) => e.deps(),
            FieldFormat::List(fields) => fields
                .iter()
                .fold(Deps::none(), |acc, f| acc.union(f.format.deps())),
            FieldFormat::When(cond, inner) => cond.deps().union(inner.deps()),
            FieldFormat::Dynamic { deps, .. } => deps.clone(),
            FieldFormat::RepeatUntilSize(inner, e) | FieldFormat::RepeatUntilOffset(inner, e) => {
                inner.deps().union(e.deps())
            }
        }
    }
}

/// Validation attached to a decoded value.
#[derive(Debug, Clone)]
pub enum Check {
    Eq(Value),
    OneOf(&'static [i64]),
    InRange { lo: i64, hi: i64 },
    AllZero,
}

impl Check {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Check::Eq(expected) => value == expected,
            Check::OneOf(set) => value.as_int().is_some_and(|v| set.contains(&v)),
            Check::InRange { lo, hi } => value.as_int().is_some_and(|v| (*lo..=*hi).contains(&v)),
            Check::AllZero => match value {
                Value::Blob(bytes) => bytes.iter().all(|b| *b == 0),
                Value::Ints(vs) => vs.iter().all(|v| *v == 0),
                Value::Int(v) => *v == 0,
                _ => false,
            },
        }
    }

    pub fn expectation(&self) -> String {
        match self {
            Check::Eq(expected) => format!("expected {expected:?}"),
            Check::OneOf(set) => format!("expected one of {set:?}"),
            Check::InRange { lo, hi } => format!("expected value in [{lo}, {hi}]"),
            Check::AllZero => "expected all-zero bytes".to_string(),
        }
    }
}

/// One named field of a schema. Immutable once compiled.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub format: FieldFormat,
    pub check: Option<Check>,
}

impl FieldDescriptor {
    pub fn new(name: &'static str, format: FieldFormat) -> FieldDescriptor {
        FieldDescriptor {
            name,
            format,
            check: None,
        }
    }

    pub fn checked(name: &'static str, format: FieldFormat, check: Check) -> FieldDescriptor {
        FieldDescriptor {
            name,
            format,
            check: Some(check),
        }
    }

    fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }
}

/// Byte width of a field or schema, as far as it can be known before
/// decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeEstimate {
    /// Statically known byte count.
    Fixed(usize),
    /// Known only from the named fields at decode time.
    Depends(Deps),
    /// Unknowable ahead of a delegated decode.
    Open,
}

impl SizeEstimate {
    fn add(self, other: SizeEstimate) -> SizeEstimate {
        match (self, other) {
            (SizeEstimate::Open, _) | (_, SizeEstimate::Open) => SizeEstimate::Open,
            (SizeEstimate::Fixed(a), SizeEstimate::Fixed(b)) => SizeEstimate::Fixed(a + b),
            (SizeEstimate::Fixed(_), SizeEstimate::Depends(d))
            | (SizeEstimate::Depends(d), SizeEstimate::Fixed(_)) => SizeEstimate::Depends(d),
            (SizeEstimate::Depends(a), SizeEstimate::Depends(b)) => {
                SizeEstimate::Depends(a.union(b))
            }
        }
    }
}

/// Estimates a single format's width and the fields it depends on.
pub fn estimate(format: &FieldFormat) -> SizeEstimate {
    match format {
        FieldFormat::Prim(p) => SizeEstimate::Fixed(p.size()),
        FieldFormat::Bytes(n) => SizeEstimate::Fixed(*n),
        FieldFormat::Set(_) => SizeEstimate::Fixed(0),
        FieldFormat::BytesExpr(e)
        | FieldFormat::PrimArray(_, e)
        | FieldFormat::RepeatUntilSize(_, e)
        | FieldFormat::RepeatUntilOffset(_, e) => SizeEstimate::Depends(e.deps()),
        FieldFormat::Named(_) | FieldFormat::NamedArg(..) => SizeEstimate::Open,
        FieldFormat::Dynamic { deps, .. } => SizeEstimate::Depends(deps.clone()),
        FieldFormat::When(cond, inner) => SizeEstimate::Depends(cond.deps()).add(estimate(inner)),
        FieldFormat::List(fields) => fields
            .iter()
            .fold(SizeEstimate::Fixed(0), |acc, f| acc.add(estimate(&f.format))),
    }
}

/// An ordered, validated field list ready for the decode loop.
#[derive(Debug, Clone)]
pub struct Schema {
    name: &'static str,
    fields: Vec<FieldDescriptor>,
    size: SizeEstimate,
}

impl Schema {
    /// Compiles a field list: delegated decoder names must exist in the
    /// registry, every dependency must name an earlier field or one of
    /// the `ambient` (seeded) entries, and names must be unique.
    pub fn compile(
        name: &'static str,
        fields: Vec<FieldDescriptor>,
        registry: &Registry,
        ambient: &[&'static str],
    ) -> Result<Schema, SchemaError> {
        let mut defined: HashSet<&'static str> = ambient.iter().copied().collect();
        for field in &fields {
            validate_field(name, field, registry, &mut defined)?;
        }
        let size = fields
            .iter()
            .fold(SizeEstimate::Fixed(0), |acc, f| acc.add(estimate(&f.format)));
        Ok(Schema { name, fields, size })
    }

    /// Like [`Schema::compile`], but the schema must cover exactly
    /// `expected` bytes.
    pub fn compile_sized(
        name: &'static str,
        fields: Vec<FieldDescriptor>,
        registry: &Registry,
        ambient: &[&'static str],
        expected: usize,
    ) -> Result<Schema, SchemaError> {
        let schema = Schema::compile(name, fields, registry, ambient)?;
        match schema.size {
            SizeEstimate::Fixed(actual) if actual == expected => Ok(schema),
            SizeEstimate::Fixed(actual) => Err(SchemaError::SizeMismatch {
                schema: name,
                expected,
                actual,
            }),
            _ => Err(SchemaError::SizeMismatch {
                schema: name,
                expected,
                actual: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn static_size(&self) -> &SizeEstimate {
        &self.size
    }
}

fn validate_field(
    schema: &'static str,
    field: &FieldDescriptor,
    registry: &Registry,
    defined: &mut HashSet<&'static str>,
) -> Result<(), SchemaError> {
    if !field.is_anonymous() && !defined.insert(field.name) {
        return Err(SchemaError::DuplicateField {
            schema,
            field: field.name,
        });
    }
    validate_format(schema, field.name, &field.format, registry, defined)
}

fn validate_format(
    schema: &'static str,
    field: &'static str,
    format: &FieldFormat,
    registry: &Registry,
    defined: &mut HashSet<&'static str>,
) -> Result<(), SchemaError> {
    if let Deps::Fields(names) = format.deps() {
        for dep in names {
            if !defined.contains(dep) {
                return Err(SchemaError::UnresolvedDependency {
                    schema,
                    field,
                    dep: dep.to_string(),
                });
            }
        }
    }
    match format {
        FieldFormat::Named(name) | FieldFormat::NamedArg(name, _) => {
            if !registry.contains(name) {
                return Err(SchemaError::UnknownDecoder { schema, name });
            }
        }
        FieldFormat::When(_, inner) => {
            validate_format(schema, field, inner, registry, defined)?;
        }
        FieldFormat::List(fields) => {
            for sub in fields {
                validate_field(schema, sub, registry, defined)?;
            }
        }
        FieldFormat::RepeatUntilSize(inner, _) | FieldFormat::RepeatUntilOffset(inner, _) => {
            // repetitions step through a flat run of items, so the item
            // format must consume bytes unconditionally
            match inner.as_ref() {
                FieldFormat::Prim(_) | FieldFormat::Bytes(_) | FieldFormat::Named(_) => {
                    validate_format(schema, field, inner, registry, defined)?;
                }
                _ => return Err(SchemaError::InvalidRepetition { schema, field }),
            }
        }
        _ => {}
    }
    Ok(())
}
