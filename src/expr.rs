use crate::decode::{DecodeCache, Value};

/// Set of field names an expression reads from the decode cache.
///
/// `All` is the wildcard used when a computation cannot be analyzed
/// statically; it satisfies any dependency validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deps {
    Fields(Vec<&'static str>),
    All,
}

impl Deps {
    pub fn none() -> Deps {
        Deps::Fields(Vec::new())
    }

    pub fn one(name: &'static str) -> Deps {
        Deps::Fields(vec![name])
    }

    pub fn union(self, other: Deps) -> Deps {
        match (self, other) {
            (Deps::All, _) | (_, Deps::All) => Deps::All,
            (Deps::Fields(mut a), Deps::Fields(b)) => {
                for name in b {
                    if !a.contains(&name) {
                        a.push(name);
                    }
                }
                Deps::Fields(a)
            }
        }
    }
}

/// Pure function applied over evaluated arguments; `None` means the
/// expression has no value.
pub type ApplyFn = fn(&[Value]) -> Option<Value>;

/// A lazily evaluated expression over the decode cache.
///
/// Evaluation never fails loudly: a missing field, a type mismatch, or
/// a refusing function all yield `None`, which callers interpret as
/// "field absent" or "condition not met". This replaces the usual
/// pattern of catching decoder exceptions to express optional fields.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A literal value.
    Lit(Value),
    /// The decoded value of an earlier field or a seeded ambient entry.
    Field(&'static str),
    /// Bytes consumed so far in the current decode pass.
    Cursor,
    /// Integer membership test, yielding 1 or 0.
    OneOf(Box<Expr>, &'static [i64]),
    /// Equality test, yielding 1 or 0.
    Eq(Box<Expr>, Box<Expr>),
    /// Boolean negation of an inner test.
    Not(Box<Expr>),
    /// A function over evaluated arguments.
    Apply(ApplyFn, Vec<Expr>),
}

impl Expr {
    pub fn field(name: &'static str) -> Expr {
        Expr::Field(name)
    }

    pub fn one_of(self, set: &'static [i64]) -> Expr {
        Expr::OneOf(Box::new(self), set)
    }

    pub fn eq(self, rhs: Expr) -> Expr {
        Expr::Eq(Box::new(self), Box::new(rhs))
    }

    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    pub fn apply(f: ApplyFn, args: Vec<Expr>) -> Expr {
        Expr::Apply(f, args)
    }

    /// Evaluates against the cache; `None` short-circuits the chain.
    pub fn eval(&self, cache: &DecodeCache) -> Option<Value> {
        match self {
            Expr::Lit(v) => Some(v.clone()),
            Expr::Field(name) => cache.value(name).cloned(),
            Expr::Cursor => Some(Value::Int(cache.cursor() as i64)),
            Expr::OneOf(inner, set) => {
                let v = inner.eval(cache)?.as_int()?;
                Some(Value::Int(i64::from(set.contains(&v))))
            }
            Expr::Eq(lhs, rhs) => {
                let l = lhs.eval(cache)?;
                let r = rhs.eval(cache)?;
                Some(Value::Int(i64::from(l == r)))
            }
            Expr::Not(inner) => {
                let v = inner.eval(cache)?;
                Some(Value::Int(i64::from(!v.is_truthy())))
            }
            Expr::Apply(f, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.eval(cache)?);
                }
                f(&values)
            }
        }
    }

    /// The cache entries this expression reads.
    pub fn deps(&self) -> Deps {
        match self {
            Expr::Lit(_) | Expr::Cursor => Deps::none(),
            Expr::Field(name) => Deps::one(name),
            Expr::OneOf(inner, _) | Expr::Not(inner) => inner.deps(),
            Expr::Eq(lhs, rhs) => lhs.deps().union(rhs.deps()),
            Expr::Apply(_, args) => args
                .iter()
                .fold(Deps::none(), |acc, a| acc.union(a.deps())),
        }
    }
}
