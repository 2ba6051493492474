//! Predicate evaluation over decoded packets.
//!
//! Layer decoders surface their fields as [`Value`]s; the interpreter
//! walks the compiled AST against one packet at a time. Any evaluation
//! error (missing layer, missing field, type mismatch) is reported to
//! the matcher, which treats it as "no match" for that packet.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use crate::matcher::expr::{BinOp, Expr, UnaryOp};
use crate::matcher::MatcherConfig;
use crate::pkt::Packet;

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_ARC);

/// Dynamically typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn from_entries<const N: usize>(entries: [(&str, Value); N]) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    /// Map member lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::List(l) => write!(f, "<list of {}>", l.len()),
            Value::Map(m) => write!(f, "<map of {}>", m.len()),
        }
    }
}

/// Evaluation failure; the matcher turns it into a non-match.
#[derive(Debug)]
pub struct EvalError(pub String);

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn err<T>(msg: impl Into<String>) -> Result<T, EvalError> {
    Err(EvalError(msg.into()))
}

pub struct Env<'a> {
    pub pkt: &'a Packet,
    pub config: &'a MatcherConfig,
    /// Set while an `ExistsNfsOp` wrapper iterates compound operations.
    current_op: Option<&'a Value>,
}

impl<'a> Env<'a> {
    pub fn new(pkt: &'a Packet, config: &'a MatcherConfig) -> Self {
        Self { pkt, config, current_op: None }
    }
}

pub fn eval(expr: &Expr, env: &Env<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Int(v) => Ok(Value::Int(*v)),
        Expr::Float(v) => Ok(Value::Float(*v)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, env)?);
            }
            Ok(Value::List(out))
        }
        Expr::Const(name) => match env.config.constants.get(name) {
            Some(&v) => Ok(Value::Int(v)),
            None => err(format!("unknown name '{name}'")),
        },
        Expr::Path(path) => err(format!("unresolved path {path:?}")),
        Expr::Field { layer, path } => resolve_field(layer, path, env),
        Expr::Unary(op, inner) => {
            let v = eval(inner, env)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
                UnaryOp::Neg => match v {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => err(format!("cannot negate {other:?}")),
                },
            }
        }
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, env),
        Expr::Call { name, args } => eval_call(name, args, env),
        Expr::ExistsNfsOp(inner) => {
            let Some(nfs) = env.pkt.app("nfs") else {
                return err("packet has no nfs layer");
            };
            match nfs.fields.get("array") {
                Some(Value::List(ops)) => {
                    for op in ops {
                        let op_env = Env { pkt: env.pkt, config: env.config, current_op: Some(op) };
                        if eval(inner, &op_env).map(|v| v.truthy()).unwrap_or(false) {
                            return Ok(Value::Bool(true));
                        }
                    }
                    Ok(Value::Bool(false))
                }
                // no compound array (NFSv3 and friends): plain field access
                _ => eval(inner, env),
            }
        }
    }
}

fn resolve_field(layer: &str, path: &[String], env: &Env<'_>) -> Result<Value, EvalError> {
    let Some(head) = path.first() else { return err("empty field path") };

    // inside an exists-over-operations wrapper, NFS fields resolve
    // against the current operation first
    if layer.eq_ignore_ascii_case("nfs") {
        if let Some(op) = env.current_op {
            if let Some(v) = op.get(head) {
                return descend(v.clone(), &path[1..]);
            }
        }
    }

    match env.pkt.field(layer, head) {
        Some(v) => descend(v, &path[1..]),
        None => err(format!("no field {layer}.{head}")),
    }
}

fn descend(mut value: Value, rest: &[String]) -> Result<Value, EvalError> {
    for part in rest {
        let next = match &value {
            Value::Map(m) => m.get(part).cloned(),
            Value::List(l) => part.parse::<usize>().ok().and_then(|i| l.get(i).cloned()),
            _ => None,
        };
        match next {
            Some(v) => value = v,
            None => return err(format!("no member '{part}'")),
        }
    }
    Ok(value)
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(*b as i64 as f64),
        _ => None,
    }
}

fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn as_bytes(v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::Bytes(b) => Some(b.clone()),
        // strings built from \xNN escapes hold one char per byte value;
        // map them back so they compare equal to raw wire bytes
        Value::Str(s) if s.chars().all(|c| (c as u32) < 256) => {
            Some(s.chars().map(|c| c as u32 as u8).collect())
        }
        Value::Str(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Equality across the numeric tower plus str/bytes interchange.
fn values_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Str(_) | Value::Bytes(_), Value::Str(_) | Value::Bytes(_)) => {
            as_bytes(a) == as_bytes(b)
        }
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_eq(l, r))
        }
        _ => match (as_float(a), as_float(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Str(_) | Value::Bytes(_), Value::Str(_) | Value::Bytes(_)) => {
            Some(as_bytes(a)?.cmp(&as_bytes(b)?))
        }
        _ => as_float(a)?.partial_cmp(&as_float(b)?),
    }
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, env: &Env<'_>) -> Result<Value, EvalError> {
    // short-circuit the connectives
    match op {
        BinOp::And => {
            let l = eval(lhs, env)?;
            if !l.truthy() {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(eval(rhs, env)?.truthy()));
        }
        BinOp::Or => {
            let l = eval(lhs, env)?;
            if l.truthy() {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(eval(rhs, env)?.truthy()));
        }
        _ => {}
    }

    let l = eval(lhs, env)?;
    let r = eval(rhs, env)?;
    use std::cmp::Ordering;
    match op {
        BinOp::Eq => Ok(Value::Bool(values_eq(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!values_eq(&l, &r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let Some(ord) = compare(&l, &r) else {
                return err(format!("cannot compare {l:?} and {r:?}"));
            };
            Ok(Value::Bool(match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Le => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                BinOp::Ge => ord != Ordering::Less,
                _ => unreachable!(),
            }))
        }
        BinOp::In => match &r {
            Value::List(items) => Ok(Value::Bool(items.iter().any(|i| values_eq(&l, i)))),
            Value::Str(_) | Value::Bytes(_) => {
                let (Some(needle), Some(hay)) = (as_bytes(&l), as_bytes(&r)) else {
                    return err("'in' needs bytes on both sides");
                };
                Ok(Value::Bool(
                    needle.is_empty() || hay.windows(needle.len().max(1)).any(|w| w == needle),
                ))
            }
            other => err(format!("'in' not supported against {other:?}")),
        },
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            if let (Some(x), Some(y)) = (as_int(&l), as_int(&r)) {
                return match op {
                    BinOp::Add => Ok(Value::Int(x.wrapping_add(y))),
                    BinOp::Sub => Ok(Value::Int(x.wrapping_sub(y))),
                    BinOp::Mul => Ok(Value::Int(x.wrapping_mul(y))),
                    BinOp::Div if y != 0 => Ok(Value::Int(x / y)),
                    BinOp::Mod if y != 0 => Ok(Value::Int(x % y)),
                    _ => err("division by zero"),
                };
            }
            let (Some(x), Some(y)) = (as_float(&l), as_float(&r)) else {
                return err(format!("arithmetic on {l:?} and {r:?}"));
            };
            Ok(Value::Float(match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => x / y,
                BinOp::Mod => x % y,
                _ => unreachable!(),
            }))
        }
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr => {
            let (Some(x), Some(y)) = (as_int(&l), as_int(&r)) else {
                return err(format!("bitwise op on {l:?} and {r:?}"));
            };
            Ok(Value::Int(match op {
                BinOp::BitAnd => x & y,
                BinOp::BitOr => x | y,
                BinOp::BitXor => x ^ y,
                BinOp::Shl => x.wrapping_shl(y as u32),
                BinOp::Shr => x.wrapping_shr(y as u32),
                _ => unreachable!(),
            }))
        }
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn eval_call(name: &str, args: &[Expr], env: &Env<'_>) -> Result<Value, EvalError> {
    let values: Vec<Value> = args.iter().map(|a| eval(a, env)).collect::<Result<_, _>>()?;
    match (name, values.as_slice()) {
        ("crc32", [v]) => {
            let Some(bytes) = as_bytes(v) else { return err("crc32 needs bytes") };
            Ok(Value::Int(CRC32.checksum(&bytes) as i64))
        }
        ("crc16", [v]) => {
            let Some(bytes) = as_bytes(v) else { return err("crc16 needs bytes") };
            Ok(Value::Int(CRC16.checksum(&bytes) as i64))
        }
        ("len", [v]) => match v {
            Value::Str(s) => Ok(Value::Int(s.len() as i64)),
            Value::Bytes(b) => Ok(Value::Int(b.len() as i64)),
            Value::List(l) => Ok(Value::Int(l.len() as i64)),
            other => err(format!("len of {other:?}")),
        },
        ("hex", [v]) => match as_int(v) {
            Some(i) => Ok(Value::Str(format!("{i:#x}"))),
            None => err("hex needs an integer"),
        },
        ("search", [pattern, subject]) => {
            let Value::Str(pattern) = pattern else { return err("search pattern must be a string") };
            let re = Regex::new(pattern).map_err(|e| EvalError(format!("bad regex: {e}")))?;
            Ok(Value::Bool(re.is_match(&subject.to_string())))
        }
        _ => err(format!("unknown function '{name}' or wrong arity")),
    }
}
