//! Query key codec.
//!
//! Keys are either a plain string or an ordered sequence of structured parts.
//! Two keys that are structurally equal (ignoring object field order) hash to
//! the same [`KeyHash`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use time::macros::format_description;

use super::lock::rw_read;
use crate::error::CircularKeyError;

const SOURCE: &str = "cache::keys";

/// Canonical identity of a key.
pub type KeyHash = String;

/// A query key as supplied by callers.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKey {
    Str(String),
    Seq(Vec<KeyPart>),
}

/// One structured component of a sequence key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPart {
    Null,
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    BigInt(i128),
    Str(String),
    Date(OffsetDateTime),
    /// Opaque callable marker; every function hashes the same.
    Function,
    List(Vec<KeyPart>),
    Map(BTreeMap<String, KeyPart>),
    /// A part reachable through shared ownership. This is the only way a key
    /// can refer back to itself.
    Shared(SharedPart),
}

/// Shared, interior-mutable key part compared by identity.
#[derive(Clone)]
pub struct SharedPart(Arc<RwLock<KeyPart>>);

impl SharedPart {
    pub fn new(part: KeyPart) -> Self {
        Self(Arc::new(RwLock::new(part)))
    }

    /// Replace the wrapped part. Used to build self-referencing keys.
    pub fn set(&self, part: KeyPart) {
        *super::lock::rw_write(&self.0, SOURCE, "shared_part.set") = part;
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for SharedPart {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SharedPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedPart({:#x})", self.addr())
    }
}

impl QueryKey {
    /// Canonical hash of this key.
    pub fn hash(&self) -> Result<KeyHash, CircularKeyError> {
        hash_key(self)
    }

    /// Human-readable form used for prefix matching.
    pub fn display_string(&self) -> Result<String, CircularKeyError> {
        key_to_string(self)
    }
}

/// Strings hash to themselves; sequences hash to `k:` followed by a stable
/// serialization with sorted object fields.
pub fn hash_key(key: &QueryKey) -> Result<KeyHash, CircularKeyError> {
    match key {
        QueryKey::Str(value) => Ok(value.clone()),
        QueryKey::Seq(parts) => {
            let mut writer = StableWriter::default();
            writer.write_list(parts, "$")?;
            Ok(format!("k:{}", writer.out))
        }
    }
}

/// The key itself for strings, the first element when it is a string,
/// otherwise the hash.
pub fn key_to_string(key: &QueryKey) -> Result<String, CircularKeyError> {
    match key {
        QueryKey::Str(value) => Ok(value.clone()),
        QueryKey::Seq(parts) => match parts.first() {
            Some(KeyPart::Str(first)) => Ok(first.clone()),
            _ => hash_key(key),
        },
    }
}

/// Stable serialization of a single part, without the `k:` prefix.
pub fn stable_stringify(part: &KeyPart) -> Result<String, CircularKeyError> {
    let mut writer = StableWriter::default();
    writer.write_part(part, "$")?;
    Ok(writer.out)
}

#[derive(Default)]
struct StableWriter {
    out: String,
    stack: Vec<usize>,
}

impl StableWriter {
    fn write_part(&mut self, part: &KeyPart, path: &str) -> Result<(), CircularKeyError> {
        match part {
            KeyPart::Null => self.out.push_str("null"),
            KeyPart::Undefined => self.out.push_str("\"__undefined__\""),
            KeyPart::Bool(value) => self.out.push_str(if *value { "true" } else { "false" }),
            KeyPart::Int(value) => self.out.push_str(&value.to_string()),
            KeyPart::Float(value) => self.out.push_str(&format_number(*value)),
            KeyPart::BigInt(value) => self.push_json_str(&format!("__bigint__:{value}")),
            KeyPart::Str(value) => self.push_json_str(value),
            KeyPart::Date(value) => self.push_json_str(&format!("__date__:{}", iso_string(*value))),
            KeyPart::Function => self.out.push_str("\"__function__\""),
            KeyPart::List(items) => self.write_list(items, path)?,
            KeyPart::Map(fields) => {
                self.out.push('{');
                for (idx, (name, value)) in fields.iter().enumerate() {
                    if idx > 0 {
                        self.out.push(',');
                    }
                    self.push_json_str(name);
                    self.out.push(':');
                    self.write_part(value, &format!("{path}.{name}"))?;
                }
                self.out.push('}');
            }
            KeyPart::Shared(shared) => {
                let addr = shared.addr();
                if self.stack.contains(&addr) {
                    return Err(CircularKeyError {
                        path: path.to_string(),
                    });
                }
                self.stack.push(addr);
                let inner = rw_read(&shared.0, SOURCE, "stable_stringify").clone();
                let result = self.write_part(&inner, path);
                self.stack.pop();
                result?;
            }
        }
        Ok(())
    }

    fn write_list(&mut self, items: &[KeyPart], path: &str) -> Result<(), CircularKeyError> {
        self.out.push('[');
        for (idx, item) in items.iter().enumerate() {
            if idx > 0 {
                self.out.push(',');
            }
            self.write_part(item, &format!("{path}[{idx}]"))?;
        }
        self.out.push(']');
        Ok(())
    }

    fn push_json_str(&mut self, value: &str) {
        self.out.push_str(&Value::from(value).to_string());
    }
}

/// Number rendering matching ECMAScript `Number::toString`: shortest
/// round-trip digits, exponent form below 1e-6 and from 1e21.
fn format_number(value: f64) -> String {
    if !value.is_finite() {
        return "null".to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    let sign = if value < 0.0 { "-" } else { "" };
    let scientific = format!("{:e}", value.abs());
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return value.to_string();
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return value.to_string();
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let len = digits.len() as i32;
    // Decimal point position relative to the first digit.
    let point = exponent + 1;

    let body = if len <= point && point <= 21 {
        format!("{digits}{}", "0".repeat((point - len) as usize))
    } else if 0 < point && point <= 21 {
        let (whole, fraction) = digits.split_at(point as usize);
        format!("{whole}.{fraction}")
    } else if -6 < point && point <= 0 {
        format!("0.{}{digits}", "0".repeat(point.unsigned_abs() as usize))
    } else {
        let (first, rest) = digits.split_at(1);
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        if rest.is_empty() {
            format!("{first}e{exp_sign}{}", exponent.unsigned_abs())
        } else {
            format!("{first}.{rest}e{exp_sign}{}", exponent.unsigned_abs())
        }
    };
    format!("{sign}{body}")
}

fn iso_string(value: OffsetDateTime) -> String {
    let utc = value.to_offset(time::UtcOffset::UTC);
    utc.format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    ))
    .unwrap_or_else(|_| utc.unix_timestamp().to_string())
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for KeyPart {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(value) => Self::Int(value),
            Err(_) => Self::BigInt(i128::from(value)),
        }
    }
}

impl From<usize> for KeyPart {
    fn from(value: usize) -> Self {
        Self::from(value as u64)
    }
}

impl From<f64> for KeyPart {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<OffsetDateTime> for KeyPart {
    fn from(value: OffsetDateTime) -> Self {
        Self::Date(value)
    }
}

impl From<SharedPart> for KeyPart {
    fn from(value: SharedPart) -> Self {
        Self::Shared(value)
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Undefined)
    }
}

impl<T: Into<KeyPart>> From<Vec<T>> for KeyPart {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

impl From<Value> for KeyPart {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(value) => Self::Bool(value),
            Value::Number(number) => match number.as_i64() {
                Some(value) => Self::Int(value),
                None => match number.as_u64() {
                    Some(value) => Self::from(value),
                    None => Self::Float(number.as_f64().unwrap_or(f64::NAN)),
                },
            },
            Value::String(value) => Self::Str(value),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(fields) => Self::Map(
                fields
                    .into_iter()
                    .map(|(name, value)| (name, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<KeyPart>> for QueryKey {
    fn from(parts: Vec<KeyPart>) -> Self {
        Self::Seq(parts)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawKey {
    Str(String),
    Seq(Vec<Value>),
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match RawKey::deserialize(deserializer)? {
            RawKey::Str(value) => Self::Str(value),
            RawKey::Seq(items) => Self::Seq(items.into_iter().map(KeyPart::from).collect()),
        })
    }
}

/// Build a sequence [`QueryKey`] from heterogeneous parts.
///
/// ```
/// use yokai_query::query_key;
/// let key = query_key!["todos", 7];
/// assert_eq!(key.hash().unwrap(), "k:[\"todos\",7]");
/// ```
#[macro_export]
macro_rules! query_key {
    [$($part:expr),* $(,)?] => {
        $crate::cache::QueryKey::Seq(vec![$($crate::cache::KeyPart::from($part)),*])
    };
}
