//! Declarative rule tables mapping records to attribute lists.
//!
//! A record type describes itself as a static slice of [`Rule`]s. Each rule
//! names the wire attribute, the value kind, and whether the field may be
//! omitted. Encoding and decoding walk the table, so adding a token kind means
//! adding a table plus two small conversion functions, never new parsing code.
//!
//! Repeated sub-records are flattened into numbered attributes:
//!
//! ```text
//! na=<count>;A0=..;a0=..;A1=..;a1=..;
//! ```

use std::collections::BTreeMap;

use crate::attrs::AttrList;
use crate::error::{Result, WebAuthError};

/// Upper bound on a decoded repeat count
pub const MAX_REPEAT: u32 = 1024;

/// Shape of one field on the wire
#[derive(Debug, Clone, Copy)]
pub enum RuleKind {
    /// Opaque bytes
    Data,
    /// UTF-8 text
    String,
    /// Signed 32-bit integer, big-endian
    Int32,
    /// Unsigned 32-bit integer, big-endian
    Uint32,
    /// Seconds since the epoch, 32-bit big-endian
    Time,
    /// Count attribute followed by numbered sub-records
    Repeat(&'static [Rule]),
}

/// One field of a record
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub attr: &'static str,
    pub desc: &'static str,
    pub kind: RuleKind,
    pub optional: bool,
    /// Time field filled with the current time when zero
    pub creation: bool,
}

impl Rule {
    #[must_use]
    pub const fn new(attr: &'static str, desc: &'static str, kind: RuleKind) -> Self {
        Self {
            attr,
            desc,
            kind,
            optional: false,
            creation: false,
        }
    }

    #[must_use]
    pub const fn optional(self) -> Self {
        Self {
            optional: true,
            ..self
        }
    }

    #[must_use]
    pub const fn creation(self) -> Self {
        Self {
            creation: true,
            ..self
        }
    }
}

/// A field value in a [`Record`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Data(Vec<u8>),
    String(String),
    Int32(i32),
    Uint32(u32),
    Time(u64),
    Repeat(Vec<Record>),
}

impl Value {
    fn is_zero(&self) -> bool {
        match self {
            Value::Data(d) => d.is_empty(),
            Value::String(s) => s.is_empty(),
            Value::Int32(v) => *v == 0,
            Value::Uint32(v) => *v == 0,
            Value::Time(v) => *v == 0,
            Value::Repeat(r) => r.is_empty(),
        }
    }
}

/// Field values keyed by wire attribute name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: BTreeMap<&'static str, Value>,
}

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, attr: &'static str, value: Value) -> &mut Self {
        self.fields.insert(attr, value);
        self
    }

    /// Set only when present
    pub fn set_opt(&mut self, attr: &'static str, value: Option<Value>) -> &mut Self {
        if let Some(value) = value {
            self.fields.insert(attr, value);
        }
        self
    }

    #[must_use]
    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.fields.get(attr)
    }

    #[must_use]
    pub fn data(&self, attr: &str) -> Option<&[u8]> {
        match self.get(attr) {
            Some(Value::Data(d)) => Some(d),
            _ => None,
        }
    }

    #[must_use]
    pub fn string(&self, attr: &str) -> Option<&str> {
        match self.get(attr) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn int32(&self, attr: &str) -> Option<i32> {
        match self.get(attr) {
            Some(Value::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn uint32(&self, attr: &str) -> Option<u32> {
        match self.get(attr) {
            Some(Value::Uint32(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn time(&self, attr: &str) -> Option<u64> {
        match self.get(attr) {
            Some(Value::Time(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn repeat(&self, attr: &str) -> &[Record] {
        match self.get(attr) {
            Some(Value::Repeat(r)) => r,
            _ => &[],
        }
    }
}

fn kind_mismatch(rule: &Rule) -> WebAuthError {
    WebAuthError::invalid(format!("{} has the wrong value type", rule.desc))
}

fn encode_scalar(rule: &Rule, name: &str, value: &Value, now: u64, out: &mut AttrList) -> Result<()> {
    match (rule.kind, value) {
        (RuleKind::Data, Value::Data(d)) => out.add(name, d.clone()),
        (RuleKind::String, Value::String(s)) => out.add_str(name, s),
        (RuleKind::Int32, Value::Int32(v)) => out.add_i32(name, *v),
        (RuleKind::Uint32, Value::Uint32(v)) => out.add_u32(name, *v),
        (RuleKind::Time, Value::Time(v)) => {
            let t = if *v == 0 && rule.creation { now } else { *v };
            out.add_time(name, t)
        }
        _ => Err(kind_mismatch(rule)),
    }
}

fn encode_fields(rules: &[Rule], record: &Record, suffix: &str, now: u64, out: &mut AttrList) -> Result<()> {
    for rule in rules {
        let name = format!("{}{}", rule.attr, suffix);
        let value = record.get(rule.attr);
        let value = match value {
            Some(v) if rule.optional && v.is_zero() => continue,
            Some(v) => v,
            None if rule.optional => continue,
            None if rule.creation => {
                out.add_time(&name, now)?;
                continue;
            }
            None => {
                return Err(WebAuthError::invalid(format!("missing {}", rule.desc)));
            }
        };
        match (rule.kind, value) {
            (RuleKind::Repeat(sub), Value::Repeat(records)) => {
                if !suffix.is_empty() {
                    return Err(WebAuthError::invalid(format!("nested repeat in {}", rule.desc)));
                }
                let count = u32::try_from(records.len())
                    .ok()
                    .filter(|&n| n <= MAX_REPEAT)
                    .ok_or_else(|| WebAuthError::invalid(format!("too many {}", rule.desc)))?;
                out.add_u32(&name, count)?;
                for (i, sub_record) in records.iter().enumerate() {
                    encode_fields(sub, sub_record, &i.to_string(), now, out)?;
                }
            }
            (RuleKind::Repeat(_), _) => return Err(kind_mismatch(rule)),
            _ => encode_scalar(rule, &name, value, now, out)?,
        }
    }
    Ok(())
}

/// Append a record's attributes to `out`, in rule order
pub fn encode_into(rules: &[Rule], record: &Record, now: u64, out: &mut AttrList) -> Result<()> {
    encode_fields(rules, record, "", now, out)
}

pub fn encode_record(rules: &[Rule], record: &Record, now: u64) -> Result<AttrList> {
    let mut out = AttrList::new();
    encode_into(rules, record, now, &mut out)?;
    Ok(out)
}

fn decode_scalar(rule: &Rule, name: &str, attrs: &AttrList) -> Result<Value> {
    Ok(match rule.kind {
        RuleKind::Data => Value::Data(attrs.get(name)?.to_vec()),
        RuleKind::String => Value::String(attrs.get_str(name)?.to_owned()),
        RuleKind::Int32 => Value::Int32(attrs.get_i32(name)?),
        RuleKind::Uint32 => Value::Uint32(attrs.get_u32(name)?),
        RuleKind::Time => Value::Time(attrs.get_time(name)?),
        RuleKind::Repeat(_) => return Err(WebAuthError::corrupt(format!("nested repeat in {}", rule.desc))),
    })
}

fn decode_sub_record(rules: &[Rule], index: u32, attrs: &AttrList) -> Result<Record> {
    let mut record = Record::new();
    for rule in rules {
        let name = format!("{}{}", rule.attr, index);
        if attrs.find(&name).is_none() {
            if rule.optional {
                continue;
            }
            return Err(WebAuthError::corrupt(format!("missing {} #{index}", rule.desc)));
        }
        record.set(rule.attr, decode_scalar(rule, &name, attrs)?);
    }
    Ok(record)
}

/// Build a record from the attributes the rules name
///
/// Attributes not named by any rule are ignored.
pub fn decode_record(rules: &[Rule], attrs: &AttrList) -> Result<Record> {
    let mut record = Record::new();
    for rule in rules {
        if attrs.find(rule.attr).is_none() {
            if rule.optional {
                continue;
            }
            return Err(WebAuthError::invalid(format!("missing {}", rule.desc)));
        }
        let value = match rule.kind {
            RuleKind::Repeat(sub) => {
                let count = attrs.get_u32(rule.attr)?;
                if count > MAX_REPEAT {
                    return Err(WebAuthError::corrupt(format!("{} count {count} too large", rule.desc)));
                }
                let records = (0..count)
                    .map(|i| decode_sub_record(sub, i, attrs))
                    .collect::<Result<Vec<_>>>()?;
                Value::Repeat(records)
            }
            _ => decode_scalar(rule, rule.attr, attrs)?,
        };
        record.set(rule.attr, value);
    }
    Ok(record)
}

// ============================================================
// TESTS
// ============================================================
