//! Attribute lists and their canonical wire encoding.
//!
//! Every token, keyring file and exported credential is an ordered list of
//! `name=value;` pairs. Names never contain `=` or `;`. Values are arbitrary
//! bytes; a `;` inside a value is written twice (`;;`) so the terminator stays
//! unambiguous.
//!
//! ```text
//! t=app;s=alice;et=<4 bytes BE>;
//! ```
//!
//! Insertion order is preserved and is part of the encoded bytes, so two lists
//! with the same pairs in a different order produce different tokens.

use crate::error::{Result, WebAuthError};

const SEPARATOR: u8 = b';';
const ASSIGN: u8 = b'=';

/// A single named value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Vec<u8>,
}

/// Ordered list of attributes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrList {
    attrs: Vec<Attribute>,
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(WebAuthError::invalid("empty attribute name"));
    }
    if name.bytes().any(|b| b == ASSIGN || b == SEPARATOR) {
        return Err(WebAuthError::invalid(format!(
            "attribute name {name:?} contains a separator"
        )));
    }
    Ok(())
}

fn fixed<const N: usize>(name: &str, value: &[u8]) -> Result<[u8; N]> {
    value.try_into().map_err(|_| {
        WebAuthError::corrupt(format!(
            "attribute {name} has length {}, expected {N}",
            value.len()
        ))
    })
}

impl AttrList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.iter()
    }

    /// Append an attribute, copying the value
    pub fn add(&mut self, name: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        check_name(name)?;
        self.attrs.push(Attribute {
            name: name.to_owned(),
            value: value.into(),
        });
        Ok(())
    }

    pub fn add_str(&mut self, name: &str, value: &str) -> Result<()> {
        self.add(name, value.as_bytes())
    }

    pub fn add_i32(&mut self, name: &str, value: i32) -> Result<()> {
        self.add(name, value.to_be_bytes())
    }

    pub fn add_u32(&mut self, name: &str, value: u32) -> Result<()> {
        self.add(name, value.to_be_bytes())
    }

    /// Times travel as 32-bit unsigned seconds
    pub fn add_time(&mut self, name: &str, value: u64) -> Result<()> {
        let secs = u32::try_from(value)
            .map_err(|_| WebAuthError::invalid(format!("time {value} for {name} out of range")))?;
        self.add_u32(name, secs)
    }

    /// First attribute with the given name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.name == name)
    }

    pub fn get(&self, name: &str) -> Result<&[u8]> {
        self.find(name)
            .map(|a| a.value.as_slice())
            .ok_or_else(|| WebAuthError::NotFound(name.to_owned()))
    }

    pub fn get_str(&self, name: &str) -> Result<&str> {
        std::str::from_utf8(self.get(name)?)
            .map_err(|_| WebAuthError::corrupt(format!("attribute {name} is not UTF-8")))
    }

    pub fn get_i32(&self, name: &str) -> Result<i32> {
        Ok(i32::from_be_bytes(fixed(name, self.get(name)?)?))
    }

    pub fn get_u32(&self, name: &str) -> Result<u32> {
        Ok(u32::from_be_bytes(fixed(name, self.get(name)?)?))
    }

    pub fn get_time(&self, name: &str) -> Result<u64> {
        self.get_u32(name).map(u64::from)
    }

    /// Exact number of bytes [`encode`](Self::encode) will produce
    #[must_use]
    pub fn encoded_length(&self) -> usize {
        self.attrs
            .iter()
            .map(|a| {
                let escapes = a.value.iter().filter(|&&b| b == SEPARATOR).count();
                a.name.len() + 1 + a.value.len() + escapes + 1
            })
            .sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_length());
        for attr in &self.attrs {
            // Fields are public, so a name may have been edited after insertion.
            check_name(&attr.name)?;
            out.extend_from_slice(attr.name.as_bytes());
            out.push(ASSIGN);
            for &b in &attr.value {
                out.push(b);
                if b == SEPARATOR {
                    out.push(SEPARATOR);
                }
            }
            out.push(SEPARATOR);
        }
        Ok(out)
    }

    /// Parse an encoded list into owned attributes
    ///
    /// Fails with `Corrupt` on empty input, a missing `=`, an empty or
    /// non-UTF-8 name, or a value without its terminator.
    ///
    /// An empty list encodes to zero bytes and is rejected here, so the
    /// round trip holds for non-empty lists only. Every token and file the
    /// engine writes carries at least one attribute.
    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.is_empty() {
            return Err(WebAuthError::corrupt("empty attribute list"));
        }
        let mut list = AttrList::new();
        let mut pos = 0;
        while pos < input.len() {
            let rest = &input[pos..];
            let eq = rest
                .iter()
                .position(|&b| b == ASSIGN)
                .ok_or_else(|| WebAuthError::corrupt("attribute without '='"))?;
            let raw_name = &rest[..eq];
            if raw_name.is_empty() || raw_name.contains(&SEPARATOR) {
                return Err(WebAuthError::corrupt("malformed attribute name"));
            }
            let name = std::str::from_utf8(raw_name)
                .map_err(|_| WebAuthError::corrupt("attribute name is not UTF-8"))?;
            pos += eq + 1;

            let mut value = Vec::new();
            loop {
                match input.get(pos) {
                    None => {
                        return Err(WebAuthError::corrupt(format!(
                            "unterminated value for {name}"
                        )))
                    }
                    Some(&SEPARATOR) if input.get(pos + 1) == Some(&SEPARATOR) => {
                        value.push(SEPARATOR);
                        pos += 2;
                    }
                    Some(&SEPARATOR) => {
                        pos += 1;
                        break;
                    }
                    Some(&b) => {
                        value.push(b);
                        pos += 1;
                    }
                }
            }
            list.attrs.push(Attribute {
                name: name.to_owned(),
                value,
            });
        }
        Ok(list)
    }
}

impl<'a> IntoIterator for &'a AttrList {
    type Item = &'a Attribute;
    type IntoIter = std::slice::Iter<'a, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.attrs.iter()
    }
}

// ============================================================
// TESTS
// ============================================================
