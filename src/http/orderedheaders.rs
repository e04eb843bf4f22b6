use crate::base::neterror::NetError;
use bytes::{BufMut, BytesMut};
use http::header::{HeaderName, HeaderValue};

/// A header multimap that strictly preserves insertion order and the
/// caller's original name casing.
///
/// Lookups are case-insensitive. HTTP/1.1 header names are case-insensitive
/// (RFC 9110), but the request is serialized exactly as the caller spelled it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedHeaderMap {
    headers: Vec<(String, String)>,
}

fn validate(name: &str, value: &str) -> Result<(), NetError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| NetError::InvalidToken {
        what: "Header name",
        value: name.to_string(),
    })?;
    HeaderValue::from_bytes(value.as_bytes())
        .map_err(|_| NetError::InvalidHeader { name: name.to_string() })?;
    Ok(())
}

impl OrderedHeaderMap {
    pub fn new() -> Self {
        Self { headers: Vec::new() }
    }

    /// Set a header, replacing every existing value for the name.
    ///
    /// The first existing entry is updated in place so the header keeps its
    /// position; later duplicates are dropped.
    pub fn insert(&mut self, name: &str, value: &str) -> Result<(), NetError> {
        validate(name, value)?;

        let mut slot = None;
        let mut idx = 0;
        self.headers.retain(|(n, _)| {
            let keep = if n.eq_ignore_ascii_case(name) {
                if slot.is_none() {
                    slot = Some(idx);
                    true
                } else {
                    false
                }
            } else {
                true
            };
            if keep {
                idx += 1;
            }
            keep
        });

        match slot {
            Some(i) => self.headers[i] = (name.to_string(), value.to_string()),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
        Ok(())
    }

    /// Add a header without touching existing values for the same name.
    pub fn append(&mut self, name: &str, value: &str) -> Result<(), NetError> {
        validate(name, value)?;
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Append a header that has already been validated by the parser.
    pub(crate) fn append_raw(&mut self, name: String, value: String) {
        self.headers.push((name, value));
    }

    /// Keep only the first `len` entries.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.headers.truncate(len);
    }

    pub fn remove(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// First value for `name` (case-insensitive lookup).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True if any value of a comma-separated header carries `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// All headers as-is with original casing.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Serialize as `Name: Value\r\n` lines in insertion order.
    pub fn write_to(&self, dst: &mut BytesMut) {
        for (name, value) in &self.headers {
            dst.reserve(name.len() + value.len() + 4);
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
    }
}
