//! HeaderSet: the typed key/value metadata attached to every request and response.

use crate::error::ObexError;
use crate::protocol::header_id;

/// Header value. The variant must match the wire encoding selected by the header ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Int(u32),
    Bytes(Vec<u8>),
    Text(String),
}

/// Wire encoding of a header, derived from its ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// Null-terminated text with a 2-byte length (IDs 0x00..=0x3F): UTF-8 bytes widened to 16-bit units.
    Unicode,
    /// Null-terminated ISO-8859-1 text with a 2-byte length (TYPE only).
    Latin1,
    /// Byte sequence with a 2-byte length (IDs 0x40..=0x7F).
    Bytes,
    /// Single byte quantity (IDs 0x80..=0xBF).
    Byte,
    /// 4-byte big-endian quantity (IDs 0xC0..=0xFF).
    Int4,
}

impl HeaderKind {
    pub fn of(id: u8) -> Self {
        if id == header_id::TYPE {
            return HeaderKind::Latin1;
        }
        match id >> 6 {
            0 => HeaderKind::Unicode,
            1 => HeaderKind::Bytes,
            2 => HeaderKind::Byte,
            _ => HeaderKind::Int4,
        }
    }

    fn accepts(self, value: &HeaderValue) -> bool {
        match (self, value) {
            (HeaderKind::Unicode, HeaderValue::Text(_)) => true,
            (HeaderKind::Latin1, HeaderValue::Text(s)) => s.chars().all(|c| (c as u32) < 0x100),
            (HeaderKind::Bytes, HeaderValue::Bytes(_)) => true,
            (HeaderKind::Byte, HeaderValue::Int(v)) => *v <= 0xFF,
            (HeaderKind::Int4, HeaderValue::Int(_)) => true,
            _ => false,
        }
    }
}

/// Ordered header map. Each ID appears at most once; replacing a value keeps its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: Vec<(u8, HeaderValue)>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Store a value, rejecting variants that cannot be encoded under `id`.
    pub fn set(&mut self, id: u8, value: HeaderValue) -> Result<(), ObexError> {
        if !HeaderKind::of(id).accepts(&value) {
            return Err(ObexError::InvalidHeader { id });
        }
        self.insert(id, value);
        Ok(())
    }

    /// `None` removes the header.
    pub fn set_opt(&mut self, id: u8, value: Option<HeaderValue>) -> Result<(), ObexError> {
        match value {
            Some(v) => self.set(id, v),
            None => {
                self.remove(id);
                Ok(())
            }
        }
    }

    pub(crate) fn insert(&mut self, id: u8, value: HeaderValue) {
        match self.entries.iter_mut().find(|(i, _)| *i == id) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((id, value)),
        }
    }

    pub fn get(&self, id: u8) -> Option<&HeaderValue> {
        self.entries.iter().find(|(i, _)| *i == id).map(|(_, v)| v)
    }

    pub fn contains(&self, id: u8) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: u8) -> Option<HeaderValue> {
        let pos = self.entries.iter().position(|(i, _)| *i == id)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.entries.iter().map(|(i, _)| *i)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &HeaderValue)> {
        self.entries.iter().map(|(i, v)| (*i, v))
    }

    /// Copy every header of `other` into `self`, overwriting duplicates.
    pub fn merge(&mut self, other: HeaderSet) {
        for (id, v) in other.entries {
            self.insert(id, v);
        }
    }

    pub fn int(&self, id: u8) -> Option<u32> {
        match self.get(id) {
            Some(HeaderValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn bytes(&self, id: u8) -> Option<&[u8]> {
        match self.get(id) {
            Some(HeaderValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    pub fn text(&self, id: u8) -> Option<&str> {
        match self.get(id) {
            Some(HeaderValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.text(header_id::NAME)
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.insert(header_id::NAME, HeaderValue::Text(name.into()));
    }

    pub fn description(&self) -> Option<&str> {
        self.text(header_id::DESCRIPTION)
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.insert(header_id::DESCRIPTION, HeaderValue::Text(description.into()));
    }

    pub fn content_type(&self) -> Option<&str> {
        self.text(header_id::TYPE)
    }

    /// TYPE is ISO-8859-1 on the wire; characters outside that range are rejected.
    pub fn set_type(&mut self, mime: impl Into<String>) -> Result<(), ObexError> {
        self.set(header_id::TYPE, HeaderValue::Text(mime.into()))
    }

    pub fn length(&self) -> Option<u32> {
        self.int(header_id::LENGTH)
    }

    pub fn set_length(&mut self, len: u32) {
        self.insert(header_id::LENGTH, HeaderValue::Int(len));
    }

    /// LENGTH for an object of `len` bytes. Objects past 4 GiB go without one;
    /// returns whether the header was set.
    pub fn set_object_length(&mut self, len: u64) -> bool {
        match u32::try_from(len) {
            Ok(len) => {
                self.set_length(len);
                true
            }
            Err(_) => {
                self.remove(header_id::LENGTH);
                false
            }
        }
    }

    pub fn count(&self) -> Option<u32> {
        self.int(header_id::COUNT)
    }

    pub fn set_count(&mut self, count: u32) {
        self.insert(header_id::COUNT, HeaderValue::Int(count));
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.int(header_id::CONNECTION_ID)
    }

    pub fn set_connection_id(&mut self, id: u32) {
        self.insert(header_id::CONNECTION_ID, HeaderValue::Int(id));
    }

    pub fn target(&self) -> Option<&[u8]> {
        self.bytes(header_id::TARGET)
    }

    pub fn set_target(&mut self, target: impl Into<Vec<u8>>) {
        self.insert(header_id::TARGET, HeaderValue::Bytes(target.into()));
    }

    pub fn who(&self) -> Option<&[u8]> {
        self.bytes(header_id::WHO)
    }

    pub fn set_who(&mut self, who: impl Into<Vec<u8>>) {
        self.insert(header_id::WHO, HeaderValue::Bytes(who.into()));
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.bytes(header_id::BODY)
    }

    pub fn set_body(&mut self, data: impl Into<Vec<u8>>) {
        self.insert(header_id::BODY, HeaderValue::Bytes(data.into()));
    }

    pub fn end_of_body(&self) -> Option<&[u8]> {
        self.bytes(header_id::END_OF_BODY)
    }

    pub fn set_end_of_body(&mut self, data: impl Into<Vec<u8>>) {
        self.insert(header_id::END_OF_BODY, HeaderValue::Bytes(data.into()));
    }

    pub fn has_body(&self) -> bool {
        self.contains(header_id::BODY) || self.contains(header_id::END_OF_BODY)
    }
}
