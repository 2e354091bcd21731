//! The object model crossing the marshalling boundary.
//!
//! Payloads are expressed as `Item` trees rather than raw bytes so that
//! resolver chains can substitute "special" objects (stream handles,
//! proxies) with compact wire markers and restore them on the far side.

use serde::{Deserialize, Serialize};

/// Marker categories installed by resolvers in place of special objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerKind {
    /// Placeholder for a stream handle; `id` carries the stream identifier value
    Stream,
    /// Placeholder for a remote object proxy
    Proxy,
}

/// A self-describing object graph node.
///
/// `Item` is the unit the resolver chain and the codec operate on. It is
/// deliberately closed: transports never see application types, only this
/// model, which keeps "on-the-wire identifiers" separate from local object
/// graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Item {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    I64(i64),
    /// Floating point
    F64(f64),
    /// UTF-8 text
    Text(String),
    /// Opaque bytes
    Bytes(Vec<u8>),
    /// Ordered sequence of items
    Seq(Vec<Item>),
    /// Ordered key/value pairs
    Map(Vec<(Item, Item)>),
    /// Wire placeholder for a special object, installed by a resolver
    Marker {
        /// What category of object the marker stands in for
        kind: MarkerKind,
        /// Identifier value resolving the object on the far side
        id: u32,
    },
}

impl Item {
    /// Convenience constructor for a text item
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Convenience constructor for a bytes item
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(b.into())
    }

    /// Borrow the text content, if this is a text item
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the byte content, if this is a bytes item
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// True if this node carries no children
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        !matches!(self, Self::Seq(_) | Self::Map(_))
    }
}

impl From<String> for Item {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Item {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<i64> for Item {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<bool> for Item {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}
