//! The marshaller adapter: object graphs over byte streams.
//!
//! A `Marshaller` pairs the codec with a resolver chain. Child marshallers
//! inherit codec configuration but carry their own resolver chain, giving
//! nested object graphs (for example one arriving over a stream) an
//! isolated resolution context.

use crate::error::MarshalError;
use crate::item::Item;
use crate::resolver::ResolverChain;
use std::io::{Read, Write};

/// Immutable codec configuration, constructed once and consumed by value.
#[derive(Debug, Clone)]
pub struct MarshallerConfig {
    /// Maximum accepted object graph nesting depth
    pub max_depth: usize,
    /// Maximum accepted encoded size for a single graph (bytes)
    pub max_encoded_len: usize,
}

impl Default for MarshallerConfig {
    fn default() -> Self {
        Self {
            max_depth: crate::DEFAULT_MAX_DEPTH,
            max_encoded_len: 16 * 1024 * 1024,
        }
    }
}

/// Object-graph codec over byte streams with resolver substitution.
#[derive(Clone)]
pub struct Marshaller {
    config: MarshallerConfig,
    resolvers: ResolverChain,
}

impl Marshaller {
    /// Create a marshaller with the given configuration and resolver chain.
    #[must_use]
    pub fn new(config: MarshallerConfig, resolvers: ResolverChain) -> Self {
        Self { config, resolvers }
    }

    /// Create a marshaller with default configuration and no resolvers.
    #[must_use]
    pub fn plain() -> Self {
        Self::new(MarshallerConfig::default(), ResolverChain::new())
    }

    /// The codec configuration
    #[must_use]
    pub fn config(&self) -> &MarshallerConfig {
        &self.config
    }

    /// The resolver chain applied at this boundary
    #[must_use]
    pub fn resolvers(&self) -> &ResolverChain {
        &self.resolvers
    }

    /// Create a child marshaller: same codec configuration, fresh (empty)
    /// resolver chain.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::new(self.config.clone(), ResolverChain::new())
    }

    /// Create a child marshaller with its own resolver chain.
    #[must_use]
    pub fn child_with(&self, resolvers: ResolverChain) -> Self {
        Self::new(self.config.clone(), resolvers)
    }

    /// Run the write-side resolver pipeline over a whole graph.
    ///
    /// Substitution happens top-down: each node passes through the chain,
    /// then the (possibly substituted) node's children are visited.
    ///
    /// # Errors
    ///
    /// Fails on a resolver error or when the graph exceeds the depth limit.
    pub fn apply_write(&self, item: Item) -> Result<Item, MarshalError> {
        self.resolve_write(item, 0)
    }

    /// Run the read-side resolver pipeline over a whole graph.
    ///
    /// Restoration is the exact inverse of [`apply_write`](Self::apply_write):
    /// children are visited first, then the node passes through the chain in
    /// reverse order.
    ///
    /// # Errors
    ///
    /// Fails on a resolver error or when the graph exceeds the depth limit.
    pub fn apply_read(&self, item: Item) -> Result<Item, MarshalError> {
        self.resolve_read(item, 0)
    }

    fn resolve_write(&self, item: Item, depth: usize) -> Result<Item, MarshalError> {
        if depth > self.config.max_depth {
            return Err(MarshalError::TooDeep(self.config.max_depth));
        }
        let item = self.resolvers.substitute_on_write(item)?;
        match item {
            Item::Seq(items) => {
                let mut out = Vec::with_capacity(items.len());
                for child in items {
                    out.push(self.resolve_write(child, depth + 1)?);
                }
                Ok(Item::Seq(out))
            }
            Item::Map(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    out.push((
                        self.resolve_write(key, depth + 1)?,
                        self.resolve_write(value, depth + 1)?,
                    ));
                }
                Ok(Item::Map(out))
            }
            leaf => Ok(leaf),
        }
    }

    fn resolve_read(&self, item: Item, depth: usize) -> Result<Item, MarshalError> {
        if depth > self.config.max_depth {
            return Err(MarshalError::TooDeep(self.config.max_depth));
        }
        let item = match item {
            Item::Seq(items) => {
                let mut out = Vec::with_capacity(items.len());
                for child in items {
                    out.push(self.resolve_read(child, depth + 1)?);
                }
                Item::Seq(out)
            }
            Item::Map(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    out.push((
                        self.resolve_read(key, depth + 1)?,
                        self.resolve_read(value, depth + 1)?,
                    ));
                }
                Item::Map(out)
            }
            leaf => leaf,
        };
        self.resolvers.restore_on_read(item)
    }

    /// Serialize an object graph to a byte sink, resolver pipeline applied.
    ///
    /// # Errors
    ///
    /// Returns `MarshalError` on resolver failure, codec failure, or sink
    /// I/O failure.
    pub fn serialize_to<W: Write>(&self, item: &Item, sink: &mut W) -> Result<(), MarshalError> {
        let resolved = self.apply_write(item.clone())?;
        bincode::serialize_into(sink, &resolved).map_err(Self::codec_error)
    }

    /// Deserialize an object graph from a byte source, resolver pipeline
    /// applied in reverse.
    ///
    /// # Errors
    ///
    /// Returns `MarshalError` on codec failure, source I/O failure, or
    /// resolver failure.
    pub fn deserialize_from<R: Read>(&self, source: &mut R) -> Result<Item, MarshalError> {
        let raw = decode_limited(self.config.max_encoded_len, source).map_err(Self::codec_error)?;
        self.apply_read(raw)
    }

    fn codec_error(err: bincode::Error) -> MarshalError {
        match *err {
            bincode::ErrorKind::Io(io) => MarshalError::Io(io),
            other => MarshalError::Codec(other.to_string()),
        }
    }
}

// Decode with the configured size limit; corrupt input must fail cleanly
// rather than allocate unboundedly. The option set matches what
// `bincode::serialize_into` uses on the write side.
fn decode_limited<R: Read>(limit: usize, source: &mut R) -> Result<Item, bincode::Error> {
    use bincode::Options;
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(limit as u64)
        .deserialize_from(source)
}

impl std::fmt::Debug for Marshaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marshaller")
            .field("max_depth", &self.config.max_depth)
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}
