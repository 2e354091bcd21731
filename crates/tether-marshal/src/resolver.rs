//! Ordered, reversible object substitution pipelines.
//!
//! A resolver chain runs every write-side substitution in list order and
//! every read-side restoration in reverse order, undoing the write pipeline
//! stage-by-stage like a stack. A resolver that does not recognize an item
//! must return it unchanged.

use crate::error::MarshalError;
use crate::item::Item;
use std::sync::Arc;

/// One reversible substitution stage at the marshalling boundary.
///
/// Implementations replace special objects with wire-safe stand-ins on
/// write and restore them on read. Both directions are identity for items
/// the resolver does not recognize.
pub trait ObjectResolver: Send + Sync {
    /// Substitute an item on the write side.
    ///
    /// # Errors
    ///
    /// Returns `MarshalError` if the item is recognized but cannot be
    /// substituted; this aborts the whole chain.
    fn substitute_on_write(&self, item: Item) -> Result<Item, MarshalError>;

    /// Restore an item on the read side.
    ///
    /// # Errors
    ///
    /// Returns `MarshalError` if the item is recognized but cannot be
    /// restored; this aborts the whole chain.
    fn restore_on_read(&self, item: Item) -> Result<Item, MarshalError>;
}

/// An ordered list of resolvers applied as one reversible pipeline.
#[derive(Clone, Default)]
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn ObjectResolver>>,
}

impl ResolverChain {
    /// Create an empty chain (identity pipeline)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resolver to the end of the chain
    pub fn push(&mut self, resolver: Arc<dyn ObjectResolver>) {
        self.resolvers.push(resolver);
    }

    /// Builder-style append
    #[must_use]
    pub fn with(mut self, resolver: Arc<dyn ObjectResolver>) -> Self {
        self.push(resolver);
        self
    }

    /// Number of stages in the chain
    #[must_use]
    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    /// True if the chain has no stages
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Run the write pipeline: stages applied in list order, each stage
    /// fed the previous stage's output.
    ///
    /// # Errors
    ///
    /// The first failing stage aborts the chain; no partial substitution
    /// is observable to the caller.
    pub fn substitute_on_write(&self, mut item: Item) -> Result<Item, MarshalError> {
        for resolver in &self.resolvers {
            item = resolver.substitute_on_write(item)?;
        }
        Ok(item)
    }

    /// Run the read pipeline: stages applied in strict reverse order,
    /// unwinding the write pipeline.
    ///
    /// # Errors
    ///
    /// The first failing stage aborts the chain.
    pub fn restore_on_read(&self, mut item: Item) -> Result<Item, MarshalError> {
        for resolver in self.resolvers.iter().rev() {
            item = resolver.restore_on_read(item)?;
        }
        Ok(item)
    }
}

impl std::fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverChain")
            .field("stages", &self.resolvers.len())
            .finish()
    }
}
