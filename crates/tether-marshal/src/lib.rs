//! # Tether Marshal
//!
//! Marshalling boundary for the Tether runtime.
//!
//! This crate provides:
//! - The `Item` object model crossing the wire boundary
//! - Ordered, reversible resolver chains for object substitution
//! - The `Marshaller` adapter wrapping a byte stream with an object codec
//! - A fixed-size buffer pool with single-owner transfer semantics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Marshaller                                │
//! │   (object graph <-> byte stream, child contexts)                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      Resolver Chain                              │
//! │   (ordered substitution on write, reverse restore on read)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       Buffer Pool                                │
//! │   (fixed-size buffers, allocate/free accounting)                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod error;
pub mod item;
pub mod marshaller;
pub mod resolver;

pub use buffer::{Buffer, BufferPool, PoolStats, PooledWriter};
pub use error::MarshalError;
pub use item::{Item, MarkerKind};
pub use marshaller::{Marshaller, MarshallerConfig};
pub use resolver::{ObjectResolver, ResolverChain};

/// Default fixed buffer size handed out by the pool (bytes)
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default number of buffers a pool holds
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Default maximum object graph depth accepted by the codec
pub const DEFAULT_MAX_DEPTH: usize = 64;
