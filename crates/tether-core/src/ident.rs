//! Identifier allocation for session entities.
//!
//! Each peer allocates compact identifiers for four entity kinds. An
//! origin bit tags every identifier as locally- or remotely-assigned, so
//! both peers can allocate independently without a shared counter: ids of
//! different origin never collide by construction, and ids of the same
//! origin are kept unique by the allocator.
//!
//! The allocator is bitset-based: allocation takes the lowest free slot in
//! a 16-bit space to keep wire representations small, and released values
//! become reusable immediately.

use crate::error::IdentError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

/// Number of allocatable values per (kind, origin) space.
pub const ID_SPACE: u32 = 1 << 16;

const WORDS: usize = (ID_SPACE as usize) / 64;

/// Entity kinds an identifier may refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// An exposed request/reply contract
    Service,
    /// One open binding between a caller and a service
    Context,
    /// One outstanding invocation
    Request,
    /// A secondary multi-message channel
    Stream,
}

impl Kind {
    fn index(self) -> usize {
        match self {
            Self::Service => 0,
            Self::Context => 1,
            Self::Request => 2,
            Self::Stream => 3,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Service => "service",
            Self::Context => "context",
            Self::Request => "request",
            Self::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// Which peer assigned an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Assigned by this peer
    Local,
    /// Assigned by the remote peer
    Remote,
}

impl Origin {
    /// The opposite perspective: a locally-assigned id is remotely-assigned
    /// as seen by the peer, and vice versa. Applied once per wire crossing.
    #[must_use]
    pub fn flip(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

/// A compact (kind, origin, value) identifier.
///
/// Within one session, no two live identifiers of the same kind and origin
/// compare equal. Equality covers all three fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    kind: Kind,
    origin: Origin,
    value: u32,
}

impl Identifier {
    /// Build an identifier from its parts.
    #[must_use]
    pub fn new(kind: Kind, origin: Origin, value: u32) -> Self {
        Self { kind, origin, value }
    }

    /// The entity kind
    #[must_use]
    pub fn kind(self) -> Kind {
        self.kind
    }

    /// The origin bit
    #[must_use]
    pub fn origin(self) -> Origin {
        self.origin
    }

    /// The numeric value
    #[must_use]
    pub fn value(self) -> u32 {
        self.value
    }

    /// The same identifier as seen from the peer's perspective.
    #[must_use]
    pub fn flip(self) -> Self {
        Self { origin: self.origin.flip(), ..self }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.origin {
            Origin::Local => 'l',
            Origin::Remote => 'r',
        };
        write!(f, "{}:{}{}", self.kind, tag, self.value)
    }
}

macro_rules! typed_id {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Identifier);

        impl $name {
            /// Build from origin and value.
            #[must_use]
            pub fn from_parts(origin: Origin, value: u32) -> Self {
                Self(Identifier::new($kind, origin, value))
            }

            /// Wrap an untyped identifier of the matching kind.
            ///
            /// # Errors
            ///
            /// Returns `IdentError::KindMismatch` if the identifier is of a
            /// different kind.
            pub fn try_wrap(id: Identifier) -> Result<Self, IdentError> {
                if id.kind() == $kind {
                    Ok(Self(id))
                } else {
                    Err(IdentError::KindMismatch { expected: $kind, actual: id.kind() })
                }
            }

            /// The underlying identifier
            #[must_use]
            pub fn id(self) -> Identifier {
                self.0
            }

            /// The origin bit
            #[must_use]
            pub fn origin(self) -> Origin {
                self.0.origin()
            }

            /// The numeric value
            #[must_use]
            pub fn value(self) -> u32 {
                self.0.value()
            }

            /// The same identifier as seen from the peer's perspective.
            #[must_use]
            pub fn flip(self) -> Self {
                Self(self.0.flip())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

typed_id!(
    /// Identifier of an exposed service.
    ServiceId,
    Kind::Service
);
typed_id!(
    /// Identifier of an open context (client binding).
    ContextId,
    Kind::Context
);
typed_id!(
    /// Identifier of an outstanding request.
    RequestId,
    Kind::Request
);
typed_id!(
    /// Identifier of a data stream.
    StreamId,
    Kind::Stream
);

/// One bitset covering a (kind, origin=local) value space.
struct BitSet {
    words: Box<[u64; WORDS]>,
    live: u32,
}

impl BitSet {
    fn new() -> Self {
        Self { words: Box::new([0u64; WORDS]), live: 0 }
    }

    /// Claim the lowest clear bit, or `None` when the space is exhausted.
    fn acquire_lowest(&mut self) -> Option<u32> {
        for (word_index, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones();
                *word |= 1u64 << bit;
                self.live += 1;
                return Some((word_index as u32) * 64 + bit);
            }
        }
        None
    }

    /// Clear a bit; returns false if it was not set (double release).
    fn release(&mut self, value: u32) -> bool {
        let word_index = (value / 64) as usize;
        let mask = 1u64 << (value % 64);
        if word_index >= WORDS || self.words[word_index] & mask == 0 {
            return false;
        }
        self.words[word_index] &= !mask;
        self.live -= 1;
        true
    }

    fn is_live(&self, value: u32) -> bool {
        let word_index = (value / 64) as usize;
        word_index < WORDS && self.words[word_index] & (1u64 << (value % 64)) != 0
    }
}

/// Thread-safe, bitset-based identifier allocator for locally-assigned ids.
///
/// Remote-origin identifiers are owned by the peer; passing one to
/// [`release`](Self::release) is a no-op.
pub struct IdAllocator {
    spaces: [Mutex<BitSet>; 4],
}

impl IdAllocator {
    /// Create an allocator with all four spaces empty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            spaces: [
                Mutex::new(BitSet::new()),
                Mutex::new(BitSet::new()),
                Mutex::new(BitSet::new()),
                Mutex::new(BitSet::new()),
            ],
        }
    }

    fn space(&self, kind: Kind) -> std::sync::MutexGuard<'_, BitSet> {
        // Lock poisoning only happens if an allocator method panicked,
        // which none do; recover the inner state either way.
        match self.spaces[kind.index()].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocate a previously-unused local identifier of the given kind.
    ///
    /// # Errors
    ///
    /// Returns `IdentError::Exhausted` when the 16-bit space for this kind
    /// has no free values. Callers treat this as fatal to the requesting
    /// operation, not to the session.
    pub fn allocate(&self, kind: Kind) -> Result<Identifier, IdentError> {
        let value = self
            .space(kind)
            .acquire_lowest()
            .ok_or(IdentError::Exhausted { kind })?;
        Ok(Identifier::new(kind, Origin::Local, value))
    }

    /// Allocate a typed service identifier.
    pub fn allocate_service(&self) -> Result<ServiceId, IdentError> {
        self.allocate(Kind::Service).and_then(ServiceId::try_wrap)
    }

    /// Allocate a typed context identifier.
    pub fn allocate_context(&self) -> Result<ContextId, IdentError> {
        self.allocate(Kind::Context).and_then(ContextId::try_wrap)
    }

    /// Allocate a typed request identifier.
    pub fn allocate_request(&self) -> Result<RequestId, IdentError> {
        self.allocate(Kind::Request).and_then(RequestId::try_wrap)
    }

    /// Allocate a typed stream identifier.
    pub fn allocate_stream(&self) -> Result<StreamId, IdentError> {
        self.allocate(Kind::Stream).and_then(StreamId::try_wrap)
    }

    /// Mark an identifier reusable.
    ///
    /// Double release and release of a remote-origin identifier are no-ops:
    /// concurrent teardown paths may race to release.
    pub fn release(&self, id: Identifier) {
        if id.origin() != Origin::Local {
            return;
        }
        if !self.space(id.kind()).release(id.value()) {
            tracing::trace!(%id, "release of dead identifier ignored");
        }
    }

    /// True if the given local identifier is currently allocated.
    #[must_use]
    pub fn is_live(&self, id: Identifier) -> bool {
        id.origin() == Origin::Local && self.space(id.kind()).is_live(id.value())
    }

    /// Number of live local identifiers of a kind.
    #[must_use]
    pub fn live_count(&self, kind: Kind) -> u32 {
        self.space(kind).live
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdAllocator")
            .field("services", &self.live_count(Kind::Service))
            .field("contexts", &self.live_count(Kind::Context))
            .field("requests", &self.live_count(Kind::Request))
            .field("streams", &self.live_count(Kind::Stream))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_lowest_slot_allocation() {
        let alloc = IdAllocator::new();
        let a = alloc.allocate(Kind::Context).unwrap();
        let b = alloc.allocate(Kind::Context).unwrap();
        assert_eq!(a.value(), 0);
        assert_eq!(b.value(), 1);
        assert_eq!(a.origin(), Origin::Local);
    }

    #[test]
    fn test_live_ids_never_equal() {
        let alloc = IdAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = alloc.allocate(Kind::Request).unwrap();
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_release_allows_reuse() {
        let alloc = IdAllocator::new();
        let a = alloc.allocate(Kind::Stream).unwrap();
        let _b = alloc.allocate(Kind::Stream).unwrap();
        alloc.release(a);

        let c = alloc.allocate(Kind::Stream).unwrap();
        assert_eq!(c.value(), a.value());
    }

    #[test]
    fn test_double_release_is_noop() {
        let alloc = IdAllocator::new();
        let id = alloc.allocate(Kind::Service).unwrap();
        alloc.release(id);
        alloc.release(id);
        assert_eq!(alloc.live_count(Kind::Service), 0);
    }

    #[test]
    fn test_remote_release_ignored() {
        let alloc = IdAllocator::new();
        let local = alloc.allocate(Kind::Context).unwrap();
        let remote = Identifier::new(Kind::Context, Origin::Remote, local.value());

        alloc.release(remote);
        assert!(alloc.is_live(local));
    }

    #[test]
    fn test_kinds_are_independent_spaces() {
        let alloc = IdAllocator::new();
        let a = alloc.allocate(Kind::Service).unwrap();
        let b = alloc.allocate(Kind::Context).unwrap();
        assert_eq!(a.value(), 0);
        assert_eq!(b.value(), 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_exhaustion() {
        let alloc = IdAllocator::new();
        for _ in 0..ID_SPACE {
            alloc.allocate(Kind::Request).unwrap();
        }
        assert!(matches!(
            alloc.allocate(Kind::Request),
            Err(IdentError::Exhausted { kind: Kind::Request })
        ));

        // Other kinds are unaffected.
        assert!(alloc.allocate(Kind::Context).is_ok());
    }

    #[test]
    fn test_concurrent_allocation_is_collision_free() {
        let alloc = Arc::new(IdAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                (0..500)
                    .map(|_| alloc.allocate(Kind::Request).unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id.value()), "duplicate live id {id}");
            }
        }
        assert_eq!(alloc.live_count(Kind::Request), 4000);
    }

    #[test]
    fn test_flip_round_trip() {
        let id = Identifier::new(Kind::Stream, Origin::Local, 17);
        assert_eq!(id.flip().origin(), Origin::Remote);
        assert_eq!(id.flip().flip(), id);
    }

    #[test]
    fn test_typed_wrapper_kind_check() {
        let id = Identifier::new(Kind::Context, Origin::Local, 3);
        assert!(ContextId::try_wrap(id).is_ok());
        assert!(matches!(
            ServiceId::try_wrap(id),
            Err(IdentError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_display_format() {
        let id = ContextId::from_parts(Origin::Remote, 12);
        assert_eq!(id.to_string(), "context:r12");
    }
}
