//! Transport bindings for the Tether session runtime.
//!
//! Two wire formats drive the same session semantics:
//!
//! - [`local`]: in-process direct delivery. Two endpoints connect to the
//!   same `local:<name>` link and each pumps messages straight into the
//!   peer's session, origins flipped.
//! - [`framed`]: length-prefixed binary frames over any async byte duplex,
//!   using the codec in [`frame`] and the marshal crate's resolver
//!   pipeline on payloads.
//!
//! Both implement `ProtocolHandler` from `tether-core`; the session core
//! never learns which one is underneath.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod frame;
pub mod framed;
pub mod local;

pub use frame::{encode_frame, encode_into, FrameDecoder, FrameError, MAX_FRAME_LEN};
pub use framed::FramedHandler;
pub use local::{LocalHandler, LocalProtocolFactory};
