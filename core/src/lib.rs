//! A crate to talk to a YubiKey through a PC/SC shaped interface.
//!
//! The key is reached through a single [`session::KeySession`] at a time. On top of it,
//! [`PcscLayer`] tracks the contexts and cards handed out to callers and translates the state of
//! the session into PC/SC status codes, and [`ResourceManager`] provides the `SCard*` functions.

#[macro_use]
mod macros;

#[cfg(feature = "pcsc")]
pub mod pcsc;

pub mod apdu;
pub mod layer;
pub mod registry;
pub mod scard;
pub mod session;
pub mod status;

pub use layer::{Config, Layer, PcscLayer, ATR, READER_NAME};
pub use registry::{CardId, ContextId, Registry};
pub use scard::{CardStatus, ReaderState, ResourceManager};
pub use session::KeySession;
pub use status::{CardState, Protocol, Status, StatusChange};
