//! The PC/SC layer: a PC/SC shaped surface over a single key session.
//!
//! ## Usage
//! ```rust,ignore
//! use ykpcsc::{Layer, PcscLayer, Status};
//!
//! let layer = PcscLayer::new(session);
//! assert_eq!(Status::Success, layer.connect_card());
//!
//! let response = layer.transmit(&[0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x05, 0x27, 0x20, 0x01]);
//! ```

use std::sync::mpsc;
use std::time::Duration;

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::apdu::{Command, Response};
use crate::registry::{CardId, ContextId, Registry};
use crate::session::{self, KeySession};
use crate::status::{self, CardState, Status, StatusChange};

/// The name of the only reader the layer exposes.
pub const READER_NAME: &str = "Yubico YubiKey";

/// The ATR reported for any key, whatever the actual model is.
pub const ATR: [u8; 22] = [
    0x3B, 0xF8, 0x13, 0x00, 0x00, 0x81, 0x31, 0xFE, 0x15, 0x59, 0x75, 0x62, 0x69, 0x6B, 0x65, 0x79,
    0x4E, 0x45, 0x4F, 0x72, 0x33, 0xE1,
];

const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration of the layer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Config {
    /// How long `transmit` waits for the key to answer. `None` waits forever.
    pub transmit_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transmit_timeout: Some(DEFAULT_TRANSMIT_TIMEOUT),
        }
    }
}

/// The operations behind the `SCard*` functions.
///
/// [`PcscLayer`] is the implementation backed by a key session; tests can hand any other
/// implementation to [`crate::scard::ResourceManager`].
pub trait Layer: Send + Sync {
    /// Opens the session to the key. Used by `SCardConnect`.
    fn connect_card(&self) -> Status;

    /// Closes and opens the session again. Used by `SCardReconnect`.
    fn reconnect_card(&self) -> Status;

    /// Closes the session to the key. Used by `SCardDisconnect`.
    fn disconnect_card(&self) -> Status;

    /// Sends a command APDU to the key, returning the response APDU. Used by `SCardTransmit`.
    fn transmit(&self, command: &[u8]) -> Result<Vec<u8>, Status>;

    /// Used by `SCardListReaders`.
    fn list_readers(&self) -> Result<&'static str, Status>;

    /// Used by `SCardStatus`.
    fn get_card_state(&self) -> CardState;

    /// Used by `SCardGetStatusChange`.
    fn get_status_change(&self) -> StatusChange;

    /// Used by `SCardStatus`.
    fn get_card_serial(&self) -> Option<String>;

    /// Used by `SCardStatus`.
    fn get_card_atr(&self) -> &'static [u8];

    /// Used by `pcsc_stringify_error`.
    fn stringify_error(&self, code: i64) -> Option<&'static str>;

    /// Adds a context. Fails once [`crate::registry::MAX_CONTEXTS`] are alive.
    fn add_context(&self, context: ContextId) -> bool;

    /// Removes a context and all of its cards.
    fn remove_context(&self, context: ContextId) -> bool;

    /// Adds a card to a known context.
    /// Fails once [`crate::registry::MAX_CARDS_PER_CONTEXT`] are in the context.
    fn add_card(&self, card: CardId, context: ContextId) -> bool;

    /// Removes a card from its context.
    fn remove_card(&self, card: CardId) -> bool;

    /// Whether the context was added and not removed yet.
    fn context_is_valid(&self, context: ContextId) -> bool;

    /// Whether the card was added and not removed yet.
    fn card_is_valid(&self, card: CardId) -> bool;

    /// The context associated with the card, if any.
    fn context_for_card(&self, card: CardId) -> Option<ContextId>;
}

/// A [`Layer`] that communicates with the key through the session.
pub struct PcscLayer<S>
where
    S: KeySession,
{
    session: S,
    registry: Registry,
    config: Config,
}

impl<S> PcscLayer<S>
where
    S: KeySession,
{
    /// Creates a layer on top of the session with the default configuration.
    pub fn new(session: S) -> Self {
        Self::with_config(session, Config::default())
    }

    pub fn with_config(session: S, config: Config) -> Self {
        Self {
            session,
            registry: Registry::new(),
            config,
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the command on the session and waits for its single completion.
    fn execute(&self, command: Command) -> session::Result<Vec<u8>> {
        let (tx, rx) = mpsc::sync_channel(1);

        self.session.execute(
            command,
            Box::new(move |result| {
                // The receiver is gone if the wait timed out already.
                let _ = tx.send(result);
            }),
        );

        match self.config.transmit_timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                mpsc::RecvTimeoutError::Timeout => session::Error::TimedOut,
                mpsc::RecvTimeoutError::Disconnected => session::Error::NoResponse,
            })?,
            None => rx.recv().map_err(|_| session::Error::NoResponse)?,
        }
    }
}

impl<S> Layer for PcscLayer<S>
where
    S: KeySession,
{
    fn connect_card(&self) -> Status {
        if !self.session.is_present() {
            return Status::NoSmartcard;
        }

        match self.session.open() {
            Ok(_) => {
                debug!("Session opened");
                Status::Success
            }
            Err(e) => {
                warn!("Failed to open the session: {}", e);
                Status::WaitedTooLong
            }
        }
    }

    fn reconnect_card(&self) -> Status {
        match self.disconnect_card() {
            Status::Success => self.connect_card(),
            status => status,
        }
    }

    fn disconnect_card(&self) -> Status {
        if !self.session.is_present() {
            return Status::NoSmartcard;
        }

        match self.session.close() {
            Ok(_) => {
                debug!("Session closed");
                Status::Success
            }
            Err(e) => {
                warn!("Failed to close the session: {}", e);
                Status::WaitedTooLong
            }
        }
    }

    fn transmit(&self, command: &[u8]) -> Result<Vec<u8>, Status> {
        if !self.session.is_open() {
            return Err(Status::ReaderUnavailable);
        }

        if command.is_empty() {
            return Err(Status::InvalidParameter);
        }

        let command = Command::parse(command).map_err(|e| {
            debug!("Rejected a malformed command: {}", e);
            Status::InvalidParameter
        })?;

        match self.execute(command) {
            Ok(response) => {
                debug!(
                    "Command completed with SW {:04X}",
                    Response::from_bytes(&response).status_word()
                );
                Ok(response)
            }
            Err(e) => {
                warn!("Failed to execute the command: {}", e);
                Err(Status::WaitedTooLong)
            }
        }
    }

    fn list_readers(&self) -> Result<&'static str, Status> {
        match self.session.is_present() {
            true => Ok(READER_NAME),
            _ => Err(Status::NoReadersAvailable),
        }
    }

    fn get_card_state(&self) -> CardState {
        match (self.session.is_present(), self.session.is_open()) {
            (true, true) => CardState::Specific,
            (true, false) => CardState::Swallowed,
            _ => CardState::Absent,
        }
    }

    fn get_status_change(&self) -> StatusChange {
        match self.session.is_present() {
            true => StatusChange::PRESENT | StatusChange::CHANGED,
            _ => StatusChange::EMPTY | StatusChange::CHANGED,
        }
    }

    fn get_card_serial(&self) -> Option<String> {
        match self.session.is_present() {
            true => self.session.serial_number(),
            _ => None,
        }
    }

    fn get_card_atr(&self) -> &'static [u8] {
        &ATR
    }

    fn stringify_error(&self, code: i64) -> Option<&'static str> {
        status::stringify(code)
    }

    fn add_context(&self, context: ContextId) -> bool {
        self.registry.add_context(context)
    }

    fn remove_context(&self, context: ContextId) -> bool {
        self.registry.remove_context(context)
    }

    fn add_card(&self, card: CardId, context: ContextId) -> bool {
        self.registry.add_card(card, context)
    }

    fn remove_card(&self, card: CardId) -> bool {
        self.registry.remove_card(card)
    }

    fn context_is_valid(&self, context: ContextId) -> bool {
        self.registry.context_is_valid(context)
    }

    fn card_is_valid(&self, card: CardId) -> bool {
        self.registry.card_is_valid(card)
    }

    fn context_for_card(&self, card: CardId) -> Option<ContextId> {
        self.registry.context_for_card(card)
    }
}
