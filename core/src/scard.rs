//! The `SCard*` resource manager API, emulated on top of a [`Layer`].
//!
//! The resource manager hands out the context and card handles, validates every handle it is
//! given, and forwards the actual work to the layer.

use std::sync::atomic::{AtomicI32, Ordering};

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::layer::{Layer, READER_NAME};
use crate::registry::{CardId, ContextId};
use crate::status::{CardState, Protocol, Status, StatusChange};

/// The state of a connected card, as reported by `SCardStatus`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CardStatus {
    pub reader_name: String,
    pub state: CardState,
    pub protocol: Protocol,
    pub atr: Vec<u8>,
    pub serial: Option<String>,
}

/// A reader watched through `SCardGetStatusChange`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderState {
    pub reader: String,
    pub current_state: StatusChange,
    pub event_state: StatusChange,
}

impl ReaderState {
    pub fn new(reader: impl Into<String>) -> Self {
        Self {
            reader: reader.into(),
            current_state: StatusChange::UNAWARE,
            event_state: StatusChange::UNAWARE,
        }
    }
}

/// Emulates a PC/SC resource manager with a single reader.
pub struct ResourceManager<L>
where
    L: Layer,
{
    layer: L,
    next_handle: AtomicI32,
}

impl<L> ResourceManager<L>
where
    L: Layer,
{
    pub fn new(layer: L) -> Self {
        Self {
            layer,
            next_handle: AtomicI32::new(1),
        }
    }

    pub fn layer(&self) -> &L {
        &self.layer
    }

    /// Returns a positive handle that is neither a live context nor a live card.
    /// Wraps to 1 after `i32::MAX`.
    fn allocate_handle(&self) -> i32 {
        loop {
            let handle = self
                .next_handle
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |h| {
                    Some(match h {
                        i32::MAX => 1,
                        h => h + 1,
                    })
                })
                .unwrap_or(1);

            if !self.layer.context_is_valid(handle) && !self.layer.card_is_valid(handle) {
                return handle;
            }
        }
    }

    fn check_context(&self, context: ContextId) -> Result<(), Status> {
        match self.layer.context_is_valid(context) {
            true => Ok(()),
            _ => Err(Status::InvalidHandle),
        }
    }

    fn check_card(&self, card: CardId) -> Result<(), Status> {
        match self.layer.card_is_valid(card) {
            true => Ok(()),
            _ => Err(Status::InvalidHandle),
        }
    }

    /// `SCardEstablishContext`
    pub fn establish_context(&self) -> Result<ContextId, Status> {
        let context = self.allocate_handle();

        match self.layer.add_context(context) {
            true => Ok(context),
            _ => Err(Status::NoMemory),
        }
    }

    /// `SCardReleaseContext`
    pub fn release_context(&self, context: ContextId) -> Status {
        match self.layer.remove_context(context) {
            true => Status::Success,
            _ => Status::InvalidHandle,
        }
    }

    /// `SCardIsValidContext`
    pub fn is_valid_context(&self, context: ContextId) -> Status {
        into_status(self.check_context(context))
    }

    /// `SCardListReaders`
    pub fn list_readers(&self, context: ContextId) -> Result<Vec<&'static str>, Status> {
        self.check_context(context)?;

        self.layer.list_readers().map(|reader| vec![reader])
    }

    /// `SCardConnect`
    pub fn connect(&self, context: ContextId, reader: &str) -> Result<(CardId, Protocol), Status> {
        self.check_context(context)?;

        if reader != READER_NAME {
            debug!("Refused to connect to unknown reader {:?}", reader);
            return Err(Status::UnknownReader);
        }

        let card = self.allocate_handle();
        if !self.layer.add_card(card, context) {
            return Err(Status::NoMemory);
        }

        if let Err(status) = into_result(self.layer.connect_card()) {
            self.layer.remove_card(card);
            return Err(status);
        }

        Ok((card, Protocol::T1))
    }

    /// `SCardReconnect`
    pub fn reconnect(&self, card: CardId) -> Result<Protocol, Status> {
        self.check_card(card)?;

        into_result(self.layer.reconnect_card()).map(|_| Protocol::T1)
    }

    /// `SCardDisconnect`
    pub fn disconnect(&self, card: CardId) -> Status {
        if !self.layer.remove_card(card) {
            return Status::InvalidHandle;
        }

        self.layer.disconnect_card()
    }

    /// `SCardBeginTransaction`. The key is never shared, so only the handle is checked.
    pub fn begin_transaction(&self, card: CardId) -> Status {
        into_status(self.check_card(card))
    }

    /// `SCardEndTransaction`
    pub fn end_transaction(&self, card: CardId) -> Status {
        into_status(self.check_card(card))
    }

    /// `SCardTransmit`
    pub fn transmit(&self, card: CardId, command: &[u8]) -> Result<Vec<u8>, Status> {
        self.check_card(card)?;

        self.layer.transmit(command)
    }

    /// `SCardStatus`
    pub fn status(&self, card: CardId) -> Result<CardStatus, Status> {
        self.check_card(card)?;

        Ok(CardStatus {
            reader_name: READER_NAME.to_string(),
            state: self.layer.get_card_state(),
            protocol: Protocol::T1,
            atr: self.layer.get_card_atr().to_vec(),
            serial: self.layer.get_card_serial(),
        })
    }

    /// `SCardGetStatusChange`. Returns at once: every reader is reported as changed.
    pub fn get_status_change(&self, context: ContextId, states: &mut [ReaderState]) -> Status {
        if let Err(status) = self.check_context(context) {
            return status;
        }

        for state in states.iter_mut() {
            state.event_state = match state.reader == READER_NAME {
                true => self.layer.get_status_change(),
                _ => StatusChange::UNKNOWN | StatusChange::CHANGED,
            };
        }

        Status::Success
    }

    /// `pcsc_stringify_error`
    pub fn stringify_error(&self, code: i64) -> Option<&'static str> {
        self.layer.stringify_error(code)
    }
}

fn into_result(status: Status) -> Result<(), Status> {
    match status {
        Status::Success => Ok(()),
        s => Err(s),
    }
}

fn into_status(result: Result<(), Status>) -> Status {
    result.err().unwrap_or(Status::Success)
}
