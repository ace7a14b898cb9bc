//! Desktop PC/SC support for the layer.
//! Can be enabled by turning `pcsc` feature on.
//!
//! ## Why?
//! On a phone the key is reached through an accessory or NFC session provided by the host
//! application. On a desktop the same key sits behind a PC/SC reader, and [`PcscSession`]
//! makes that reader look like a key session, so the layer can be driven and inspected there.
//!
//! ## Supported platform
//! Linux, Windows and macOS are supported by pcsc-rust, backend of this implementation.
//! Refer the documentation of pcsc-rust for details:
//! <https://github.com/bluetech/pcsc-rust>
//!
//! ## Usage
//! ```rust,no_run
//! use ykpcsc::pcsc::PcscSession;
//! use ykpcsc::{Layer, PcscLayer};
//!
//! let session = PcscSession::try_new().unwrap();
//! let layer = PcscLayer::new(session);
//! let status = layer.connect_card();
//! ```

use std::ffi::{CStr, CString};
use std::time::Duration;

use parking_lot::Mutex;
use pcsc::{Card, Disposition, Protocols, ReaderState, Scope, ShareMode, State, MAX_BUFFER_SIZE};

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::apdu::{Command, Response};
use crate::session::{self, Completion, KeySession};

const SELECT_OTP: [u8; 12] = [
    0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x05, 0x27, 0x20, 0x01,
];
const GET_SERIAL: [u8; 4] = [0x00, 0x01, 0x10, 0x00];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error occurred while communicating with PC/SC: {0}")]
    PcscError(#[from] pcsc::Error),

    #[error("Reader not found on PC/SC service")]
    ReaderNotFound,

    #[error("No session is open on the reader")]
    NotOpen,
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// A key session over a reader of the PC/SC service of the operating system.
pub struct PcscSession {
    ctx: pcsc::Context,
    reader: CString,
    card: Mutex<Option<Card>>,
}

impl PcscSession {
    /// Creates a session on the first reader of the PC/SC service, in user scope.
    pub fn try_new() -> Result<Self> {
        Self::open_reader(|_| true)
    }

    /// Creates a session on the reader with the name.
    pub fn with_reader(name: &str) -> Result<Self> {
        Self::open_reader(|reader| reader.to_str().map(|r| r == name).unwrap_or(false))
    }

    fn open_reader<P>(predicate: P) -> Result<Self>
    where
        P: Fn(&CStr) -> bool,
    {
        let ctx = pcsc::Context::establish(Scope::User).map_err(Error::PcscError)?;
        let mut buf = [0u8; 2048];

        let reader = ctx
            .list_readers(&mut buf)
            .map_err(Error::PcscError)?
            .find(|r| predicate(r))
            .ok_or(Error::ReaderNotFound)?
            .to_owned();

        debug!("Using reader: {}", reader.to_str().unwrap_or_default());

        Ok(Self {
            ctx,
            reader,
            card: Mutex::new(None),
        })
    }

    /// The name of the reader in use.
    pub fn reader(&self) -> &CStr {
        &self.reader
    }

    fn connect(&self) -> Result<Card> {
        self.ctx
            .connect(&self.reader, ShareMode::Shared, Protocols::ANY)
            .map_err(Error::PcscError)
    }

    fn read_serial(card: &Card) -> Result<Option<u32>> {
        if !Response::from_bytes(&transmit(card, &SELECT_OTP)?).is_ok() {
            return Ok(None);
        }

        let response = Response::from_bytes(&transmit(card, &GET_SERIAL)?);

        Ok(match (response.is_ok(), response.payload()) {
            (true, [a, b, c, d]) => Some(u32::from_be_bytes([*a, *b, *c, *d])),
            _ => None,
        })
    }
}

/// Transmits an APDU command to the card, then receives a response from them.
fn transmit(card: &Card, tx: &[u8]) -> Result<Vec<u8>> {
    debug!("TX: {}", hex::encode(tx));

    let mut rx = [0u8; MAX_BUFFER_SIZE];
    let rx = card.transmit(tx, &mut rx).map_err(Error::PcscError)?;

    debug!("RX: {}", hex::encode(rx));

    Ok(Vec::from(rx))
}

impl KeySession for PcscSession {
    fn is_present(&self) -> bool {
        let mut states = [ReaderState::new(self.reader.clone(), State::UNAWARE)];

        match self.ctx.get_status_change(Duration::ZERO, &mut states) {
            Ok(_) => states[0].event_state().contains(State::PRESENT),
            Err(e) => {
                debug!("Failed to query the reader state: {}", e);
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.card.lock().is_some()
    }

    fn open(&self) -> session::Result<()> {
        let mut card = self.card.lock();

        if card.is_none() {
            *card = Some(self.connect().map_err(|e| session::Error::Open(e.to_string()))?);
            debug!("Connected to the key");
        }

        Ok(())
    }

    /// Closing a session that is not open succeeds.
    fn close(&self) -> session::Result<()> {
        match self.card.lock().take() {
            Some(card) => card
                .disconnect(Disposition::LeaveCard)
                .map_err(|(_, e)| session::Error::Close(e.to_string())),
            None => Ok(()),
        }
    }

    fn serial_number(&self) -> Option<String> {
        let card = self.card.lock();

        let serial = match card.as_ref() {
            Some(card) => Self::read_serial(card),
            None => self.connect().and_then(|card| Self::read_serial(&card)),
        };

        match serial {
            Ok(serial) => serial.map(|s| s.to_string()),
            Err(e) => {
                debug!("Failed to read the serial number: {}", e);
                None
            }
        }
    }

    fn execute(&self, command: Command, completion: Completion) {
        let result = match self.card.lock().as_ref() {
            Some(card) => transmit(card, &Vec::from(command)),
            None => Err(Error::NotOpen),
        };

        completion(result.map_err(|e| session::Error::Command(Box::new(e))));
    }
}
