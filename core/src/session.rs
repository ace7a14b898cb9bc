//! The contract of the session that owns the physical connection to the key.
//!
//! A transport (Lightning accessory, NFC, a desktop reader) implements [`KeySession`]; the
//! layer only observes its state and drives it.

use crate::apdu::Command;

/// Errors reported by a key session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("The key did not respond to the command")]
    NoResponse,

    #[error("The key did not respond within the allotted time")]
    TimedOut,

    #[error("The session could not be opened: {0}")]
    Open(String),

    #[error("The session could not be closed: {0}")]
    Close(String),

    #[error("Error occurred while executing the command: {0}")]
    Command(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Receives the raw response (payload followed by SW1 SW2) of an executed command.
/// Being `FnOnce`, it fires at most once; dropping it unfired counts as no response.
pub type Completion = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

/// A session-oriented connection to a single key.
pub trait KeySession: Send + Sync {
    /// Whether a key is physically connected.
    fn is_present(&self) -> bool;

    /// Whether the session is open and ready to execute commands.
    fn is_open(&self) -> bool;

    /// Opens the session, blocking until the key has answered.
    fn open(&self) -> Result<()>;

    /// Closes the session, blocking until the connection is torn down.
    fn close(&self) -> Result<()>;

    /// The serial number of the connected key, if it reports one.
    fn serial_number(&self) -> Option<String>;

    /// Executes the command on the key.
    /// Implementations may call `completion` from any thread, before or after returning.
    fn execute(&self, command: Command, completion: Completion);
}

impl<S> KeySession for std::sync::Arc<S>
where
    S: KeySession + ?Sized,
{
    fn is_present(&self) -> bool {
        (**self).is_present()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn open(&self) -> Result<()> {
        (**self).open()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }

    fn serial_number(&self) -> Option<String> {
        (**self).serial_number()
    }

    fn execute(&self, command: Command, completion: Completion) {
        (**self).execute(command, completion)
    }
}
