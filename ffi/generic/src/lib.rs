#![allow(clippy::missing_safety_doc)]

//! C binding of the ykpcsc resource manager.
//!
//! The host application owns the connection to the key and lends it through a
//! [`SessionDelegate`]. After [`ykpcsc_init`], the `ykpcsc_*` functions behave like their
//! `SCard*` counterparts and return PC/SC status codes.

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr::{self, null_mut};
use std::slice;

use once_cell::sync::OnceCell;

use ykpcsc::apdu::Command;
use ykpcsc::session::{self, Completion, KeySession};
use ykpcsc::{
    CardId, ContextId, Layer, PcscLayer, ReaderState, ResourceManager, Status, StatusChange,
    READER_NAME,
};

/// Size of the ATR buffer of a `SCARD_READERSTATE`.
pub const MAX_ATR_SIZE: usize = 36;

/// The `DWORD` of `winscard.h`: `unsigned long`, except on macOS.
#[cfg(not(target_os = "macos"))]
pub type Dword = std::os::raw::c_ulong;

/// The `DWORD` of `winscard.h`: `uint32_t` on macOS.
#[cfg(target_os = "macos")]
pub type Dword = u32;

type Manager = ResourceManager<PcscLayer<FfiSession>>;

static MANAGER: OnceCell<Manager> = OnceCell::new();

/// Called by the host exactly once per executed command, from any thread.
/// `response` must point to `response_len` octets (payload followed by SW1 SW2) when `ok` is
/// true; it is copied before the call returns.
pub type CompletionCallback =
    extern "C" fn(token: *mut c_void, response: *const u8, response_len: usize, ok: bool);

/// The key session provided by the host. Every callback must be set, and may be called from
/// any thread.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct SessionDelegate {
    /// Passed back as the first argument of every callback.
    pub user_data: *mut c_void,

    /// Whether a key is connected.
    pub is_present: extern "C" fn(user_data: *mut c_void) -> bool,

    /// Whether the session is open.
    pub is_open: extern "C" fn(user_data: *mut c_void) -> bool,

    /// Opens the session, blocking until done.
    pub open: extern "C" fn(user_data: *mut c_void) -> bool,

    /// Closes the session, blocking until done.
    pub close: extern "C" fn(user_data: *mut c_void) -> bool,

    /// The serial number of the key, or 0 if unknown.
    pub serial_number: extern "C" fn(user_data: *mut c_void) -> u32,

    /// Executes the command. `command` is only valid during the call.
    /// `completion` must be called with `token` once the key has answered.
    pub execute: extern "C" fn(
        user_data: *mut c_void,
        command: *const u8,
        command_len: usize,
        completion: CompletionCallback,
        token: *mut c_void,
    ),
}

/// A `SCARD_READERSTATE`, laid out as in the `winscard.h` of the platform.
#[cfg_attr(not(target_os = "macos"), repr(C))]
#[cfg_attr(target_os = "macos", repr(C, packed))]
pub struct ReaderStateFfi {
    pub reader: *const c_char,
    pub user_data: *mut c_void,
    pub current_state: Dword,
    pub event_state: Dword,
    pub atr_len: Dword,
    pub atr: [u8; MAX_ATR_SIZE],
}

struct FfiSession {
    delegate: SessionDelegate,
}

// The delegate contract requires its callbacks to be callable from any thread.
unsafe impl Send for FfiSession {}
unsafe impl Sync for FfiSession {}

impl KeySession for FfiSession {
    fn is_present(&self) -> bool {
        (self.delegate.is_present)(self.delegate.user_data)
    }

    fn is_open(&self) -> bool {
        (self.delegate.is_open)(self.delegate.user_data)
    }

    fn open(&self) -> session::Result<()> {
        match (self.delegate.open)(self.delegate.user_data) {
            true => Ok(()),
            _ => Err(session::Error::Open("refused by the host".into())),
        }
    }

    fn close(&self) -> session::Result<()> {
        match (self.delegate.close)(self.delegate.user_data) {
            true => Ok(()),
            _ => Err(session::Error::Close("refused by the host".into())),
        }
    }

    fn serial_number(&self) -> Option<String> {
        match (self.delegate.serial_number)(self.delegate.user_data) {
            0 => None,
            serial => Some(serial.to_string()),
        }
    }

    fn execute(&self, command: Command, completion: Completion) {
        let command = Vec::from(command);
        let token = Box::into_raw(Box::new(completion)) as *mut c_void;

        (self.delegate.execute)(
            self.delegate.user_data,
            command.as_ptr(),
            command.len(),
            complete,
            token,
        );
    }
}

extern "C" fn complete(token: *mut c_void, response: *const u8, response_len: usize, ok: bool) {
    if token.is_null() {
        return;
    }

    let completion = unsafe { Box::from_raw(token as *mut Completion) };
    let result = match (ok, response.is_null()) {
        (true, false) => Ok(unsafe { slice::from_raw_parts(response, response_len) }.to_vec()),
        (true, true) => Err(session::Error::NoResponse),
        _ => Err(session::Error::Command("the host reported a failure".into())),
    };

    completion(result);
}

fn manager() -> Result<&'static Manager, Status> {
    MANAGER.get().ok_or(Status::NoService)
}

fn run<F>(f: F) -> i64
where
    F: FnOnce(&'static Manager) -> Result<(), Status>,
{
    match manager().and_then(f) {
        Ok(_) => Status::Success.code(),
        Err(status) => status.code(),
    }
}

fn into_result(status: Status) -> Result<(), Status> {
    match status {
        Status::Success => Ok(()),
        s => Err(s),
    }
}

unsafe fn write<T>(ptr: *mut T, value: T) {
    if !ptr.is_null() {
        *ptr = value;
    }
}

/// Copies the octets to the buffer the way PC/SC does.
/// A null buffer only reports the required length; a short one fails with the length reported.
unsafe fn copy_to_buffer(src: &[u8], dst: *mut u8, dst_len: *mut Dword) -> Result<(), Status> {
    if dst_len.is_null() {
        return Err(Status::InvalidParameter);
    }

    let available = *dst_len as usize;
    *dst_len = src.len() as Dword;

    if dst.is_null() {
        return Ok(());
    }

    if available < src.len() {
        return Err(Status::InsufficientBuffer);
    }

    ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
    Ok(())
}

/// Encodes names as a multi-string: each name NUL terminated, followed by an extra NUL.
fn multi_string(names: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    for name in names {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }
    buf.push(0);
    buf
}

unsafe fn str_from_ptr<'a>(ptr: *const c_char) -> Option<&'a str> {
    match ptr.is_null() {
        true => None,
        _ => CStr::from_ptr(ptr).to_str().ok(),
    }
}

/// Initiates the library with the session of the host.
/// Returns false if the library was initiated already; the first delegate stays in use.
#[no_mangle]
pub extern "C" fn ykpcsc_init(delegate: SessionDelegate) -> bool {
    MANAGER
        .set(ResourceManager::new(PcscLayer::new(FfiSession { delegate })))
        .is_ok()
}

/// `SCardEstablishContext`. The scope is ignored.
#[no_mangle]
pub unsafe extern "C" fn ykpcsc_establish_context(_scope: Dword, context: *mut ContextId) -> i64 {
    run(|m| {
        if context.is_null() {
            return Err(Status::InvalidParameter);
        }

        *context = m.establish_context()?;
        Ok(())
    })
}

/// `SCardReleaseContext`
#[no_mangle]
pub extern "C" fn ykpcsc_release_context(context: ContextId) -> i64 {
    run(|m| into_result(m.release_context(context)))
}

/// `SCardIsValidContext`
#[no_mangle]
pub extern "C" fn ykpcsc_is_valid_context(context: ContextId) -> i64 {
    run(|m| into_result(m.is_valid_context(context)))
}

/// `SCardListReaders`. Readers are written as a multi-string.
#[no_mangle]
pub unsafe extern "C" fn ykpcsc_list_readers(
    context: ContextId,
    readers: *mut c_char,
    readers_len: *mut Dword,
) -> i64 {
    run(|m| {
        let names = m.list_readers(context)?;
        copy_to_buffer(&multi_string(&names), readers as *mut u8, readers_len)
    })
}

/// `SCardConnect`. The share mode and the preferred protocols are ignored.
#[no_mangle]
pub unsafe extern "C" fn ykpcsc_connect(
    context: ContextId,
    reader: *const c_char,
    _share_mode: Dword,
    _preferred_protocols: Dword,
    card: *mut CardId,
    active_protocol: *mut Dword,
) -> i64 {
    run(|m| {
        if card.is_null() {
            return Err(Status::InvalidParameter);
        }

        let reader = str_from_ptr(reader).ok_or(Status::UnknownReader)?;
        let (handle, protocol) = m.connect(context, reader)?;

        *card = handle;
        write(active_protocol, Dword::from(protocol.code()));
        Ok(())
    })
}

/// `SCardReconnect`
#[no_mangle]
pub unsafe extern "C" fn ykpcsc_reconnect(
    card: CardId,
    _share_mode: Dword,
    _preferred_protocols: Dword,
    _initialization: Dword,
    active_protocol: *mut Dword,
) -> i64 {
    run(|m| {
        let protocol = m.reconnect(card)?;

        write(active_protocol, Dword::from(protocol.code()));
        Ok(())
    })
}

/// `SCardDisconnect`. The key is always left as is.
#[no_mangle]
pub extern "C" fn ykpcsc_disconnect(card: CardId, _disposition: Dword) -> i64 {
    run(|m| into_result(m.disconnect(card)))
}

/// `SCardBeginTransaction`
#[no_mangle]
pub extern "C" fn ykpcsc_begin_transaction(card: CardId) -> i64 {
    run(|m| into_result(m.begin_transaction(card)))
}

/// `SCardEndTransaction`
#[no_mangle]
pub extern "C" fn ykpcsc_end_transaction(card: CardId, _disposition: Dword) -> i64 {
    run(|m| into_result(m.end_transaction(card)))
}

/// `SCardTransmit`. The response APDU, status word included, is written to `response`.
#[no_mangle]
pub unsafe extern "C" fn ykpcsc_transmit(
    card: CardId,
    command: *const u8,
    command_len: Dword,
    response: *mut u8,
    response_len: *mut Dword,
) -> i64 {
    run(|m| {
        let command = match command.is_null() {
            true if command_len > 0 => return Err(Status::InvalidParameter),
            true => &[][..],
            _ => slice::from_raw_parts(command, command_len as usize),
        };

        let rx = m.transmit(card, command)?;
        copy_to_buffer(&rx, response, response_len)
    })
}

/// `SCardStatus`. Any output pointer may be null to skip it.
#[no_mangle]
pub unsafe extern "C" fn ykpcsc_status(
    card: CardId,
    reader_name: *mut c_char,
    reader_len: *mut Dword,
    state: *mut Dword,
    protocol: *mut Dword,
    atr: *mut u8,
    atr_len: *mut Dword,
) -> i64 {
    run(|m| {
        let status = m.status(card)?;

        if !reader_len.is_null() {
            copy_to_buffer(
                &multi_string(&[status.reader_name.as_str()]),
                reader_name as *mut u8,
                reader_len,
            )?;
        }

        if !atr_len.is_null() {
            copy_to_buffer(&status.atr, atr, atr_len)?;
        }

        write(state, status.state.code() as Dword);
        write(protocol, Dword::from(status.protocol.code()));
        Ok(())
    })
}

/// `SCardGetStatusChange`. Returns at once, whatever the timeout is.
#[no_mangle]
pub unsafe extern "C" fn ykpcsc_get_status_change(
    context: ContextId,
    _timeout: Dword,
    states: *mut ReaderStateFfi,
    count: Dword,
) -> i64 {
    run(|m| {
        let states: &mut [ReaderStateFfi] = match states.is_null() {
            true if count > 0 => return Err(Status::InvalidParameter),
            true => &mut [],
            _ => slice::from_raw_parts_mut(states, count as usize),
        };

        let mut watched = states
            .iter()
            .map(|s| {
                let mut state = ReaderState::new(str_from_ptr(s.reader).unwrap_or_default());
                state.current_state = StatusChange::from_bits_retain(s.current_state as i64);
                state
            })
            .collect::<Vec<_>>();

        into_result(m.get_status_change(context, &mut watched))?;

        let atr = m.layer().get_card_atr();
        for (ffi, state) in states.iter_mut().zip(watched) {
            ffi.event_state = state.event_state.bits() as Dword;

            if state.reader == READER_NAME && state.event_state.contains(StatusChange::PRESENT) {
                let len = atr.len().min(MAX_ATR_SIZE);
                ffi.atr[..len].copy_from_slice(&atr[..len]);
                ffi.atr_len = len as Dword;
            }
        }

        Ok(())
    })
}

/// Returns the context the card belongs to, or 0 if the card is unknown.
#[no_mangle]
pub extern "C" fn ykpcsc_context_for_card(card: CardId) -> ContextId {
    manager()
        .ok()
        .and_then(|m| m.layer().context_for_card(card))
        .unwrap_or(0)
}

/// `pcsc_stringify_error`. Returns null for an unknown code.
/// The string must be released with [`ykpcsc_free_string`].
#[no_mangle]
pub extern "C" fn ykpcsc_stringify_error(code: i64) -> *mut c_char {
    ykpcsc::status::stringify(code)
        .and_then(|s| CString::new(s).ok())
        .map(CString::into_raw)
        .unwrap_or(null_mut())
}

/// Releases a string returned by this library.
#[no_mangle]
pub unsafe extern "C" fn ykpcsc_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = CString::from_raw(s);
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    static SESSION_OPEN: AtomicBool = AtomicBool::new(false);
    static EXPORTED_OPEN: AtomicBool = AtomicBool::new(false);

    fn flag<'a>(user_data: *mut c_void) -> &'a AtomicBool {
        unsafe { &*(user_data as *const AtomicBool) }
    }

    extern "C" fn present(_: *mut c_void) -> bool {
        true
    }

    extern "C" fn is_open(user_data: *mut c_void) -> bool {
        flag(user_data).load(Ordering::SeqCst)
    }

    extern "C" fn open(user_data: *mut c_void) -> bool {
        flag(user_data).store(true, Ordering::SeqCst);
        true
    }

    extern "C" fn close(user_data: *mut c_void) -> bool {
        flag(user_data).store(false, Ordering::SeqCst);
        true
    }

    extern "C" fn serial_number(_: *mut c_void) -> u32 {
        5439488
    }

    /// Answers with the INS of the command followed by `90 00`, from another thread.
    extern "C" fn execute(
        _: *mut c_void,
        command: *const u8,
        command_len: usize,
        completion: CompletionCallback,
        token: *mut c_void,
    ) {
        let command = unsafe { slice::from_raw_parts(command, command_len) }.to_vec();
        let token = token as usize;

        std::thread::spawn(move || {
            let response = [command[1], 0x90, 0x00];
            completion(token as *mut c_void, response.as_ptr(), response.len(), true);
        });
    }

    extern "C" fn execute_failing(
        _: *mut c_void,
        _: *const u8,
        _: usize,
        completion: CompletionCallback,
        token: *mut c_void,
    ) {
        completion(token, ptr::null(), 0, false);
    }

    fn delegate(open_flag: &'static AtomicBool) -> SessionDelegate {
        SessionDelegate {
            user_data: open_flag as *const AtomicBool as *mut c_void,
            is_present: present,
            is_open,
            open,
            close,
            serial_number,
            execute,
        }
    }

    #[test]
    fn test_copy_to_buffer() {
        let src = [0x01, 0x02, 0x03];

        unsafe {
            let mut len: Dword = 0;
            assert_eq!(Ok(()), copy_to_buffer(&src, null_mut(), &mut len));
            assert_eq!(3, len);

            let mut buf = [0u8; 2];
            let mut len = buf.len() as Dword;
            assert_eq!(
                Err(Status::InsufficientBuffer),
                copy_to_buffer(&src, buf.as_mut_ptr(), &mut len)
            );
            assert_eq!(3, len);

            let mut buf = [0u8; 8];
            let mut len = buf.len() as Dword;
            assert_eq!(Ok(()), copy_to_buffer(&src, buf.as_mut_ptr(), &mut len));
            assert_eq!(&src, &buf[..len as usize]);

            assert_eq!(
                Err(Status::InvalidParameter),
                copy_to_buffer(&src, buf.as_mut_ptr(), null_mut())
            );
        }
    }

    #[test]
    fn test_reader_state_layout() {
        let pointers = 2 * mem::size_of::<*const c_void>();
        assert_eq!(
            pointers + 3 * mem::size_of::<Dword>(),
            mem::offset_of!(ReaderStateFfi, atr)
        );

        #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
        assert_eq!(8, mem::size_of::<Dword>());

        #[cfg(target_os = "macos")]
        assert_eq!(pointers + 12 + MAX_ATR_SIZE, mem::size_of::<ReaderStateFfi>());
    }

    #[test]
    fn test_multi_string() {
        assert_eq!(b"Yubico YubiKey\0\0".to_vec(), multi_string(&[READER_NAME]));
        assert_eq!(vec![0], multi_string(&[]));
    }

    #[test]
    fn test_session_over_delegate() {
        let session = FfiSession {
            delegate: delegate(&SESSION_OPEN),
        };
        let layer = PcscLayer::new(session);

        assert_eq!(Status::Success, layer.connect_card());
        assert_eq!(Some("5439488".to_string()), layer.get_card_serial());
        assert_eq!(Ok(vec![0xCA, 0x90, 0x00]), layer.transmit(&[0x00, 0xCA, 0x00, 0x00]));
        assert_eq!(Status::Success, layer.disconnect_card());
    }

    #[test]
    fn test_failed_execution() {
        let session = FfiSession {
            delegate: SessionDelegate {
                is_open: present,
                execute: execute_failing,
                ..delegate(&SESSION_OPEN)
            },
        };
        let layer = PcscLayer::new(session);

        assert_eq!(
            Err(Status::WaitedTooLong),
            layer.transmit(&[0x00, 0xCA, 0x00, 0x00])
        );
    }

    #[test]
    fn test_exported_functions() {
        assert!(ykpcsc_init(delegate(&EXPORTED_OPEN)));
        assert!(!ykpcsc_init(delegate(&EXPORTED_OPEN)));

        unsafe {
            let mut context = 0;
            assert_eq!(0, ykpcsc_establish_context(0, &mut context));
            assert_eq!(0, ykpcsc_is_valid_context(context));

            let mut len: Dword = 0;
            assert_eq!(0, ykpcsc_list_readers(context, null_mut(), &mut len));
            let mut readers = vec![0 as c_char; len as usize];
            assert_eq!(0, ykpcsc_list_readers(context, readers.as_mut_ptr(), &mut len));

            let mut card = 0;
            let mut protocol: Dword = 0;
            assert_eq!(
                0,
                ykpcsc_connect(context, readers.as_ptr(), 0, 0, &mut card, &mut protocol)
            );
            assert_eq!(0x0002, protocol);
            assert_eq!(context, ykpcsc_context_for_card(card));

            let command = [0x00, 0xA4, 0x04, 0x00];
            let mut response = [0u8; 16];
            let mut response_len = response.len() as Dword;
            assert_eq!(
                0,
                ykpcsc_transmit(
                    card,
                    command.as_ptr(),
                    command.len() as Dword,
                    response.as_mut_ptr(),
                    &mut response_len,
                )
            );
            assert_eq!(&[0xA4, 0x90, 0x00], &response[..response_len as usize]);

            let mut state: Dword = 0;
            let mut atr = [0u8; MAX_ATR_SIZE];
            let mut atr_len = atr.len() as Dword;
            assert_eq!(
                0,
                ykpcsc_status(
                    card,
                    null_mut(),
                    null_mut(),
                    &mut state,
                    null_mut(),
                    atr.as_mut_ptr(),
                    &mut atr_len,
                )
            );
            assert_eq!(0x0040, state);
            assert_eq!(ykpcsc::ATR.len(), atr_len as usize);

            assert_eq!(0, ykpcsc_disconnect(card, 0));
            assert_eq!(0, ykpcsc_context_for_card(card));
            assert_eq!(
                Status::InvalidHandle.code(),
                ykpcsc_transmit(card, command.as_ptr(), 4, response.as_mut_ptr(), &mut response_len)
            );

            assert_eq!(0, ykpcsc_release_context(context));
            assert_eq!(Status::InvalidHandle.code(), ykpcsc_is_valid_context(context));

            let message = ykpcsc_stringify_error(Status::InvalidHandle.code());
            assert_eq!(
                Status::InvalidHandle.message(),
                CStr::from_ptr(message).to_str().unwrap()
            );
            ykpcsc_free_string(message);
            assert!(ykpcsc_stringify_error(1).is_null());
        }
    }
}
