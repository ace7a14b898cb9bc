//! ISO 7816-4 command and response APDUs.
//!
//! The layer only needs to tell a well-formed command apart from garbage before handing it to
//! the key session, and to peek at the status word of a response for logging.

/// Errors that occur while parsing a command APDU.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("APDU too short: expected at least 4 octets, got {0}")]
    TooShort(usize),

    #[error("Lc of {lc} does not match the {body} octets following the header")]
    LengthMismatch { lc: usize, body: usize },

    #[error("Invalid extended APDU format")]
    InvalidExtendedFormat,
}

/// An APDU command to be transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    payload: Vec<u8>,
    le: Option<u32>,
    extended: bool,
}

impl Command {
    /// Constructs a command with CLA, INS, P1, and P2.
    /// No payloads will be transmitted or received.
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            payload: Vec::new(),
            le: None,
            extended: false,
        }
    }

    /// Constructs a command with CLA, INS, P1, P2, and a payload.
    pub fn new_with_payload(cla: u8, ins: u8, p1: u8, p2: u8, payload: Vec<u8>) -> Self {
        Self {
            extended: payload.len() > 0xFF,
            payload,
            ..Self::new(cla, ins, p1, p2)
        }
    }

    /// Sets the maximum number of octets expected in the response (Ne).
    /// `0x100` and `0x10000` are the "as many as available" values of short and extended Le.
    pub fn with_le(mut self, le: u32) -> Self {
        self.extended |= le > 0x100;
        self.le = Some(le);
        self
    }

    /// Parses a command APDU, accepting all four cases in short and extended form.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let (header, body) = match bytes.len() {
            0..=3 => return Err(Error::TooShort(bytes.len())),
            _ => bytes.split_at(4),
        };

        let mut command = Self::new(header[0], header[1], header[2], header[3]);

        match body {
            // Case 1
            [] => {}

            // Case 2S
            [le] => command.le = Some(short_le(*le)),

            // Case 2E, 3E, 4E
            [0x00, rest @ ..] if rest.len() >= 2 => {
                command.extended = true;

                let lc = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                let rest = &rest[2..];

                if rest.is_empty() {
                    command.le = Some(extended_le(lc));
                } else if lc == 0 {
                    return Err(Error::InvalidExtendedFormat);
                } else if rest.len() == lc {
                    command.payload = rest.to_vec();
                } else if rest.len() == lc + 2 {
                    let (payload, le) = rest.split_at(lc);
                    command.payload = payload.to_vec();
                    command.le = Some(extended_le(u16::from_be_bytes([le[0], le[1]]) as usize));
                } else {
                    return Err(Error::LengthMismatch {
                        lc,
                        body: rest.len(),
                    });
                }
            }

            // Case 3S, 4S
            [lc, rest @ ..] => {
                let lc = *lc as usize;

                if lc == 0 {
                    return Err(Error::InvalidExtendedFormat);
                } else if rest.len() == lc {
                    command.payload = rest.to_vec();
                } else if rest.len() == lc + 1 {
                    command.payload = rest[..lc].to_vec();
                    command.le = Some(short_le(rest[lc]));
                } else {
                    return Err(Error::LengthMismatch {
                        lc,
                        body: rest.len(),
                    });
                }
            }
        }

        Ok(command)
    }

    pub fn cla(&self) -> u8 {
        self.cla
    }

    pub fn ins(&self) -> u8 {
        self.ins
    }

    pub fn p1(&self) -> u8 {
        self.p1
    }

    pub fn p2(&self) -> u8 {
        self.p2
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn le(&self) -> Option<u32> {
        self.le
    }

    /// Converts the command into octets.
    pub fn into_bytes(self) -> Vec<u8> {
        let Self {
            cla,
            ins,
            p1,
            p2,
            mut payload,
            le,
            extended,
        } = self;

        let mut buffer: Vec<u8> = vec![cla, ins, p1, p2];

        if extended {
            if !payload.is_empty() {
                buffer.push(0x00);
                buffer.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                buffer.append(&mut payload);
            }

            if let Some(l) = le {
                if buffer.len() == 4 {
                    buffer.push(0x00);
                }
                buffer.extend_from_slice(&((l & 0xFFFF) as u16).to_be_bytes());
            }
        } else {
            if !payload.is_empty() {
                buffer.push(payload.len() as u8);
                buffer.append(&mut payload);
            }

            if let Some(l) = le {
                buffer.push((l & 0xFF) as u8);
            }
        }

        buffer
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(bytes)
    }
}

impl From<Command> for Vec<u8> {
    fn from(command: Command) -> Self {
        command.into_bytes()
    }
}

fn short_le(le: u8) -> u32 {
    match le {
        0 => 0x100,
        l => l as u32,
    }
}

fn extended_le(le: usize) -> u32 {
    match le {
        0 => 0x10000,
        l => l as u32,
    }
}

/// A response that was received from the card.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Response {
    payload: Vec<u8>,
    trailer: (u8, u8),
}

impl Response {
    /// Parses a response from the octets.
    /// A response shorter than a status word gets a `0x0000` trailer.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match bytes {
            [payload @ .., sw1, sw2] => Self {
                payload: payload.to_vec(),
                trailer: (*sw1, *sw2),
            },
            _ => Self {
                payload: bytes.to_vec(),
                trailer: (0x00, 0x00),
            },
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The status word, SW1 in the high octet.
    pub fn status_word(&self) -> u16 {
        u16::from_be_bytes([self.trailer.0, self.trailer.1])
    }

    /// Determines whether the response indicates success or not.
    pub fn is_ok(&self) -> bool {
        matches!(self.trailer, (0x90, 0x00) | (0x91, 0x00))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_only() {
        let command = Command::parse(&[0x00, 0xA4, 0x04, 0x00]).unwrap();

        assert_eq!(0xA4, command.ins());
        assert!(command.payload().is_empty());
        assert_eq!(None, command.le());
    }

    #[test]
    fn test_parse_short_forms() {
        let select = [0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x05, 0x27, 0x20, 0x01];
        let command = Command::parse(&select).unwrap();
        assert_eq!(&select[5..], command.payload());
        assert_eq!(None, command.le());

        let command = Command::parse(&[0x00, 0xCA, 0x00, 0x6E, 0x00]).unwrap();
        assert_eq!(Some(0x100), command.le());

        let command = Command::parse(&[0x00, 0x87, 0x07, 0x9B, 0x02, 0x7C, 0x00, 0x10]).unwrap();
        assert_eq!(&[0x7C, 0x00], command.payload());
        assert_eq!(Some(0x10), command.le());
    }

    #[test]
    fn test_parse_extended_forms() {
        let command = Command::parse(&[0x00, 0xB0, 0x00, 0x00, 0x00, 0x01, 0x00]).unwrap();
        assert_eq!(Some(0x100), command.le());

        let mut bytes = vec![0x00, 0xDB, 0x3F, 0xFF, 0x00, 0x01, 0x2C];
        bytes.extend(std::iter::repeat(0xAB).take(300));
        bytes.extend([0x00, 0x00]);

        let command = Command::parse(&bytes).unwrap();
        assert_eq!(300, command.payload().len());
        assert_eq!(Some(0x10000), command.le());
        assert_eq!(bytes, command.into_bytes());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(Err(Error::TooShort(0)), Command::parse(&[]));
        assert_eq!(Err(Error::TooShort(3)), Command::parse(&[0x00, 0xA4, 0x04]));
        assert_eq!(
            Err(Error::LengthMismatch { lc: 5, body: 2 }),
            Command::parse(&[0x00, 0xA4, 0x04, 0x00, 0x05, 0x01, 0x02]),
        );
        assert_eq!(
            Err(Error::InvalidExtendedFormat),
            Command::parse(&[0x00, 0xA4, 0x04, 0x00, 0x00, 0x00, 0x00, 0x01]),
        );
    }

    #[test]
    fn test_into_bytes_short() {
        let command = Command::new_with_payload(0x00, 0x01, 0x10, 0x00, vec![]).with_le(0x100);

        assert_eq!(vec![0x00, 0x01, 0x10, 0x00, 0x00], Vec::from(command));
    }

    #[test]
    fn test_response_trailer() {
        let response = Response::from_bytes(&[0x00, 0x9A, 0x3C, 0x21, 0x90, 0x00]);
        assert!(response.is_ok());
        assert_eq!(&[0x00, 0x9A, 0x3C, 0x21], response.payload());

        let response = Response::from_bytes(&[0x6A, 0x82]);
        assert!(!response.is_ok());
        assert_eq!(0x6A82, response.status_word());
    }
}
