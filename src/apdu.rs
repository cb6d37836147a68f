//! Short command and response APDUs (ISO/IEC 7816-4).

use core::fmt;
use tracing::error;

use crate::BacError;

pub const CLA_PLAIN: u8 = 0x00;
/// Class bits marking a command as protected by secure messaging.
pub const CLA_PROTECTED: u8 = 0x0C;

pub const INS_MUTUAL_AUTHENTICATE: u8 = 0x82;
pub const INS_GET_CHALLENGE: u8 = 0x84;
pub const INS_SELECT_FILE: u8 = 0xA4;
pub const INS_READ_BINARY: u8 = 0xB0;
pub const INS_UPDATE_BINARY: u8 = 0xD6;
pub const INS_CREATE_FILE: u8 = 0xE0;

/// Status word `SW1 SW2` of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: Self = Self(0x9000);
    /// Returned for every failed MUTUAL AUTHENTICATE, whatever the cause.
    pub const AUTHENTICATION_FAILED: Self = Self(0x6300);
    pub const WRONG_LENGTH: Self = Self(0x6700);
    pub const SECURITY_STATUS_NOT_SATISFIED: Self = Self(0x6982);
    pub const DATA_INVALID: Self = Self(0x6984);
    pub const CONDITIONS_NOT_SATISFIED: Self = Self(0x6985);
    pub const COMMAND_NOT_ALLOWED: Self = Self(0x6986);
    pub const SM_DATA_OBJECTS_INCORRECT: Self = Self(0x6988);
    pub const FILE_NOT_FOUND: Self = Self(0x6A82);
    pub const INCORRECT_P1P2: Self = Self(0x6A86);
    pub const FILE_EXISTS: Self = Self(0x6A89);
    pub const WRONG_P1P2: Self = Self(0x6B00);
    pub const INS_NOT_SUPPORTED: Self = Self(0x6D00);
    pub const CLA_NOT_SUPPORTED: Self = Self(0x6E00);
    pub const UNKNOWN: Self = Self(0x6F00);

    #[must_use]
    pub const fn from_bytes(sw1: u8, sw2: u8) -> Self {
        Self(u16::from_be_bytes([sw1, sw2]))
    }

    #[must_use]
    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub const fn sw1(self) -> u8 {
        self.to_bytes()[0]
    }

    #[must_use]
    pub const fn sw2(self) -> u8 {
        self.to_bytes()[1]
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// A short command APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandApdu {
    /// Class byte of the APDU
    cla: u8,
    /// Instruction byte of the APDU
    ins: u8,
    /// Parameter 1 byte of the APDU
    p1: u8,
    /// Parameter 2 byte of the APDU
    p2: u8,
    /// Command data field, never empty when present
    data: Option<Vec<u8>>,
    /// Le byte as encoded, `0x00` meaning 256
    le: Option<u8>,
}

impl CommandApdu {
    /// Constructs a new APDU. Empty command data is treated as absent.
    ///
    /// # Example
    ///
    /// ```
    /// use hex_literal::hex;
    /// use mrtd_bac::CommandApdu;
    ///
    /// let apdu = CommandApdu::new(0x00, 0x84, 0x00, 0x00, None, Some(0x08));
    /// assert_eq!(apdu.header(), hex!("00840000"));
    /// ```
    #[must_use]
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Option<Vec<u8>>, le: Option<u8>) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: data.filter(|data| !data.is_empty()),
            le,
        }
    }

    #[must_use]
    pub fn cla(&self) -> u8 {
        self.cla
    }

    #[must_use]
    pub fn ins(&self) -> u8 {
        self.ins
    }

    #[must_use]
    pub fn p1(&self) -> u8 {
        self.p1
    }

    #[must_use]
    pub fn p2(&self) -> u8 {
        self.p2
    }

    /// Command data, empty if absent.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Le byte as encoded.
    #[must_use]
    pub fn le(&self) -> Option<u8> {
        self.le
    }

    /// Number of response bytes the Le field asks for.
    #[must_use]
    pub fn expected_length(&self) -> Option<usize> {
        self.le.map(|le| if le == 0 { 256 } else { usize::from(le) })
    }

    /// The four header bytes `CLA INS P1 P2`.
    #[must_use]
    pub fn header(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    #[must_use]
    pub fn is_protected(&self) -> bool {
        self.cla & CLA_PROTECTED == CLA_PROTECTED
    }

    /// Serialises the APDU.
    ///
    /// # Errors
    ///
    /// * `BacError` if the command data does not fit a short APDU.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BacError> {
        let mut apdu_bytes = self.header().to_vec();
        if let Some(ref data) = self.data {
            apdu_bytes.push(u8::try_from(data.len()).map_err(BacError::IntCastError)?);
            apdu_bytes.extend_from_slice(data);
        }
        if let Some(le) = self.le {
            apdu_bytes.push(le);
        }
        Ok(apdu_bytes)
    }

    /// Parses a short APDU of case 1, 2, 3 or 4.
    ///
    /// # Errors
    ///
    /// * `BacError` if the bytes do not form a short APDU.
    ///
    /// # Example
    ///
    /// ```
    /// # use mrtd_bac::BacError;
    /// #
    /// # fn main() -> Result<(), BacError> {
    /// use hex_literal::hex;
    /// use mrtd_bac::CommandApdu;
    ///
    /// let apdu = CommandApdu::from_bytes(&hex!("00A4020C02011E"))?;
    /// assert_eq!(apdu.data(), hex!("011E"));
    /// assert_eq!(apdu.le(), None);
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BacError> {
        let (header, body) = match bytes {
            [cla, ins, p1, p2, body @ ..] => ([*cla, *ins, *p1, *p2], body),
            _ => {
                error!("Command APDU must have at least 4 bytes, found {}", bytes.len());
                return Err(BacError::ParseDataError(format!(
                    "command APDU must have at least 4 bytes, found {}",
                    bytes.len()
                )));
            }
        };
        let [cla, ins, p1, p2] = header;

        let (data, le) = match body {
            [] => (None, None),
            [le] => (None, Some(*le)),
            [0x00, ..] => {
                error!("Extended length command APDUs are not supported");
                return Err(BacError::ParseDataError(
                    "extended length command APDUs are not supported".to_owned(),
                ));
            }
            [lc, rest @ ..] if rest.len() == usize::from(*lc) => (Some(rest.to_vec()), None),
            [lc, rest @ ..] if rest.len() == usize::from(*lc) + 1 => {
                let (data, le) = rest.split_at(usize::from(*lc));
                (Some(data.to_vec()), Some(le[0]))
            }
            [lc, rest @ ..] => {
                error!("Lc is {lc} but {} bytes follow it", rest.len());
                return Err(BacError::ParseDataError(format!(
                    "Lc is {lc} but {} bytes follow it",
                    rest.len()
                )));
            }
        };

        Ok(Self::new(cla, ins, p1, p2, data, le))
    }
}

/// A response APDU: data followed by a status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    pub data: Vec<u8>,
    pub sw: StatusWord,
}

impl ResponseApdu {
    #[must_use]
    pub fn new(data: Vec<u8>, sw: StatusWord) -> Self {
        Self { data, sw }
    }

    /// A response carrying only a status word.
    #[must_use]
    pub fn status(sw: StatusWord) -> Self {
        Self {
            data: Vec::new(),
            sw,
        }
    }

    /// Splits the trailing status word off a response.
    ///
    /// # Errors
    ///
    /// * `BacError::InvalidResponseError` if fewer than two bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BacError> {
        let [data @ .., sw1, sw2] = bytes else {
            error!(
                "Card response length should be greater than or equal to 2, found {}",
                bytes.len()
            );
            return Err(BacError::InvalidResponseError());
        };
        Ok(Self {
            data: data.to_vec(),
            sw: StatusWord::from_bytes(*sw1, *sw2),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.data.clone();
        bytes.extend_from_slice(&self.sw.to_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_command_apdu_cases() -> Result<(), BacError> {
        let case1 = CommandApdu::from_bytes(&hex!("00A40000"))?;
        assert_eq!((case1.has_data(), case1.le()), (false, None));

        let case2 = CommandApdu::from_bytes(&hex!("0084000008"))?;
        assert_eq!(case2.le(), Some(8));
        assert_eq!(case2.expected_length(), Some(8));

        let case3 = CommandApdu::from_bytes(&hex!("00A4020C02011E"))?;
        assert_eq!(case3.data(), hex!("011E"));
        assert_eq!(case3.le(), None);

        let case4 = CommandApdu::from_bytes(&hex!("00A4040C07A000000247100100"))?;
        assert_eq!(case4.data(), hex!("A0000002471001"));
        assert_eq!(case4.expected_length(), Some(256));

        for apdu in [case1, case2, case3, case4] {
            assert_eq!(CommandApdu::from_bytes(&apdu.to_bytes()?)?, apdu);
        }
        Ok(())
    }

    #[test]
    fn test_command_apdu_invalid() {
        for bad in [
            &hex!("00A400")[..],
            &hex!("00A4020C03011E")[..],
            &hex!("00A4020C02011E0000")[..],
            &hex!("00B000000000FF")[..],
        ] {
            assert!(CommandApdu::from_bytes(bad).is_err_and(|e| matches!(e, BacError::ParseDataError(_))));
        }

        let too_long = CommandApdu::new(0x00, 0xD6, 0x00, 0x00, Some(vec![0; 256]), None);
        assert!(too_long.to_bytes().is_err_and(|e| matches!(e, BacError::IntCastError(_))));
    }

    #[test]
    fn test_command_apdu_fields() -> Result<(), BacError> {
        let apdu = CommandApdu::new(0x0C, 0xB0, 0x01, 0x02, Some(vec![]), Some(0x04));
        assert!(apdu.is_protected());
        assert!(!apdu.has_data());
        assert_eq!(apdu.header(), hex!("0CB00102"));
        assert_eq!(apdu.to_bytes()?, hex!("0CB0010204"));
        Ok(())
    }

    #[test]
    fn test_response_apdu() -> Result<(), BacError> {
        let response = ResponseApdu::from_bytes(&hex!("4608F91988702212 9000"))?;
        assert_eq!(response.data, hex!("4608F91988702212"));
        assert!(response.sw.is_success());
        assert_eq!(response.to_bytes(), hex!("4608F91988702212 9000"));

        let response = ResponseApdu::from_bytes(&hex!("6A82"))?;
        assert!(response.data.is_empty());
        assert_eq!(response.sw, StatusWord::FILE_NOT_FOUND);
        assert_eq!((response.sw.sw1(), response.sw.sw2()), (0x6A, 0x82));
        assert_eq!(response.sw.to_string(), "6A82");

        assert!(ResponseApdu::from_bytes(&hex!("90")).is_err_and(|e| matches!(e, BacError::InvalidResponseError())));
        Ok(())
    }
}
