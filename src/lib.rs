//! ICAO Doc 9303 Basic Access Control and secure messaging.
//!
//! The `mrtd_bac` crate implements the symmetric access protocol of
//! eMRTDs (Electronic Machine Readable Travel Documents) for **both** roles:
//!
//! * the terminal (reader) side, which derives the document keys from the
//!   MRZ, authenticates against a chip and then talks to it through a secure
//!   messaging channel, and
//! * the chip side, a small command processor that answers GET CHALLENGE,
//!   MUTUAL AUTHENTICATE, SELECT, READ BINARY, UPDATE BINARY and CREATE FILE
//!   on top of a bounded file store.
//!
//! Both sides share the same building blocks: the BER-TLV codec in [`tlv`],
//! key derivation in [`kdf`], the [`CipherSuite`] abstraction in [`crypto`],
//! the handshake in [`bac`] and the [`SecureChannel`] in
//! [`secure_messaging`].
//!
//! **NOTE:**
//! Please note that this crate is provided 'as is' and is not considered production-ready. Use at your own risk.
//!
//! PACE, EAC, Active Authentication and Passive Authentication are **not**
//! supported.
//!
//! Enable the `pcsc` feature to talk to real readers through
//! [`pcsc`](https://docs.rs/pcsc/latest/pcsc/).
//!
//! # Quick Start
//!
//! ```
//! use mrtd_bac::{
//!     BacError, BacReader, MemoryFileStore, PassportApplet, StaticKeys, EF_COM,
//! };
//!
//! fn main() -> Result<(), BacError> {
//!     let keys = StaticKeys::from_mrz("L898902C<", "690806", "940623")?;
//!
//!     // Personalise an in-memory chip, then lock it.
//!     let mut chip = PassportApplet::new(MemoryFileStore::lds(), keys.clone());
//!     chip.personalize(EF_COM, &hex_literal::hex!("60145F0104303130365F36063034303030305C026175"))?;
//!     chip.lock();
//!
//!     // Talk to it as a terminal would.
//!     let mut reader = BacReader::new(chip);
//!     reader.select_emrtd_application()?;
//!     reader.establish_bac_session_keys(&keys)?;
//!     reader.select_ef(EF_COM, "EF.COM", true)?;
//!     let ef_com = reader.read_data_from_ef(true)?;
//!     assert_eq!(ef_com[0], 0x60);
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

use core::fmt;
use std::num::TryFromIntError;

pub mod apdu;
pub mod bac;
pub mod card;
pub mod crypto;
pub mod file_store;
pub mod kdf;
pub mod secure_messaging;
pub mod session;
pub mod tlv;
pub mod transport;

pub use apdu::{CommandApdu, ResponseApdu, StatusWord};
pub use bac::{AuthState, ChipAuthenticator, TerminalHandshake};
pub use card::PassportApplet;
pub use crypto::{bytes2hex, CipherSuite, DesEcbSuite, Tdes};
pub use file_store::{FileStore, MemoryFileStore, EF_COM, EF_DG1, EF_DG2, EF_SOD, EMRTD_AID};
pub use kdf::{
    calculate_check_digit, compute_key_seed, derive_key, mrz_key_info, BacSeed, DerivedKey,
    KeyType, SessionKeys, StaticKeys,
};
pub use secure_messaging::SecureChannel;
pub use session::{BacReader, SharedReader};
pub use transport::{wait_for_card, CardPresence, PollConfig, Transport};
#[cfg(feature = "pcsc")]
pub use transport::PcscReader;

#[derive(Debug)]
#[non_exhaustive]
pub enum BacError {
    RecvApduError(u8, u8),
    ParseMrzCharError(char),
    ParseMrzFieldError(&'static str, String),
    ParseTlvDataError(usize, usize),
    ParseTlvTagError(String),
    IndefiniteLengthError(),
    TlvNestingError(usize),
    InvalidMacKeyError(usize, usize),
    ParseDataError(String),
    InvalidArgument(&'static str),
    AuthenticationFailed(),
    VerifyMacError(),
    InvalidPaddingError(),
    InvalidResponseError(),
    OverflowSscError(),
    SessionClosedError(),
    StateError(&'static str),
    FileNotFound(u16),
    FileExists(u16),
    FileOutOfBounds(u16, usize, usize),
    CalculateHashError(&'static str),
    CommunicationError(String),
    #[cfg(feature = "pcsc")]
    PcscError(pcsc::Error),
    UnpadError(cipher::block_padding::UnpadError),
    IntCastError(TryFromIntError),
}

impl fmt::Display for BacError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::RecvApduError(ref sw1, ref sw2) => write!(
                f,
                "APDU command failed with status code: {sw1:02X} {sw2:02X}"
            ),
            Self::ParseMrzCharError(ref c) => {
                write!(f, "MRZ can not contain the character: {c}")
            }
            Self::ParseMrzFieldError(mrz_field, ref value) => {
                write!(f, "MRZ field {mrz_field} is invalid: {value}")
            }
            Self::ParseTlvDataError(ref e_len, ref f_len) => write!(
                f,
                "TLV data is incomplete, expected len: {e_len}, found len: {f_len}"
            ),
            Self::ParseTlvTagError(ref error) => write!(f, "Invalid TLV tag: {error}"),
            Self::IndefiniteLengthError() => {
                write!(f, "Indefinite length TLV objects are not supported")
            }
            Self::TlvNestingError(ref depth) => {
                write!(f, "TLV objects are nested deeper than {depth} levels")
            }
            Self::InvalidMacKeyError(ref e_len, ref f_len) => write!(
                f,
                "Invalid MAC key, expected len: {e_len}, found len: {f_len}"
            ),
            Self::ParseDataError(ref error) => write!(f, "Invalid data: {error}"),
            Self::InvalidArgument(error_msg) => write!(f, "Invalid argument: {error_msg}"),
            Self::AuthenticationFailed() => write!(f, "Authentication failed"),
            Self::VerifyMacError() => {
                write!(f, "Secure messaging MAC is not correct")
            }
            Self::InvalidPaddingError() => write!(f, "Decrypted data has invalid padding"),
            Self::InvalidResponseError() => {
                write!(f, "Card response is invalid")
            }
            Self::OverflowSscError() => write!(f, "SSC overflew error"),
            Self::SessionClosedError() => {
                write!(f, "Secure messaging session is closed")
            }
            Self::StateError(error_msg) => write!(f, "Command not allowed: {error_msg}"),
            Self::FileNotFound(ref fid) => write!(f, "File {fid:04X} not found"),
            Self::FileExists(ref fid) => write!(f, "File {fid:04X} already exists"),
            Self::FileOutOfBounds(ref fid, ref end, ref size) => write!(
                f,
                "Access to file {fid:04X} ends at {end}, beyond its size {size}"
            ),
            Self::CalculateHashError(error_msg) => {
                write!(f, "Failure during calculation of hashes: {error_msg}")
            }
            Self::CommunicationError(ref error) => write!(f, "Communication failure: {error}"),
            #[cfg(feature = "pcsc")]
            Self::PcscError(ref e) => fmt::Display::fmt(&e, f),
            Self::UnpadError(ref e) => fmt::Display::fmt(&e, f),
            Self::IntCastError(ref e) => fmt::Display::fmt(&e, f),
        }
    }
}

impl std::error::Error for BacError {}

/// Broad category of a [`BacError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input detected locally: bad MRZ fields, malformed TLV,
    /// out of bounds file access.
    InputContract,
    /// The handshake did not authenticate the other party.
    Authentication,
    /// A secure messaging object failed verification; the session is gone.
    Integrity,
    /// The transport failed or the other party answered something unusable.
    Communication,
    /// The command is not allowed in the current state.
    State,
}

impl BacError {
    /// Classifies the error.
    ///
    /// # Example
    ///
    /// ```
    /// use mrtd_bac::{BacError, ErrorKind};
    ///
    /// assert_eq!(BacError::AuthenticationFailed().kind(), ErrorKind::Authentication);
    /// assert_eq!(BacError::VerifyMacError().kind(), ErrorKind::Integrity);
    /// ```
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match *self {
            Self::AuthenticationFailed() => ErrorKind::Authentication,
            Self::VerifyMacError()
            | Self::InvalidPaddingError()
            | Self::UnpadError(_)
            | Self::OverflowSscError() => ErrorKind::Integrity,
            Self::RecvApduError(..) | Self::InvalidResponseError() | Self::CommunicationError(_) => {
                ErrorKind::Communication
            }
            #[cfg(feature = "pcsc")]
            Self::PcscError(_) => ErrorKind::Communication,
            Self::SessionClosedError() | Self::StateError(_) => ErrorKind::State,
            Self::ParseMrzCharError(_)
            | Self::ParseMrzFieldError(..)
            | Self::ParseTlvDataError(..)
            | Self::ParseTlvTagError(_)
            | Self::IndefiniteLengthError()
            | Self::TlvNestingError(_)
            | Self::InvalidMacKeyError(..)
            | Self::ParseDataError(_)
            | Self::InvalidArgument(_)
            | Self::FileNotFound(_)
            | Self::FileExists(_)
            | Self::FileOutOfBounds(..)
            | Self::CalculateHashError(_)
            | Self::IntCastError(_) => ErrorKind::InputContract,
        }
    }
}
