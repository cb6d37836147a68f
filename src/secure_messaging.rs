//! Secure messaging for BAC sessions, ICAO Doc 9303-11 Section 9.8.
//!
//! A [`SecureChannel`] is created by a successful handshake (see
//! [`crate::bac`]) and is used by both parties: the terminal wraps commands
//! and unwraps responses, the chip unwraps commands and wraps responses.
//! Every wrap and unwrap increments the Send Sequence Counter first, so
//! both sides stay in lockstep as long as every message is processed.
//!
//! Any failure closes the channel for good. There is no resynchronisation;
//! a fresh handshake is required.

use tracing::{error, trace};
use zeroize::Zeroize;

use crate::apdu::{CommandApdu, ResponseApdu, StatusWord, CLA_PROTECTED};
use crate::crypto::{bytes2hex, padding_method_2, remove_padding, CipherSuite, Tdes, MAC_SIZE};
use crate::kdf::SessionKeys;
use crate::tlv::{split_object, Tag, Tlv, TlvRef};
use crate::BacError;

/// Padding indicator prefixed to the cryptogram in DO87.
const PADDING_INDICATOR: u8 = 0x01;

/// Session keys plus SSC, shared by the terminal and chip directions.
pub struct SecureChannel<S: CipherSuite = Tdes> {
    suite: S,
    /// Dropped, and thereby zeroized, when the channel closes.
    keys: Option<SessionKeys>,
    ssc: u64,
}

/// Data objects found in a protected command or response.
#[derive(Default)]
struct DataObjects<'a> {
    /// DO87 or DO85.
    cryptogram: Option<TlvRef<'a>>,
    le: Option<TlvRef<'a>>,
    status: Option<TlvRef<'a>>,
    mac: Option<TlvRef<'a>>,
}

impl<'a> DataObjects<'a> {
    fn parse(mut data: &'a [u8], allowed: &[Tag]) -> Result<Self, BacError> {
        let mut objects = Self::default();
        while !data.is_empty() {
            if objects.mac.is_some() {
                error!("Data found after DO8E in secure messaging data");
                return Err(BacError::ParseDataError(
                    "data found after DO8E in secure messaging data".to_owned(),
                ));
            }

            let (object, rest) = split_object(data)?;
            let slot = match object.tag {
                tag if !allowed.contains(&tag) => None,
                Tag::SM_ENCRYPTED | Tag::SM_ENCRYPTED_ODD => Some(&mut objects.cryptogram),
                Tag::SM_LE => Some(&mut objects.le),
                Tag::SM_STATUS => Some(&mut objects.status),
                Tag::SM_MAC => Some(&mut objects.mac),
                _ => None,
            };
            let Some(slot) = slot else {
                error!("Tag {} not supported in secure messaging data", object.tag);
                return Err(BacError::ParseDataError(format!(
                    "tag {} not supported in secure messaging data",
                    object.tag
                )));
            };
            if slot.replace(object).is_some() {
                error!("Duplicate tag {} in secure messaging data", object.tag);
                return Err(BacError::ParseDataError(format!(
                    "duplicate tag {} in secure messaging data",
                    object.tag
                )));
            }
            data = rest;
        }

        if objects.mac.is_none() {
            error!("DO8E is missing from secure messaging data");
            return Err(BacError::VerifyMacError());
        }
        Ok(objects)
    }

    fn mac(&self) -> &'a [u8] {
        self.mac.map(|mac| mac.value).unwrap_or_default()
    }

    fn raw(object: Option<TlvRef<'a>>) -> &'a [u8] {
        object.map(|object| object.raw).unwrap_or_default()
    }
}

impl<S: CipherSuite> SecureChannel<S> {
    /// Opens a channel with the given session keys and initial SSC.
    #[must_use]
    pub fn new(suite: S, keys: SessionKeys, ssc: u64) -> Self {
        Self {
            suite,
            keys: Some(keys),
            ssc,
        }
    }

    /// Current value of the Send Sequence Counter.
    #[must_use]
    pub fn ssc(&self) -> u64 {
        self.ssc
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.keys.is_none()
    }

    /// Closes the channel and zeroizes the session keys and SSC.
    pub fn close(&mut self) {
        self.keys = None;
        self.ssc.zeroize();
    }

    /// Increments the SSC.
    ///
    /// # Errors
    ///
    /// * `BacError::OverflowSscError` if the counter would wrap around.
    fn increment_ssc(&mut self) -> Result<(), BacError> {
        let Some(ssc) = self.ssc.checked_add(1) else {
            error!("SSC overflowed");
            return Err(BacError::OverflowSscError());
        };
        self.ssc = ssc;
        Ok(())
    }

    fn keys(&self) -> Result<&SessionKeys, BacError> {
        self.keys.as_ref().ok_or_else(|| {
            error!("Secure messaging session is already closed");
            BacError::SessionClosedError()
        })
    }

    /// Runs `op`, closing the channel if it fails.
    fn fail_closed<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, BacError>,
    ) -> Result<T, BacError> {
        self.keys()?;
        let result = op(self);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn encrypt_data(&self, data: &[u8]) -> Result<Vec<u8>, BacError> {
        let padded = padding_method_2(data, self.suite.block_size())?;
        self.suite.encrypt(self.keys()?.ks_enc().as_bytes(), &padded)
    }

    fn decrypt_data(&self, cryptogram: &TlvRef<'_>) -> Result<Vec<u8>, BacError> {
        let encrypted = if cryptogram.tag == Tag::SM_ENCRYPTED {
            match cryptogram.value {
                [PADDING_INDICATOR, encrypted @ ..] => encrypted,
                _ => {
                    error!("DO87 does not start with the padding indicator");
                    return Err(BacError::InvalidPaddingError());
                }
            }
        } else {
            cryptogram.value
        };
        let decrypted = self.suite.decrypt(self.keys()?.ks_enc().as_bytes(), encrypted)?;
        Ok(remove_padding(&decrypted)?.to_vec())
    }

    fn compute_mac(&self, parts: &[&[u8]]) -> Result<[u8; MAC_SIZE], BacError> {
        let mac_input = padding_method_2(&parts.concat(), self.suite.block_size())?;
        self.suite.mac(self.keys()?.ks_mac().as_bytes(), &mac_input)
    }

    fn verify_mac(&self, parts: &[&[u8]], mac: &[u8]) -> Result<(), BacError> {
        let mac_input = padding_method_2(&parts.concat(), self.suite.block_size())?;
        if self
            .suite
            .verify_mac(self.keys()?.ks_mac().as_bytes(), &mac_input, mac)?
        {
            return Ok(());
        }
        error!("MAC verification failed");
        Err(BacError::VerifyMacError())
    }

    /// Protects a command APDU.
    ///
    /// Command data travels encrypted in DO87 (even INS, with padding
    /// indicator) or DO85 (odd INS), Le in DO97, and DO8E authenticates the
    /// header and both objects.
    ///
    /// # Returns
    ///
    /// The serialised protected APDU, `header ∥ Lc ∥ DOs ∥ 00`.
    ///
    /// # Errors
    ///
    /// * `BacError` if the channel is closed, the SSC overflows or the
    ///   protected command does not fit a short APDU. The channel is closed
    ///   on any error.
    ///
    /// # Example
    ///
    /// ```
    /// # use mrtd_bac::BacError;
    /// #
    /// # fn main() -> Result<(), BacError> {
    /// use hex_literal::hex;
    /// use mrtd_bac::{CommandApdu, SecureChannel, SessionKeys, Tdes};
    ///
    /// let keys = SessionKeys::from_key_seed(&hex!("0036D272F5C350ACAC50C3F572D23600"))?;
    /// let mut channel = SecureChannel::new(Tdes, keys, 0x8870_2212_0C06_C226);
    /// let select = CommandApdu::new(0x00, 0xA4, 0x02, 0x0C, Some(hex!("011E").to_vec()), None);
    /// assert_eq!(
    ///     channel.wrap_command(&select)?,
    ///     hex!("0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800")
    /// );
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn wrap_command(&mut self, apdu: &CommandApdu) -> Result<Vec<u8>, BacError> {
        self.fail_closed(|channel| {
            channel.increment_ssc()?;

            let mut header = apdu.header();
            header[0] |= CLA_PROTECTED;

            let mut payload = Vec::new();
            if apdu.has_data() {
                let encrypted = channel.encrypt_data(apdu.data())?;
                let cryptogram = if apdu.ins() % 2 == 0 {
                    Tlv::primitive(Tag::SM_ENCRYPTED, [&[PADDING_INDICATOR][..], &encrypted].concat())?
                } else {
                    Tlv::primitive(Tag::SM_ENCRYPTED_ODD, encrypted)?
                };
                payload.extend(cryptogram.encode());
            }
            if let Some(le) = apdu.le() {
                payload.extend(Tlv::primitive(Tag::SM_LE, [le])?.encode());
            }

            let padded_header = padding_method_2(&header, channel.suite.block_size())?;
            let mac = channel.compute_mac(&[&channel.ssc.to_be_bytes()[..], &padded_header, &payload])?;
            payload.extend(Tlv::primitive(Tag::SM_MAC, mac)?.encode());

            let [cla, ins, p1, p2] = header;
            let protected = CommandApdu::new(cla, ins, p1, p2, Some(payload), Some(0x00)).to_bytes()?;
            trace!("Protected APDU: {}", bytes2hex(&protected));
            Ok(protected)
        })
    }

    /// Verifies and decrypts a protected response APDU.
    ///
    /// A DO99 status word takes precedence over the trailing one; they must
    /// agree when both are present.
    ///
    /// # Errors
    ///
    /// * `BacError::RecvApduError` if the card answered with a bare error
    ///   status word, which means the card has dropped the session.
    /// * `BacError::VerifyMacError` if DO8E is missing or wrong. No data is
    ///   returned in that case.
    /// * `BacError` on malformed data objects or padding.
    ///
    /// The channel is closed on any error.
    pub fn unwrap_response(&mut self, response: &[u8]) -> Result<ResponseApdu, BacError> {
        self.fail_closed(|channel| {
            trace!("Protected R_APDU: {}", bytes2hex(response));
            let response = ResponseApdu::from_bytes(response)?;
            if response.data.is_empty() && !response.sw.is_success() {
                error!("Card answered {} without secure messaging", response.sw);
                return Err(BacError::RecvApduError(response.sw.sw1(), response.sw.sw2()));
            }

            channel.increment_ssc()?;
            let objects = DataObjects::parse(
                &response.data,
                &[
                    Tag::SM_ENCRYPTED,
                    Tag::SM_ENCRYPTED_ODD,
                    Tag::SM_STATUS,
                    Tag::SM_MAC,
                ],
            )?;
            channel.verify_mac(
                &[
                    &channel.ssc.to_be_bytes()[..],
                    DataObjects::raw(objects.cryptogram),
                    DataObjects::raw(objects.status),
                ],
                objects.mac(),
            )?;

            let sw = match objects.status {
                Some(TlvRef {
                    value: &[sw1, sw2], ..
                }) => StatusWord::from_bytes(sw1, sw2),
                Some(status) => {
                    error!("DO99 must hold 2 bytes, found {}", status.value.len());
                    return Err(BacError::InvalidResponseError());
                }
                None => response.sw,
            };
            if sw != response.sw {
                error!(
                    "Protected status word {sw} does not match the status word {}",
                    response.sw
                );
                return Err(BacError::InvalidResponseError());
            }

            let data = match objects.cryptogram {
                Some(ref cryptogram) => channel.decrypt_data(cryptogram)?,
                None => Vec::new(),
            };
            Ok(ResponseApdu::new(data, sw))
        })
    }

    /// Verifies and decrypts a protected command APDU on the chip side.
    ///
    /// # Returns
    ///
    /// The plain command with the secure messaging class bits cleared.
    ///
    /// # Errors
    ///
    /// * `BacError::VerifyMacError` if DO8E is missing or wrong.
    /// * `BacError` on malformed data objects or padding.
    ///
    /// The channel is closed on any error.
    pub fn unwrap_command(&mut self, apdu: &CommandApdu) -> Result<CommandApdu, BacError> {
        self.fail_closed(|channel| {
            if !apdu.is_protected() {
                error!("Command {:02X} is not protected", apdu.ins());
                return Err(BacError::InvalidArgument("Command is not protected"));
            }

            channel.increment_ssc()?;
            let cryptogram_tag = if apdu.ins() % 2 == 0 {
                Tag::SM_ENCRYPTED
            } else {
                Tag::SM_ENCRYPTED_ODD
            };
            let objects = DataObjects::parse(apdu.data(), &[cryptogram_tag, Tag::SM_LE, Tag::SM_MAC])?;

            let padded_header = padding_method_2(&apdu.header(), channel.suite.block_size())?;
            channel.verify_mac(
                &[
                    &channel.ssc.to_be_bytes()[..],
                    &padded_header,
                    DataObjects::raw(objects.cryptogram),
                    DataObjects::raw(objects.le),
                ],
                objects.mac(),
            )?;

            let le = match objects.le {
                Some(TlvRef { value: &[le], .. }) => Some(le),
                Some(le) => {
                    error!("DO97 must hold 1 byte, found {}", le.value.len());
                    return Err(BacError::ParseDataError(format!(
                        "DO97 must hold 1 byte, found {}",
                        le.value.len()
                    )));
                }
                None => None,
            };
            let data = match objects.cryptogram {
                Some(ref cryptogram) => Some(channel.decrypt_data(cryptogram)?),
                None => None,
            };

            let command = CommandApdu::new(
                apdu.cla() & !CLA_PROTECTED,
                apdu.ins(),
                apdu.p1(),
                apdu.p2(),
                data,
                le,
            );
            trace!(
                "Unprotected command {:02X}: {}",
                command.ins(),
                bytes2hex(command.data())
            );
            Ok(command)
        })
    }

    /// Protects a response on the chip side: DO87 when there is data,
    /// DO99 always, then DO8E and the status word.
    ///
    /// # Errors
    ///
    /// * `BacError` if the channel is closed or the SSC overflows. The
    ///   channel is closed on any error.
    pub fn wrap_response(&mut self, data: &[u8], sw: StatusWord) -> Result<Vec<u8>, BacError> {
        self.fail_closed(|channel| {
            channel.increment_ssc()?;

            let mut payload = Vec::new();
            if !data.is_empty() {
                let encrypted = channel.encrypt_data(data)?;
                payload.extend(
                    Tlv::primitive(Tag::SM_ENCRYPTED, [&[PADDING_INDICATOR][..], &encrypted].concat())?
                        .encode(),
                );
            }
            payload.extend(Tlv::primitive(Tag::SM_STATUS, sw.to_bytes())?.encode());

            let mac = channel.compute_mac(&[&channel.ssc.to_be_bytes()[..], &payload])?;
            payload.extend(Tlv::primitive(Tag::SM_MAC, mac)?.encode());
            payload.extend(sw.to_bytes());

            trace!("Protected R_APDU: {}", bytes2hex(&payload));
            Ok(payload)
        })
    }
}

impl<S: CipherSuite> Drop for SecureChannel<S> {
    fn drop(&mut self) {
        self.ssc.zeroize();
    }
}

impl<S: CipherSuite> core::fmt::Debug for SecureChannel<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
