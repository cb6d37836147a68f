//! Terminal side of a BAC session over a [`Transport`].

use std::sync::{Arc, Mutex};

use rand::{rngs::OsRng, CryptoRng, RngCore};
use tracing::{debug, error, info, trace};

use crate::apdu::{
    CommandApdu, ResponseApdu, StatusWord, CLA_PLAIN, INS_CREATE_FILE, INS_GET_CHALLENGE,
    INS_MUTUAL_AUTHENTICATE, INS_READ_BINARY, INS_SELECT_FILE, INS_UPDATE_BINARY,
};
use crate::bac::{TerminalHandshake, AUTH_DATA_SIZE, NONCE_SIZE};
use crate::crypto::{bytes2hex, CipherSuite, Tdes};
use crate::file_store::EMRTD_AID;
use crate::kdf::StaticKeys;
use crate::secure_messaging::SecureChannel;
use crate::tlv::{read_length, read_tag};
use crate::transport::Transport;
use crate::BacError;

/// Largest READ BINARY or UPDATE BINARY chunk. Keeps protected commands
/// and responses within short APDU limits.
const MAX_CHUNK: usize = 0xDF;

/// Bytes read first to learn the length of an EF.
const HEADER_LEN: usize = 4;

/// Returns the data of a successful response.
fn check_status(response: (Vec<u8>, StatusWord), context: &str) -> Result<Vec<u8>, BacError> {
    let (data, status) = response;
    if status.is_success() {
        return Ok(data);
    }
    error!("Received invalid SW during {context}: {status}");
    Err(BacError::RecvApduError(status.sw1(), status.sw2()))
}

/// Talks to an eMRTD through a [`Transport`], with or without secure
/// messaging.
pub struct BacReader<T: Transport, R: RngCore + CryptoRng = OsRng, S: CipherSuite = Tdes> {
    transport: T,
    rng: R,
    suite: S,
    channel: Option<SecureChannel<S>>,
}

impl<T: Transport> BacReader<T> {
    /// Constructs a new `BacReader` using [`Tdes`] and the operating
    /// system's random number generator.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self::with_parts(transport, OsRng, Tdes)
    }
}

impl<T: Transport, R: RngCore + CryptoRng, S: CipherSuite + Clone> BacReader<T, R, S> {
    #[must_use]
    pub fn with_parts(transport: T, rng: R, suite: S) -> Self {
        Self {
            transport,
            rng,
            suite,
            channel: None,
        }
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Whether a secure messaging session is established.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| !channel.is_closed())
    }

    /// Current SSC of the session.
    #[must_use]
    pub fn ssc(&self) -> Option<u64> {
        self.channel.as_ref().map(SecureChannel::ssc)
    }

    /// Forgets the session keys.
    pub fn close_session(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            debug!("Closing secure messaging session");
            channel.close();
        }
    }

    /// Sends an APDU to the card and receives the response.
    /// If `secure` is `false`, the APDU is sent in plaintext, which also
    /// ends any secure messaging session on the card.
    /// If `secure` is `true`, the APDU is protected with the session
    /// established by [`Self::establish_bac_session_keys`].
    ///
    /// # Returns
    ///
    /// The response data and status word.
    ///
    /// # Errors
    ///
    /// * `BacError::SessionClosedError` if `secure` is set without a session.
    /// * `BacError` if the exchange fails. The session is closed when a
    ///   protected exchange fails.
    pub fn send(&mut self, apdu: &CommandApdu, secure: bool) -> Result<(Vec<u8>, StatusWord), BacError> {
        if !secure {
            if self.channel.is_some() {
                debug!("Plain APDU ends the secure messaging session");
                self.close_session();
            }
            let apdu_bytes = apdu.to_bytes()?;
            trace!("Sending APDU: {}", bytes2hex(&apdu_bytes));
            let response = ResponseApdu::from_bytes(&self.transport.transmit(&apdu_bytes)?)?;
            trace!("APDU response ({}): {}", response.sw, bytes2hex(&response.data));
            return Ok((response.data, response.sw));
        }

        let Some(channel) = self.channel.as_mut() else {
            error!("Secure messaging session is not established but trying to send securely");
            return Err(BacError::SessionClosedError());
        };
        let protected_apdu = channel.wrap_command(apdu)?;
        trace!("Sending Protected APDU: {}", bytes2hex(&protected_apdu));

        let response = match self.transport.transmit(&protected_apdu) {
            Ok(response) => response,
            Err(err) => {
                error!("Error while sending protected APDU.");
                self.close_session();
                return Err(err);
            }
        };
        let Some(channel) = self.channel.as_mut() else {
            return Err(BacError::SessionClosedError());
        };
        match channel.unwrap_response(&response) {
            Ok(response) => {
                trace!("APDU response ({}): {}", response.sw, bytes2hex(&response.data));
                Ok((response.data, response.sw))
            }
            Err(err) => {
                self.close_session();
                Err(err)
            }
        }
    }

    /// Selects the eMRTD application using AID `A0000002471001`.
    ///
    /// # Errors
    ///
    /// `BacError` in case of failure during sending the APDU.
    pub fn select_emrtd_application(&mut self) -> Result<(), BacError> {
        info!(
            "Selecting eMRTD Application `International AID`: {}...",
            bytes2hex(&EMRTD_AID)
        );
        let apdu = CommandApdu::new(CLA_PLAIN, INS_SELECT_FILE, 0x04, 0x0C, Some(EMRTD_AID.to_vec()), None);
        check_status(self.send(&apdu, false)?, "Select eMRTD Application command")?;
        Ok(())
    }

    /// Performs the BAC handshake, ICAO Doc 9303-11 Section 4.3 and
    /// Appendix D.3, and keeps the resulting session for `secure` sends.
    ///
    /// # Errors
    ///
    /// * `BacError::AuthenticationFailed` if the card rejects MUTUAL
    ///   AUTHENTICATE or its answer does not verify.
    /// * `BacError` in case of failure during sending the APDUs.
    pub fn establish_bac_session_keys(&mut self, keys: &StaticKeys) -> Result<(), BacError> {
        trace!("Establishing session keys...");
        self.close_session();

        let apdu = CommandApdu::new(CLA_PLAIN, INS_GET_CHALLENGE, 0x00, 0x00, None, Some(0x08));
        let rnd_ic = check_status(self.send(&apdu, false)?, "GET CHALLENGE")?;
        if rnd_ic.len() != NONCE_SIZE {
            error!("GET CHALLENGE returned {} bytes, expected {NONCE_SIZE}", rnd_ic.len());
            return Err(BacError::InvalidResponseError());
        }

        let (handshake, data) = TerminalHandshake::start(&self.suite, keys, &rnd_ic, &mut self.rng)?;
        let le = u8::try_from(AUTH_DATA_SIZE).map_err(BacError::IntCastError)?;
        let apdu = CommandApdu::new(CLA_PLAIN, INS_MUTUAL_AUTHENTICATE, 0x00, 0x00, Some(data), Some(le));
        let (response, status) = self.send(&apdu, false)?;
        if !status.is_success() {
            error!("Card rejected MUTUAL AUTHENTICATE: {status}");
            return Err(BacError::AuthenticationFailed());
        }

        self.channel = Some(handshake.finish(self.suite.clone(), keys, &response)?);
        info!("BAC session established");
        Ok(())
    }

    /// Selects an Elementary File (EF) by its file identifier.
    ///
    /// `name` is only used for logging.
    ///
    /// # Errors
    ///
    /// * `BacError` in case of failure during sending the APDU.
    pub fn select_ef(&mut self, fid: u16, name: &str, secure: bool) -> Result<(), BacError> {
        trace!("Selecting File {name}: {fid:04X}...");
        let apdu = CommandApdu::new(
            CLA_PLAIN,
            INS_SELECT_FILE,
            0x02,
            0x0C,
            Some(fid.to_be_bytes().to_vec()),
            None,
        );
        check_status(self.send(&apdu, secure)?, "Select EF command")?;
        Ok(())
    }

    fn offset_p1p2(offset: usize) -> Result<[u8; 2], BacError> {
        let offset = u16::try_from(offset).map_err(BacError::IntCastError)?;
        if offset > 0x7FFF {
            error!("Offset {offset} does not fit in P1-P2");
            return Err(BacError::InvalidArgument("Offset does not fit in P1-P2"));
        }
        Ok(offset.to_be_bytes())
    }

    /// Reads `len` bytes of the selected EF starting at `offset`.
    ///
    /// # Errors
    ///
    /// * `BacError` if the offset is beyond `0x7FFF` or the card refuses.
    pub fn read_binary(&mut self, offset: usize, len: u8, secure: bool) -> Result<Vec<u8>, BacError> {
        let [p1, p2] = Self::offset_p1p2(offset)?;
        let apdu = CommandApdu::new(CLA_PLAIN, INS_READ_BINARY, p1, p2, None, Some(len));
        check_status(self.send(&apdu, secure)?, "READ BINARY")
    }

    /// Reads the selected EF.
    ///
    /// The first four bytes give the length of the EF's TLV object, the
    /// rest is read in chunks.
    /// [`Self::select_ef`] must be called before calling this function.
    ///
    /// # Errors
    ///
    /// * `BacError` in case of failure.
    pub fn read_data_from_ef(&mut self, secure: bool) -> Result<Vec<u8>, BacError> {
        trace!("Reading first {HEADER_LEN} bytes from EF...");
        let header_le = u8::try_from(HEADER_LEN).map_err(BacError::IntCastError)?;
        let mut data = self.read_binary(0, header_le, secure)?;
        if data.len() != HEADER_LEN {
            error!(
                "Card response length should be equal to the requested amount {HEADER_LEN}, found {}",
                data.len()
            );
            return Err(BacError::InvalidResponseError());
        }

        let (_, tag_len) = read_tag(&data)?;
        let (length_len, value_len) = read_length(&data[tag_len..])?;
        let Some(data_len) = (tag_len + length_len).checked_add(value_len) else {
            error!("EF length {value_len} overflows");
            return Err(BacError::InvalidResponseError());
        };
        data.truncate(data_len);

        let mut offset = data.len();
        trace!("Reading {data_len} bytes from EF...");
        while offset < data_len {
            let le = u8::try_from((data_len - offset).min(MAX_CHUNK)).map_err(BacError::IntCastError)?;
            trace!("Reading next {le} bytes from EF...");
            let data_read = self.read_binary(offset, le, secure)?;
            if data_read.is_empty() {
                error!("Requested bytes while reading EF but received 0 bytes.");
                return Err(BacError::InvalidResponseError());
            }
            data.extend_from_slice(&data_read);
            offset += data_read.len();
        }

        if offset != data_len {
            error!("Error while parsing EF data from the card, expected {data_len}, found {offset}.");
            return Err(BacError::InvalidResponseError());
        }
        Ok(data)
    }

    /// Writes `data` into the selected EF at `offset`.
    ///
    /// # Errors
    ///
    /// * `BacError` if the offset is beyond `0x7FFF` or the card refuses.
    pub fn update_binary(&mut self, offset: usize, data: &[u8], secure: bool) -> Result<(), BacError> {
        let [p1, p2] = Self::offset_p1p2(offset)?;
        let apdu = CommandApdu::new(CLA_PLAIN, INS_UPDATE_BINARY, p1, p2, Some(data.to_vec()), None);
        check_status(self.send(&apdu, secure)?, "UPDATE BINARY")?;
        Ok(())
    }

    /// Writes `data` from the start of the selected EF in chunks.
    ///
    /// # Errors
    ///
    /// * `BacError` in case of failure.
    pub fn write_data_to_ef(&mut self, data: &[u8], secure: bool) -> Result<(), BacError> {
        trace!("Writing {} bytes to EF...", data.len());
        for (index, chunk) in data.chunks(MAX_CHUNK).enumerate() {
            self.update_binary(index * MAX_CHUNK, chunk, secure)?;
        }
        Ok(())
    }

    /// Creates a transparent EF of `size` bytes.
    ///
    /// # Errors
    ///
    /// * `BacError` in case of failure.
    pub fn create_file(&mut self, fid: u16, size: u16, secure: bool) -> Result<(), BacError> {
        trace!("Creating file {fid:04X} of {size} bytes...");
        let [size_high, size_low] = size.to_be_bytes();
        let [fid_high, fid_low] = fid.to_be_bytes();
        let fcp = vec![0x63, 0x04, size_high, size_low, fid_high, fid_low];
        let apdu = CommandApdu::new(CLA_PLAIN, INS_CREATE_FILE, 0x00, 0x00, Some(fcp), None);
        check_status(self.send(&apdu, secure)?, "CREATE FILE")?;
        Ok(())
    }

    /// Puts the reader behind a lock so it can be shared between threads.
    #[must_use]
    pub fn into_shared(self) -> SharedReader<T, R, S> {
        SharedReader {
            inner: Arc::new(Mutex::new(self)),
        }
    }
}

/// A [`BacReader`] shared between threads.
///
/// Every call holds the lock for its whole duration, so exchanges of
/// different threads never interleave within one session.
pub struct SharedReader<T: Transport, R: RngCore + CryptoRng = OsRng, S: CipherSuite = Tdes> {
    inner: Arc<Mutex<BacReader<T, R, S>>>,
}

impl<T: Transport, R: RngCore + CryptoRng, S: CipherSuite> Clone for SharedReader<T, R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport, R: RngCore + CryptoRng, S: CipherSuite + Clone> SharedReader<T, R, S> {
    /// Runs `f` with exclusive access to the reader.
    ///
    /// # Errors
    ///
    /// * `BacError::SessionClosedError` if another thread panicked while
    ///   holding the reader.
    /// * Whatever `f` returns.
    pub fn with<O>(
        &self,
        f: impl FnOnce(&mut BacReader<T, R, S>) -> Result<O, BacError>,
    ) -> Result<O, BacError> {
        let mut reader = self.inner.lock().map_err(|_| {
            error!("Reader lock is poisoned");
            BacError::SessionClosedError()
        })?;
        f(&mut *reader)
    }

    /// See [`BacReader::send`].
    ///
    /// # Errors
    ///
    /// * `BacError` in case of failure.
    pub fn send(&self, apdu: &CommandApdu, secure: bool) -> Result<(Vec<u8>, StatusWord), BacError> {
        self.with(|reader| reader.send(apdu, secure))
    }
}
