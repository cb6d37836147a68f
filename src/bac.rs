//! The BAC mutual authentication, ICAO Doc 9303-11 Section 4.3.
//!
//! Terminal side:
//!
//! 1. GET CHALLENGE returns `RND.IC`.
//! 2. [`TerminalHandshake::start`] draws `RND.IFD` and `K.IFD` and builds
//!    the MUTUAL AUTHENTICATE payload `E_IFD ∥ M_IFD`.
//! 3. [`TerminalHandshake::finish`] checks the chip's answer and opens a
//!    [`SecureChannel`].
//!
//! The chip side is the dual, see [`ChipAuthenticator`].

use constant_time_eq::constant_time_eq;
use rand::{CryptoRng, RngCore};
use tracing::{debug, error, trace};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{padding_method_2, xor_slices, CipherSuite, Tdes, MAC_SIZE};
use crate::kdf::{SessionKeys, StaticKeys, KEY_SEED_SIZE};
use crate::secure_messaging::SecureChannel;
use crate::BacError;

/// Length of `RND.IC` and `RND.IFD`.
pub const NONCE_SIZE: usize = 8;

/// Length of the MUTUAL AUTHENTICATE command and response data.
pub const AUTH_DATA_SIZE: usize = 2 * NONCE_SIZE + KEY_SEED_SIZE + MAC_SIZE;

const CRYPTOGRAM_SIZE: usize = AUTH_DATA_SIZE - MAC_SIZE;

/// Encrypts a handshake plaintext and appends its MAC.
fn seal<S: CipherSuite>(suite: &S, keys: &StaticKeys, plaintext: &[u8]) -> Result<Vec<u8>, BacError> {
    let cryptogram = suite.encrypt(keys.k_enc().as_bytes(), plaintext)?;
    let mac = suite.mac(
        keys.k_mac().as_bytes(),
        &padding_method_2(&cryptogram, suite.block_size())?,
    )?;
    Ok([&cryptogram[..], &mac[..]].concat())
}

/// Verifies the MAC of a handshake message and decrypts it.
fn open<S: CipherSuite>(
    suite: &S,
    keys: &StaticKeys,
    data: &[u8],
) -> Result<Zeroizing<Vec<u8>>, BacError> {
    if data.len() != AUTH_DATA_SIZE {
        error!(
            "MUTUAL AUTHENTICATE data must be {AUTH_DATA_SIZE} bytes, found {}",
            data.len()
        );
        return Err(BacError::InvalidResponseError());
    }
    let (cryptogram, mac) = data.split_at(CRYPTOGRAM_SIZE);
    let padded = padding_method_2(cryptogram, suite.block_size())?;
    if !suite.verify_mac(keys.k_mac().as_bytes(), &padded, mac)? {
        error!("MAC verification failed during mutual authentication");
        return Err(BacError::AuthenticationFailed());
    }
    Ok(Zeroizing::new(suite.decrypt(keys.k_enc().as_bytes(), cryptogram)?))
}

/// `K.IFD ⊕ K.IC`
fn key_seed(k_ifd: &[u8], k_ic: &[u8]) -> Result<Zeroizing<[u8; KEY_SEED_SIZE]>, BacError> {
    let xored = Zeroizing::new(xor_slices(k_ifd, k_ic)?);
    if xored.len() != KEY_SEED_SIZE {
        error!("Key seed must be {KEY_SEED_SIZE} bytes, found {}", xored.len());
        return Err(BacError::InvalidArgument("Key seed has the wrong length"));
    }
    let mut seed = Zeroizing::new([0; KEY_SEED_SIZE]);
    seed.copy_from_slice(&xored);
    Ok(seed)
}

/// `SSC = RND.IC[4..8] ∥ RND.IFD[4..8]`
fn initial_ssc(rnd_ic: &[u8], rnd_ifd: &[u8]) -> u64 {
    let mut ssc = [0; 8];
    ssc[..4].copy_from_slice(&rnd_ic[NONCE_SIZE - 4..NONCE_SIZE]);
    ssc[4..].copy_from_slice(&rnd_ifd[NONCE_SIZE - 4..NONCE_SIZE]);
    u64::from_be_bytes(ssc)
}

/// Terminal half of a handshake in progress.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TerminalHandshake {
    rnd_ifd: [u8; NONCE_SIZE],
    rnd_ic: [u8; NONCE_SIZE],
    k_ifd: [u8; KEY_SEED_SIZE],
}

impl TerminalHandshake {
    /// Draws `RND.IFD` and `K.IFD` and encrypts `RND.IFD ∥ RND.IC ∥ K.IFD`.
    ///
    /// # Returns
    ///
    /// The pending handshake and the 40-byte MUTUAL AUTHENTICATE data
    /// `E_IFD ∥ M_IFD`.
    ///
    /// # Errors
    ///
    /// * `BacError::InvalidResponseError` if `rnd_ic` is not 8 bytes.
    pub fn start<S: CipherSuite, R: RngCore + CryptoRng>(
        suite: &S,
        keys: &StaticKeys,
        rnd_ic: &[u8],
        rng: &mut R,
    ) -> Result<(Self, Vec<u8>), BacError> {
        let Ok(rnd_ic) = <[u8; NONCE_SIZE]>::try_from(rnd_ic) else {
            error!("Challenge must be {NONCE_SIZE} bytes, found {}", rnd_ic.len());
            return Err(BacError::InvalidResponseError());
        };

        let mut handshake = Self {
            rnd_ifd: [0; NONCE_SIZE],
            rnd_ic,
            k_ifd: [0; KEY_SEED_SIZE],
        };
        rng.fill_bytes(&mut handshake.rnd_ifd);
        rng.fill_bytes(&mut handshake.k_ifd);

        let plaintext = Zeroizing::new(
            [&handshake.rnd_ifd[..], &handshake.rnd_ic[..], &handshake.k_ifd[..]].concat(),
        );
        let data = seal(suite, keys, &plaintext)?;
        Ok((handshake, data))
    }

    /// Checks the chip's MUTUAL AUTHENTICATE response and derives the
    /// session.
    ///
    /// # Errors
    ///
    /// * `BacError::InvalidResponseError` if the response is not 40 bytes.
    /// * `BacError::AuthenticationFailed` if `M_IC` or one of the echoed
    ///   nonces is wrong.
    pub fn finish<S: CipherSuite>(
        self,
        suite: S,
        keys: &StaticKeys,
        response: &[u8],
    ) -> Result<SecureChannel<S>, BacError> {
        let plaintext = open(&suite, keys, response)?;
        let (rnd_ic, rest) = plaintext.split_at(NONCE_SIZE);
        let (rnd_ifd, k_ic) = rest.split_at(NONCE_SIZE);

        // Both checks run so the failure does not depend on which nonce differs.
        let rnd_ic_ok = constant_time_eq(rnd_ic, &self.rnd_ic);
        let rnd_ifd_ok = constant_time_eq(rnd_ifd, &self.rnd_ifd);
        if !(rnd_ic_ok & rnd_ifd_ok) {
            error!("Nonces echoed by the chip do not match");
            return Err(BacError::AuthenticationFailed());
        }

        let seed = key_seed(&self.k_ifd, k_ic)?;
        let ssc = initial_ssc(&self.rnd_ic, &self.rnd_ifd);
        trace!("BAC session established, SSC {ssc:016X}");
        Ok(SecureChannel::new(suite, SessionKeys::from_key_seed(&seed)?, ssc))
    }
}

/// Chip authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    /// A challenge is outstanding.
    Challenged,
    Authenticated,
}

/// Chip side of the handshake.
pub struct ChipAuthenticator<S: CipherSuite + Clone = Tdes> {
    suite: S,
    keys: StaticKeys,
    challenge: Option<[u8; NONCE_SIZE]>,
    state: AuthState,
}

impl<S: CipherSuite + Clone> ChipAuthenticator<S> {
    #[must_use]
    pub fn new(suite: S, keys: StaticKeys) -> Self {
        Self {
            suite,
            keys,
            challenge: None,
            state: AuthState::Unauthenticated,
        }
    }

    #[must_use]
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Draws a fresh `RND.IC`, replacing any earlier challenge.
    pub fn issue_challenge<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> [u8; NONCE_SIZE] {
        let mut rnd_ic = [0; NONCE_SIZE];
        rng.fill_bytes(&mut rnd_ic);
        self.challenge = Some(rnd_ic);
        self.state = AuthState::Challenged;
        rnd_ic
    }

    /// Drops an outstanding challenge. Called for every command other than
    /// MUTUAL AUTHENTICATE, which must directly follow GET CHALLENGE.
    pub fn expire_challenge(&mut self) {
        if self.challenge.is_some() {
            debug!("Challenge expired");
        }
        self.challenge.zeroize();
        self.challenge = None;
        if self.state == AuthState::Challenged {
            self.state = AuthState::Unauthenticated;
        }
    }

    /// Forgets the challenge and any authentication.
    pub fn reset(&mut self) {
        self.challenge.zeroize();
        self.challenge = None;
        self.state = AuthState::Unauthenticated;
    }

    /// Answers MUTUAL AUTHENTICATE.
    ///
    /// The outstanding challenge is consumed whatever the outcome.
    ///
    /// # Returns
    ///
    /// The 40-byte response `E_IC ∥ M_IC` and the chip's end of the
    /// channel.
    ///
    /// # Errors
    ///
    /// * `BacError::StateError` if no challenge is outstanding.
    /// * `BacError::AuthenticationFailed` for every other failure: wrong
    ///   length, wrong MAC or wrong echoed challenge.
    pub fn mutual_authenticate<R: RngCore + CryptoRng>(
        &mut self,
        data: &[u8],
        rng: &mut R,
    ) -> Result<(Vec<u8>, SecureChannel<S>), BacError> {
        let Some(rnd_ic) = self.challenge.take() else {
            error!("MUTUAL AUTHENTICATE without an outstanding challenge");
            self.state = AuthState::Unauthenticated;
            return Err(BacError::StateError(
                "MUTUAL AUTHENTICATE without an outstanding challenge",
            ));
        };
        let rnd_ic = Zeroizing::new(rnd_ic);

        match self.respond(&rnd_ic, data, rng) {
            Ok(result) => {
                self.state = AuthState::Authenticated;
                Ok(result)
            }
            Err(err) => {
                debug!("Mutual authentication failed: {err}");
                self.state = AuthState::Unauthenticated;
                Err(BacError::AuthenticationFailed())
            }
        }
    }

    fn respond<R: RngCore + CryptoRng>(
        &self,
        rnd_ic: &[u8; NONCE_SIZE],
        data: &[u8],
        rng: &mut R,
    ) -> Result<(Vec<u8>, SecureChannel<S>), BacError> {
        let plaintext = open(&self.suite, &self.keys, data)?;
        let (rnd_ifd, rest) = plaintext.split_at(NONCE_SIZE);
        let (echoed_rnd_ic, k_ifd) = rest.split_at(NONCE_SIZE);
        if !constant_time_eq(echoed_rnd_ic, rnd_ic) {
            error!("Challenge echoed by the terminal does not match");
            return Err(BacError::AuthenticationFailed());
        }

        let mut k_ic = Zeroizing::new([0; KEY_SEED_SIZE]);
        rng.fill_bytes(&mut *k_ic);

        let seed = key_seed(k_ifd, &*k_ic)?;
        let ssc = initial_ssc(rnd_ic, rnd_ifd);
        let channel = SecureChannel::new(
            self.suite.clone(),
            SessionKeys::from_key_seed(&seed)?,
            ssc,
        );

        let response_plaintext = Zeroizing::new([&rnd_ic[..], rnd_ifd, &k_ic[..]].concat());
        let response = seal(&self.suite, &self.keys, &response_plaintext)?;
        trace!("BAC session established, SSC {ssc:016X}");
        Ok((response, channel))
    }
}

impl<S: CipherSuite + Clone> Drop for ChipAuthenticator<S> {
    fn drop(&mut self) {
        self.challenge.zeroize();
    }
}
