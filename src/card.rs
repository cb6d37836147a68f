//! Chip side of the eMRTD application.
//!
//! [`PassportApplet`] answers GET CHALLENGE, MUTUAL AUTHENTICATE, SELECT,
//! READ BINARY, UPDATE BINARY and CREATE FILE on top of a [`FileStore`].
//! Once authenticated, protected commands are unwrapped before dispatch and
//! their responses are wrapped, see [`SecureChannel`].
//!
//! A new applet is in the personalisation phase: files may be created and
//! written with plain commands, or directly with
//! [`PassportApplet::personalize`]. After [`PassportApplet::lock`] every
//! file access requires secure messaging.

use rand::{rngs::OsRng, CryptoRng, RngCore};
use tracing::{debug, info, trace, warn};

use crate::apdu::{
    CommandApdu, StatusWord, CLA_PROTECTED, INS_CREATE_FILE, INS_GET_CHALLENGE,
    INS_MUTUAL_AUTHENTICATE, INS_READ_BINARY, INS_SELECT_FILE, INS_UPDATE_BINARY,
};
use crate::bac::{AuthState, ChipAuthenticator, AUTH_DATA_SIZE, NONCE_SIZE};
use crate::crypto::{bytes2hex, CipherSuite, Tdes};
use crate::file_store::{FileStore, MemoryFileStore, EMRTD_AID};
use crate::kdf::StaticKeys;
use crate::secure_messaging::SecureChannel;
use crate::transport::Transport;
use crate::BacError;

/// Tag of the file control parameters in CREATE FILE.
const FCP_TAG: u8 = 0x63;

/// An eMRTD chip holding the LDS files of one document.
pub struct PassportApplet<
    F: FileStore = MemoryFileStore,
    S: CipherSuite + Clone = Tdes,
    R: RngCore + CryptoRng = OsRng,
> {
    files: F,
    rng: R,
    authenticator: ChipAuthenticator<S>,
    channel: Option<SecureChannel<S>>,
    selected_file: Option<u16>,
    locked: bool,
}

impl<F: FileStore> PassportApplet<F> {
    /// Creates an applet with the [`Tdes`] suite and the operating system's
    /// random number generator.
    ///
    /// `keys` are the document basic access keys, see
    /// [`StaticKeys::from_mrz`].
    #[must_use]
    pub fn new(files: F, keys: StaticKeys) -> Self {
        Self::with_parts(files, keys, Tdes, OsRng)
    }
}

impl<F: FileStore, S: CipherSuite + Clone, R: RngCore + CryptoRng> PassportApplet<F, S, R> {
    #[must_use]
    pub fn with_parts(files: F, keys: StaticKeys, suite: S, rng: R) -> Self {
        Self {
            files,
            rng,
            authenticator: ChipAuthenticator::new(suite, keys),
            channel: None,
            selected_file: None,
            locked: false,
        }
    }

    /// Creates a file holding `data`, bypassing the command interface.
    ///
    /// # Errors
    ///
    /// * `BacError::StateError` once the applet is locked.
    /// * `BacError` if the store refuses the file.
    pub fn personalize(&mut self, fid: u16, data: &[u8]) -> Result<(), BacError> {
        if self.locked {
            warn!("Personalisation of file {fid:04X} after lock");
            return Err(BacError::StateError("Applet is already locked"));
        }
        self.files.create_file(fid, data.len())?;
        self.files.write_file(fid, 0, data)?;
        info!("Personalised file {fid:04X} with {} bytes", data.len());
        Ok(())
    }

    /// Ends the personalisation phase.
    pub fn lock(&mut self) {
        info!("Applet locked");
        self.locked = true;
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Card reset: drops the session and the selection.
    pub fn reset(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.authenticator.reset();
        self.selected_file = None;
    }

    #[must_use]
    pub fn state(&self) -> AuthState {
        self.authenticator.state()
    }

    #[must_use]
    pub fn selected_file(&self) -> Option<u16> {
        self.selected_file
    }

    #[must_use]
    pub fn files(&self) -> &F {
        &self.files
    }

    /// Processes one command APDU and returns the response APDU.
    ///
    /// Errors are reported as status words, never as `Err`.
    pub fn process(&mut self, command: &[u8]) -> Vec<u8> {
        trace!("Chip received: {}", bytes2hex(command));
        let apdu = match CommandApdu::from_bytes(command) {
            Ok(apdu) => apdu,
            Err(err) => {
                debug!("Malformed command: {err}");
                return self.plain_response(StatusWord::WRONG_LENGTH);
            }
        };
        if apdu.cla() & !CLA_PROTECTED != 0 {
            debug!("Class {:02X} not supported", apdu.cla());
            return self.plain_response(StatusWord::CLA_NOT_SUPPORTED);
        }

        if apdu.is_protected() {
            return self.process_protected(&apdu);
        }

        if self.channel.is_some() {
            debug!("Plain command ends the secure messaging session");
            self.reset();
        }
        match self.dispatch(&apdu, false) {
            Ok(data) => [data, StatusWord::SUCCESS.to_bytes().to_vec()].concat(),
            Err(sw) => sw.to_bytes().to_vec(),
        }
    }

    fn process_protected(&mut self, apdu: &CommandApdu) -> Vec<u8> {
        let Some(channel) = self.channel.as_mut() else {
            debug!("Protected command without a session");
            return self.plain_response(StatusWord::SECURITY_STATUS_NOT_SATISFIED);
        };
        let command = match channel.unwrap_command(apdu) {
            Ok(command) => command,
            Err(err) => {
                warn!("Secure messaging failed, ending session: {err}");
                return self.plain_response(StatusWord::SM_DATA_OBJECTS_INCORRECT);
            }
        };

        let (data, sw) = match self.dispatch(&command, true) {
            Ok(data) => (data, StatusWord::SUCCESS),
            Err(sw) => (Vec::new(), sw),
        };
        let Some(channel) = self.channel.as_mut() else {
            return self.plain_response(sw);
        };
        match channel.wrap_response(&data, sw) {
            Ok(response) => response,
            Err(err) => {
                warn!("Could not protect response, ending session: {err}");
                self.plain_response(StatusWord::SM_DATA_OBJECTS_INCORRECT)
            }
        }
    }

    /// An unprotected status word; ends any session.
    fn plain_response(&mut self, sw: StatusWord) -> Vec<u8> {
        if self.channel.is_some() {
            self.reset();
        }
        sw.to_bytes().to_vec()
    }

    fn dispatch(&mut self, command: &CommandApdu, protected: bool) -> Result<Vec<u8>, StatusWord> {
        if command.ins() != INS_MUTUAL_AUTHENTICATE {
            self.authenticator.expire_challenge();
        }
        match command.ins() {
            INS_GET_CHALLENGE => self.get_challenge(command, protected),
            INS_MUTUAL_AUTHENTICATE => self.mutual_authenticate(command, protected),
            INS_SELECT_FILE => self.select_file(command, protected),
            INS_READ_BINARY => self.read_binary(command, protected),
            INS_UPDATE_BINARY => self.update_binary(command, protected),
            INS_CREATE_FILE => self.create_file(command, protected),
            ins => {
                debug!("Instruction {ins:02X} not supported");
                Err(StatusWord::INS_NOT_SUPPORTED)
            }
        }
    }

    fn get_challenge(&mut self, command: &CommandApdu, protected: bool) -> Result<Vec<u8>, StatusWord> {
        if protected {
            return Err(StatusWord::COMMAND_NOT_ALLOWED);
        }
        if command.expected_length() != Some(NONCE_SIZE) {
            return Err(StatusWord::WRONG_LENGTH);
        }
        Ok(self.authenticator.issue_challenge(&mut self.rng).to_vec())
    }

    fn mutual_authenticate(
        &mut self,
        command: &CommandApdu,
        protected: bool,
    ) -> Result<Vec<u8>, StatusWord> {
        if protected {
            return Err(StatusWord::COMMAND_NOT_ALLOWED);
        }
        if command.data().len() != AUTH_DATA_SIZE {
            self.authenticator.expire_challenge();
            return Err(StatusWord::WRONG_LENGTH);
        }
        match self
            .authenticator
            .mutual_authenticate(command.data(), &mut self.rng)
        {
            Ok((response, channel)) => {
                info!("Terminal authenticated");
                self.channel = Some(channel);
                Ok(response)
            }
            Err(BacError::StateError(_)) => Err(StatusWord::CONDITIONS_NOT_SATISFIED),
            Err(_) => Err(StatusWord::AUTHENTICATION_FAILED),
        }
    }

    /// Plain file access is only allowed during personalisation.
    fn check_access(&self, protected: bool) -> Result<(), StatusWord> {
        if self.locked && !protected {
            debug!("Plain file access on a locked applet");
            return Err(StatusWord::SECURITY_STATUS_NOT_SATISFIED);
        }
        Ok(())
    }

    fn select_file(&mut self, command: &CommandApdu, protected: bool) -> Result<Vec<u8>, StatusWord> {
        match command.p1() {
            0x04 => {
                if command.data() != EMRTD_AID {
                    debug!("Unknown application {}", bytes2hex(command.data()));
                    return Err(StatusWord::FILE_NOT_FOUND);
                }
                self.selected_file = None;
                Ok(Vec::new())
            }
            0x00 | 0x02 => {
                self.check_access(protected)?;
                let &[high, low] = command.data() else {
                    return Err(StatusWord::WRONG_LENGTH);
                };
                let fid = u16::from_be_bytes([high, low]);
                if !self.files.exists(fid) {
                    debug!("File {fid:04X} not found");
                    self.selected_file = None;
                    return Err(StatusWord::FILE_NOT_FOUND);
                }
                self.selected_file = Some(fid);
                Ok(Vec::new())
            }
            _ => Err(StatusWord::INCORRECT_P1P2),
        }
    }

    /// Selected file and offset addressed by P1-P2.
    fn file_offset(&self, command: &CommandApdu) -> Result<(u16, usize), StatusWord> {
        if command.p1() & 0x80 != 0 {
            return Err(StatusWord::INCORRECT_P1P2);
        }
        let Some(fid) = self.selected_file else {
            return Err(StatusWord::COMMAND_NOT_ALLOWED);
        };
        Ok((fid, usize::from(u16::from_be_bytes([command.p1(), command.p2()]))))
    }

    fn read_binary(&mut self, command: &CommandApdu, protected: bool) -> Result<Vec<u8>, StatusWord> {
        self.check_access(protected)?;
        let (fid, offset) = self.file_offset(command)?;
        let Some(len) = command.expected_length() else {
            return Err(StatusWord::WRONG_LENGTH);
        };
        self.files
            .read_file(fid, offset, len)
            .map_err(|err| file_error(&err, StatusWord::WRONG_P1P2))
    }

    fn update_binary(&mut self, command: &CommandApdu, protected: bool) -> Result<Vec<u8>, StatusWord> {
        self.check_access(protected)?;
        let (fid, offset) = self.file_offset(command)?;
        self.files
            .write_file(fid, offset, command.data())
            .map_err(|err| file_error(&err, StatusWord::WRONG_LENGTH))?;
        Ok(Vec::new())
    }

    /// Data is `63 len size(2) fid(2) ...`, `len` counting the bytes after it.
    fn create_file(&mut self, command: &CommandApdu, protected: bool) -> Result<Vec<u8>, StatusWord> {
        self.check_access(protected)?;
        let fcp = command.data();
        if fcp.len() < 6 || fcp[1] < 4 {
            return Err(StatusWord::WRONG_LENGTH);
        }
        if fcp[0] != FCP_TAG {
            return Err(StatusWord::DATA_INVALID);
        }
        let size = u16::from_be_bytes([fcp[2], fcp[3]]);
        let fid = u16::from_be_bytes([fcp[4], fcp[5]]);
        self.files
            .create_file(fid, usize::from(size))
            .map_err(|err| file_error(&err, StatusWord::WRONG_LENGTH))?;
        Ok(Vec::new())
    }
}

fn file_error(err: &BacError, out_of_bounds: StatusWord) -> StatusWord {
    debug!("File command failed: {err}");
    match *err {
        BacError::FileNotFound(_) => StatusWord::FILE_NOT_FOUND,
        BacError::FileExists(_) => StatusWord::FILE_EXISTS,
        BacError::FileOutOfBounds(..) => out_of_bounds,
        _ => StatusWord::UNKNOWN,
    }
}

impl<F: FileStore, S: CipherSuite + Clone, R: RngCore + CryptoRng> Transport
    for PassportApplet<F, S, R>
{
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, BacError> {
        Ok(self.process(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::ResponseApdu;
    use crate::bac::tests::{icao_keys, MockRng, ICAO_COMMAND, ICAO_RESPONSE, ICAO_RND_IC};
    use crate::bac::TerminalHandshake;
    use crate::file_store::{EF_COM, EF_DG1};
    use hex_literal::hex;

    type TestApplet = PassportApplet<MemoryFileStore, Tdes, MockRng>;

    const EF_COM_DATA: [u8; 22] = hex!("60145F0104303130365F36063034303030305C026175");

    fn applet() -> Result<TestApplet, BacError> {
        Ok(PassportApplet::with_parts(
            MemoryFileStore::lds(),
            icao_keys()?,
            Tdes,
            MockRng::icao_chip(),
        ))
    }

    fn locked_applet() -> Result<TestApplet, BacError> {
        let mut applet = applet()?;
        applet.personalize(EF_COM, &EF_COM_DATA)?;
        applet.lock();
        Ok(applet)
    }

    fn mutual_authenticate_apdu(data: &[u8]) -> Result<Vec<u8>, BacError> {
        CommandApdu::new(0x00, 0x82, 0x00, 0x00, Some(data.to_vec()), Some(0x28)).to_bytes()
    }

    /// Runs the handshake with the ICAO terminal material.
    fn authenticate(applet: &mut TestApplet) -> Result<SecureChannel, BacError> {
        let keys = icao_keys()?;
        let rnd_ic = applet.process(&hex!("0084000008"));
        let (handshake, data) =
            TerminalHandshake::start(&Tdes, &keys, &rnd_ic[..8], &mut MockRng::icao_terminal())?;
        let response = ResponseApdu::from_bytes(&applet.process(&mutual_authenticate_apdu(&data)?))?;
        assert_eq!(response.sw, StatusWord::SUCCESS);
        handshake.finish(Tdes, &keys, &response.data)
    }

    #[test]
    fn test_icao_session() -> Result<(), BacError> {
        let mut applet = locked_applet()?;
        assert_eq!(applet.process(&hex!("00A4040C07A0000002471001")), hex!("9000"));
        assert_eq!(applet.process(&hex!("0084000008")), [&ICAO_RND_IC[..], &hex!("9000")[..]].concat());
        assert_eq!(applet.state(), AuthState::Challenged);

        assert_eq!(
            applet.process(&mutual_authenticate_apdu(&ICAO_COMMAND)?),
            [&ICAO_RESPONSE[..], &hex!("9000")[..]].concat()
        );
        assert_eq!(applet.state(), AuthState::Authenticated);

        assert_eq!(
            applet.process(&hex!("0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800")),
            hex!("990290008E08FA855A5D4C50A8ED 9000")
        );
        assert_eq!(applet.selected_file(), Some(EF_COM));
        assert_eq!(
            applet.process(&hex!("0CB000000D9701048E08ED6705417E96BA5500")),
            hex!("8709019FF0EC34F9922651990290008E08AD55CC17140B2DED 9000")
        );
        assert_eq!(
            applet.process(&hex!("0CB000040D9701128E082EA28A70F3C7B53500")),
            hex!("871901FB9235F4E4037F2327DCC8964F1F9B8C30F42C8E2FFF224A990290008E08C8B2787EAEA07D74 9000")
        );
        Ok(())
    }

    #[test]
    fn test_class_and_instruction_errors() -> Result<(), BacError> {
        let mut applet = locked_applet()?;
        assert_eq!(applet.process(&hex!("80A4040C07A0000002471001")), hex!("6E00"));
        assert_eq!(applet.process(&hex!("00CA000000")), hex!("6D00"));
        assert_eq!(applet.process(&hex!("00A4")), hex!("6700"));
        assert_eq!(applet.process(&hex!("00A4020C03011E")), hex!("6700"));
        assert_eq!(applet.process(&hex!("0CA4020C02011E")), hex!("6982"));
        Ok(())
    }

    #[test]
    fn test_select_application() -> Result<(), BacError> {
        let mut applet = locked_applet()?;
        assert_eq!(applet.process(&hex!("00A4040C07A0000002471001")), hex!("9000"));
        assert_eq!(applet.process(&hex!("00A4040C07A0000002471002")), hex!("6A82"));
        assert_eq!(applet.process(&hex!("00A4010C02011E")), hex!("6A86"));
        Ok(())
    }

    #[test]
    fn test_challenge_rules() -> Result<(), BacError> {
        let mut applet = locked_applet()?;
        assert_eq!(applet.process(&hex!("0084000004")), hex!("6700"));

        // No challenge at all.
        assert_eq!(applet.process(&mutual_authenticate_apdu(&ICAO_COMMAND)?), hex!("6985"));

        // The challenge expires when another command comes in between.
        applet.process(&hex!("0084000008"));
        applet.process(&hex!("00A4040C07A0000002471001"));
        assert_eq!(applet.state(), AuthState::Unauthenticated);
        assert_eq!(applet.process(&mutual_authenticate_apdu(&ICAO_COMMAND)?), hex!("6985"));

        // Wrong length consumes the challenge too.
        applet.process(&hex!("0084000008"));
        assert_eq!(applet.process(&mutual_authenticate_apdu(&ICAO_COMMAND[..32])?), hex!("6700"));
        assert_eq!(applet.process(&mutual_authenticate_apdu(&ICAO_COMMAND)?), hex!("6985"));
        Ok(())
    }

    #[test]
    fn test_authentication_failure() -> Result<(), BacError> {
        let mut applet = locked_applet()?;
        let mut bad_mac = ICAO_COMMAND;
        bad_mac[39] ^= 0x01;

        assert_eq!(applet.process(&hex!("0084000008")), [&ICAO_RND_IC[..], &hex!("9000")[..]].concat());
        assert_eq!(applet.process(&mutual_authenticate_apdu(&bad_mac)?), hex!("6300"));
        assert_eq!(applet.state(), AuthState::Unauthenticated);
        assert_eq!(applet.process(&mutual_authenticate_apdu(&ICAO_COMMAND)?), hex!("6985"));

        // The next challenge differs from the one the terminal encrypted.
        applet.process(&hex!("0084000008"));
        assert_eq!(applet.process(&mutual_authenticate_apdu(&ICAO_COMMAND)?), hex!("6300"));
        Ok(())
    }

    #[test]
    fn test_locked_applet_requires_secure_messaging() -> Result<(), BacError> {
        let mut applet = locked_applet()?;
        assert_eq!(applet.process(&hex!("00A4020C02011E")), hex!("6982"));
        assert_eq!(applet.process(&hex!("00B0000004")), hex!("6982"));
        assert_eq!(applet.process(&hex!("00E0000006630400100101")), hex!("6982"));
        assert!(applet
            .personalize(EF_DG1, &[0])
            .is_err_and(|e| matches!(e, BacError::StateError(_))));
        Ok(())
    }

    #[test]
    fn test_protected_commands() -> Result<(), BacError> {
        let mut applet = locked_applet()?;
        let mut channel = authenticate(&mut applet)?;

        let select = CommandApdu::new(0x00, 0xA4, 0x02, 0x0C, Some(hex!("011E").to_vec()), None);
        let wrapped = channel.wrap_command(&select)?;
        let response = channel.unwrap_response(&applet.process(&wrapped))?;
        assert_eq!(response.sw, StatusWord::SUCCESS);

        let read = CommandApdu::new(0x00, 0xB0, 0x00, 0x00, None, Some(22));
        let wrapped = channel.wrap_command(&read)?;
        let response = channel.unwrap_response(&applet.process(&wrapped))?;
        assert_eq!(response, ResponseApdu::new(EF_COM_DATA.to_vec(), StatusWord::SUCCESS));

        // Errors are protected as well and keep the session.
        let read = CommandApdu::new(0x00, 0xB0, 0x00, 0x10, None, Some(0x10));
        let wrapped = channel.wrap_command(&read)?;
        let response = channel.unwrap_response(&applet.process(&wrapped))?;
        assert_eq!(response, ResponseApdu::status(StatusWord::WRONG_P1P2));

        let challenge = CommandApdu::new(0x00, 0x84, 0x00, 0x00, None, Some(8));
        let wrapped = channel.wrap_command(&challenge)?;
        let response = channel.unwrap_response(&applet.process(&wrapped))?;
        assert_eq!(response.sw, StatusWord::COMMAND_NOT_ALLOWED);
        assert_eq!(applet.state(), AuthState::Authenticated);
        Ok(())
    }

    #[test]
    fn test_tampered_command_ends_session() -> Result<(), BacError> {
        let mut applet = locked_applet()?;
        let mut channel = authenticate(&mut applet)?;

        let select = CommandApdu::new(0x00, 0xA4, 0x02, 0x0C, Some(hex!("011E").to_vec()), None);
        let mut wrapped = channel.wrap_command(&select)?;
        let last_mac_byte = wrapped.len() - 2;
        wrapped[last_mac_byte] ^= 0x01;

        assert_eq!(applet.process(&wrapped), hex!("6988"));
        assert_eq!(applet.state(), AuthState::Unauthenticated);
        assert!(channel
            .unwrap_response(&hex!("6988"))
            .is_err_and(|e| matches!(e, BacError::RecvApduError(0x69, 0x88))));

        let wrapped = SecureChannel::new(Tdes, crate::kdf::SessionKeys::from_key_seed(&[0; 16])?, 0)
            .wrap_command(&select)?;
        assert_eq!(applet.process(&wrapped), hex!("6982"));
        Ok(())
    }

    #[test]
    fn test_plain_command_ends_session() -> Result<(), BacError> {
        let mut applet = locked_applet()?;
        let mut channel = authenticate(&mut applet)?;

        assert_eq!(applet.process(&hex!("00A4040C07A0000002471001")), hex!("9000"));
        assert_eq!(applet.state(), AuthState::Unauthenticated);

        let select = CommandApdu::new(0x00, 0xA4, 0x02, 0x0C, Some(hex!("011E").to_vec()), None);
        assert_eq!(applet.process(&channel.wrap_command(&select)?), hex!("6982"));
        Ok(())
    }

    #[test]
    fn test_personalisation_commands() -> Result<(), BacError> {
        let mut applet = applet()?;
        assert_eq!(applet.process(&hex!("00E0000006630400100101")), hex!("9000"));
        assert_eq!(applet.process(&hex!("00E0000006630400100101")), hex!("6A89"));
        assert_eq!(applet.process(&hex!("00E00000066304001000FF")), hex!("6A82"));
        assert_eq!(applet.process(&hex!("00E0000006620400100102")), hex!("6984"));
        assert_eq!(applet.process(&hex!("00E000000463040010")), hex!("6700"));
        assert_eq!(applet.process(&hex!("00E0000006630300100102")), hex!("6700"));

        // READ and UPDATE need a selected file.
        assert_eq!(applet.process(&hex!("00B0000004")), hex!("6986"));
        assert_eq!(applet.process(&hex!("00D600000401020304")), hex!("6986"));

        assert_eq!(applet.process(&hex!("00A4020C020101")), hex!("9000"));
        assert_eq!(applet.process(&hex!("00D600000401020304")), hex!("9000"));
        assert_eq!(applet.process(&hex!("00B0000004")), hex!("01020304 9000"));
        assert_eq!(applet.process(&hex!("00B0800004")), hex!("6A86"));
        assert_eq!(applet.process(&hex!("00D6800001FF")), hex!("6A86"));

        // Out of bounds access is rejected, not truncated.
        assert_eq!(applet.process(&hex!("00B0000E04")), hex!("6B00"));
        assert_eq!(applet.process(&hex!("00D6000F02AABB")), hex!("6700"));
        assert_eq!(applet.files().read_file(EF_DG1, 0, 16)?, hex!("01020304000000000000000000000000"));

        // Selecting a missing file clears the selection.
        assert_eq!(applet.process(&hex!("00A4020C020102")), hex!("6A82"));
        assert_eq!(applet.selected_file(), None);
        assert_eq!(applet.process(&hex!("00B0000004")), hex!("6986"));
        Ok(())
    }

    #[test]
    fn test_reset() -> Result<(), BacError> {
        let mut applet = locked_applet()?;
        authenticate(&mut applet)?;
        assert_eq!(applet.state(), AuthState::Authenticated);

        applet.reset();
        assert_eq!(applet.state(), AuthState::Unauthenticated);
        assert_eq!(applet.selected_file(), None);
        assert!(applet.is_locked());
        Ok(())
    }
}
