//! APDU transport and card presence polling.
//!
//! The protocol code only needs [`Transport::transmit`]. With the `pcsc`
//! feature enabled, `pcsc::Card` implements it and [`PcscReader`] reports
//! card presence for [`wait_for_card`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::BacError;

/// Byte-in, byte-out APDU exchange.
pub trait Transport {
    /// Sends a command APDU and returns the full response, status word
    /// included.
    ///
    /// # Errors
    ///
    /// * `BacError` if the exchange failed.
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, BacError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, BacError> {
        (**self).transmit(command)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, BacError> {
        (**self).transmit(command)
    }
}

/// Something that can tell whether a card is in the field.
pub trait CardPresence {
    /// # Errors
    ///
    /// * `BacError` if the reader could not be queried.
    fn is_card_present(&mut self) -> Result<bool, BacError>;
}

/// Timing of [`wait_for_card`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Pause between two presence checks.
    pub interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Polls `presence` until a card is present (`want_present`) or absent.
///
/// # Returns
///
/// `true` once the wanted state is observed, `false` on timeout or when
/// `cancel` is set.
///
/// # Errors
///
/// * `BacError` if a presence check fails.
///
/// # Example
///
/// ```
/// # use mrtd_bac::BacError;
/// #
/// # fn main() -> Result<(), BacError> {
/// use std::time::Duration;
/// use mrtd_bac::{wait_for_card, CardPresence, PollConfig};
///
/// struct AlwaysThere;
///
/// impl CardPresence for AlwaysThere {
///     fn is_card_present(&mut self) -> Result<bool, BacError> {
///         Ok(true)
///     }
/// }
///
/// let config = PollConfig { interval: Duration::from_millis(10), timeout: Duration::from_secs(1) };
/// assert!(wait_for_card(&mut AlwaysThere, true, &config, None)?);
/// assert!(!wait_for_card(&mut AlwaysThere, false, &PollConfig { timeout: Duration::ZERO, ..config }, None)?);
/// #
/// #     Ok(())
/// # }
/// ```
pub fn wait_for_card<P: CardPresence + ?Sized>(
    presence: &mut P,
    want_present: bool,
    config: &PollConfig,
    cancel: Option<&AtomicBool>,
) -> Result<bool, BacError> {
    let started = Instant::now();
    trace!(
        "Waiting up to {:?} for the card to be {}",
        config.timeout,
        if want_present { "present" } else { "removed" }
    );

    loop {
        if cancel.is_some_and(|cancel| cancel.load(Ordering::Relaxed)) {
            debug!("Waiting for card cancelled");
            return Ok(false);
        }
        if presence.is_card_present()? == want_present {
            return Ok(true);
        }

        let elapsed = started.elapsed();
        if elapsed >= config.timeout {
            debug!("Timed out waiting for card after {elapsed:?}");
            return Ok(false);
        }
        thread::sleep(config.interval.min(config.timeout - elapsed));
    }
}

#[cfg(feature = "pcsc")]
mod pcsc_reader {
    use std::ffi::{CStr, CString};
    use std::time::Duration;
    use tracing::{error, info};

    use super::{CardPresence, Transport};
    use crate::BacError;

    impl Transport for pcsc::Card {
        fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, BacError> {
            let mut response_buffer = [0; pcsc::MAX_BUFFER_SIZE];
            let response = pcsc::Card::transmit(self, command, &mut response_buffer)
                .map_err(BacError::PcscError)?;
            Ok(response.to_vec())
        }
    }

    /// A PC/SC reader, used to wait for a card and connect to it.
    pub struct PcscReader {
        context: pcsc::Context,
        reader: CString,
    }

    impl PcscReader {
        #[must_use]
        pub fn new(context: pcsc::Context, reader: CString) -> Self {
            Self { context, reader }
        }

        /// Establishes a user scope context and picks the first reader.
        ///
        /// # Errors
        ///
        /// * `BacError::PcscError` if there is no PC/SC service or no reader.
        pub fn first_available() -> Result<Self, BacError> {
            let context =
                pcsc::Context::establish(pcsc::Scope::User).map_err(BacError::PcscError)?;
            let Some(reader) = context
                .list_readers_owned()
                .map_err(BacError::PcscError)?
                .into_iter()
                .next()
            else {
                error!("No readers are connected.");
                return Err(BacError::PcscError(pcsc::Error::NoReadersAvailable));
            };
            info!("Using reader: {reader:?}");
            Ok(Self::new(context, reader))
        }

        #[must_use]
        pub fn name(&self) -> &CStr {
            &self.reader
        }

        /// Connects to the card in the reader.
        ///
        /// # Errors
        ///
        /// * `BacError::PcscError` if no card is present or the connection
        ///   failed.
        pub fn connect(&self) -> Result<pcsc::Card, BacError> {
            self.context
                .connect(&self.reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)
                .map_err(|err| {
                    error!("Failed to connect to card: {err}");
                    BacError::PcscError(err)
                })
        }
    }

    impl CardPresence for PcscReader {
        fn is_card_present(&mut self) -> Result<bool, BacError> {
            let mut states = [pcsc::ReaderState::new(
                self.reader.clone(),
                pcsc::State::UNAWARE,
            )];
            match self.context.get_status_change(Duration::ZERO, &mut states) {
                Ok(()) => Ok(states[0].event_state().contains(pcsc::State::PRESENT)),
                Err(pcsc::Error::Timeout) => Ok(false),
                Err(err) => Err(BacError::PcscError(err)),
            }
        }
    }
}

#[cfg(feature = "pcsc")]
pub use pcsc_reader::PcscReader;

#[cfg(test)]
mod tests {
    use super::*;

    /// Reports the card after a number of polls, or an error if asked to.
    struct MockPresence {
        polls: usize,
        present_after: Option<usize>,
        fail: bool,
    }

    impl CardPresence for MockPresence {
        fn is_card_present(&mut self) -> Result<bool, BacError> {
            if self.fail {
                return Err(BacError::CommunicationError("reader unplugged".to_owned()));
            }
            self.polls += 1;
            Ok(self.present_after.is_some_and(|after| self.polls > after))
        }
    }

    fn mock(present_after: Option<usize>) -> MockPresence {
        MockPresence {
            polls: 0,
            present_after,
            fail: false,
        }
    }

    fn fast() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_default_config() {
        let config = PollConfig::default();
        assert_eq!(config.interval, Duration::from_millis(200));
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_card_inserted() -> Result<(), BacError> {
        let mut presence = mock(Some(3));
        assert!(wait_for_card(&mut presence, true, &fast(), None)?);
        assert_eq!(presence.polls, 4);
        Ok(())
    }

    #[test]
    fn test_card_removed() -> Result<(), BacError> {
        let mut presence = mock(None);
        assert!(wait_for_card(&mut presence, false, &fast(), None)?);
        assert_eq!(presence.polls, 1);
        Ok(())
    }

    #[test]
    fn test_timeout() -> Result<(), BacError> {
        let mut presence = mock(None);
        let config = PollConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(30),
        };
        let started = Instant::now();
        assert!(!wait_for_card(&mut presence, true, &config, None)?);
        assert!(started.elapsed() >= config.timeout);
        assert!(presence.polls >= 2);
        Ok(())
    }

    #[test]
    fn test_cancel() -> Result<(), BacError> {
        let mut presence = mock(Some(0));
        let cancel = AtomicBool::new(true);
        assert!(!wait_for_card(&mut presence, true, &fast(), Some(&cancel))?);
        assert_eq!(presence.polls, 0);
        Ok(())
    }

    #[test]
    fn test_presence_error() {
        let mut presence = MockPresence {
            polls: 0,
            present_after: None,
            fail: true,
        };
        let result = wait_for_card(&mut presence, true, &fast(), None);
        assert!(result.is_err_and(|e| matches!(e, BacError::CommunicationError(_))));
    }
}
