//! Read orchestration: one attempt is connect, BAC, EF.COM, EF.DG1, EF.DG15; attempts are
//! repeated while the failure looks transient.

use core::fmt;
use std::thread;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use tracing::{error, info, warn};

use crate::bac::{establish_session, select_emrtd_application};
use crate::channel::{TracedChannel, DEFAULT_EXCHANGE_TIMEOUT};
use crate::files::{read_file, FileId, DEFAULT_READ_CHUNK};
use crate::lds::{parse_dg1, parse_dg15, ComFile};
use crate::secure_messaging::SecureChannel;
use crate::{BacKeys, CancelToken, CardChannel, Credentials, ErrorKind, PassportError, PassportRecord};

/// Tunables of a [`PassportReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Attempts before giving up, at least one is always made.
    pub max_attempts: u32,
    /// Pause between two attempts.
    pub retry_delay: Duration,
    /// Deadline for a single exchange, applied by [`crate::TimeoutChannel`].
    pub exchange_timeout: Duration,
    /// Largest READ BINARY chunk, 1 to 255 bytes.
    pub read_chunk: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

impl ReaderConfig {
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub const fn with_exchange_timeout(mut self, exchange_timeout: Duration) -> Self {
        self.exchange_timeout = exchange_timeout;
        self
    }

    #[must_use]
    pub const fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk;
        self
    }
}

/// Progress of the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadState {
    Idle,
    KeysDerived,
    /// BAC succeeded; EF.COM is read in this state.
    Authenticated,
    ReadingDg1,
    ReadingDg15,
    Complete,
    Failed(ErrorKind),
}

impl fmt::Display for ReadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Idle => f.write_str("idle"),
            Self::KeysDerived => f.write_str("keys derived"),
            Self::Authenticated => f.write_str("authenticated"),
            Self::ReadingDg1 => f.write_str("reading EF.DG1"),
            Self::ReadingDg15 => f.write_str("reading EF.DG15"),
            Self::Complete => f.write_str("complete"),
            Self::Failed(kind) => write!(f, "failed ({kind:?})"),
        }
    }
}

/// The error that ended a read, with the number of attempts made and the state the last
/// attempt failed in.
#[derive(Debug)]
pub struct ReadFailure {
    pub error: PassportError,
    pub attempts: u32,
    pub state: ReadState,
}

impl fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Passport read failed after {} attempt(s) while {}: {}",
            self.attempts, self.state, self.error
        )
    }
}

impl std::error::Error for ReadFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Whether a new attempt, starting from a fresh connection and handshake, may help.
const fn is_retryable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ChannelLost
            | ErrorKind::AuthenticationFailed
            | ErrorKind::SecureMessagingError
            | ErrorKind::Malformed
    )
}

/// Reads EF.COM, EF.DG1 and EF.DG15 from an ePassport over BAC.
///
/// # Example
///
/// ```no_run
/// # use std::error::Error;
/// #
/// # fn main() -> Result<(), Box<dyn Error>> {
/// use passport_reader::{PassportReader, PcscChannel, ReaderConfig, TimeoutChannel};
///
/// let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
/// let mut readers_buf = [0; 2048];
/// let reader = ctx.list_readers(&mut readers_buf)?.next().ok_or("no reader")?;
/// let card = ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)?;
///
/// let config = ReaderConfig::default();
/// let channel = TimeoutChannel::spawn(PcscChannel::new(card), config.exchange_timeout);
/// let mut reader = PassportReader::new(channel).with_config(config);
/// let record = reader.read("L898902C3", "740812", "120415")?;
/// println!("{}", record.to_json()?);
/// #
/// #     Ok(())
/// # }
/// ```
pub struct PassportReader<C: CardChannel, R: RngCore + CryptoRng = OsRng> {
    channel: C,
    rng: R,
    config: ReaderConfig,
    cancel: Option<CancelToken>,
    state: ReadState,
}

impl<C: CardChannel> PassportReader<C> {
    /// A reader drawing its nonces from the operating system.
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            rng: OsRng,
            config: ReaderConfig::default(),
            cancel: None,
            state: ReadState::Idle,
        }
    }
}

impl<C: CardChannel, R: RngCore + CryptoRng> PassportReader<C, R> {
    /// Replaces the source of RND.IFD and K.IFD.
    pub fn with_rng<R2: RngCore + CryptoRng>(self, rng: R2) -> PassportReader<C, R2> {
        PassportReader {
            channel: self.channel,
            rng,
            config: self.config,
            cancel: self.cancel,
            state: self.state,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// State reached by the last attempt.
    #[must_use]
    pub const fn state(&self) -> ReadState {
        self.state
    }

    pub fn into_inner(self) -> C {
        self.channel
    }

    /// Reads the passport, retrying transient failures.
    ///
    /// The channel is closed after every attempt, successful or not.
    ///
    /// # Errors
    ///
    /// [`ReadFailure`] with the error of the last attempt.
    pub fn read(
        &mut self,
        document_number: &str,
        date_of_birth: &str,
        date_of_expiry: &str,
    ) -> Result<PassportRecord, ReadFailure> {
        self.state = ReadState::Idle;
        let credentials = Credentials::new(document_number, date_of_birth, date_of_expiry)
            .map_err(|error| ReadFailure {
                error,
                attempts: 0,
                state: ReadState::Idle,
            })?;

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!("Passport read attempt {attempt} of {max_attempts}");
            self.state = ReadState::Idle;
            let result = self.attempt(&credentials);
            self.channel.close();

            let error = match result {
                Ok(record) => {
                    self.state = ReadState::Complete;
                    info!("Passport read complete after {attempt} attempt(s)");
                    return Ok(record);
                }
                Err(error) => error,
            };
            let failed_in = self.state;
            let kind = error.kind();
            self.state = ReadState::Failed(kind);

            if !is_retryable(kind) || attempt >= max_attempts {
                error!("Passport read failed while {failed_in}: {error}");
                return Err(ReadFailure {
                    error,
                    attempts: attempt,
                    state: failed_in,
                });
            }
            warn!("Attempt {attempt} failed while {failed_in}: {error}, retrying");
            thread::sleep(self.config.retry_delay);
        }
    }

    fn attempt(&mut self, credentials: &Credentials) -> Result<PassportRecord, PassportError> {
        let mut channel = TracedChannel::new(&mut self.channel, self.cancel.as_ref());
        channel.connect()?;

        let keys = BacKeys::derive(credentials)?;
        self.state = ReadState::KeysDerived;

        select_emrtd_application(&mut channel)?;
        let session = establish_session(&mut channel, &mut self.rng, &keys)?;
        self.state = ReadState::Authenticated;

        let chunk = self.config.read_chunk;
        let mut secure = SecureChannel::new(&mut channel, session);

        let com = ComFile::parse(&read_file(&mut secure, FileId::Com, chunk)?)?;
        info!(
            "LDS version {}, Unicode version {}",
            com.lds_version, com.unicode_version
        );
        for file in [FileId::Dg1, FileId::Dg15] {
            if !com.lists(file.tag()) {
                warn!("EF.COM does not list {file}, reading it anyway");
            }
        }

        self.state = ReadState::ReadingDg1;
        let mrz = parse_dg1(&read_file(&mut secure, FileId::Dg1, chunk)?)?;

        self.state = ReadState::ReadingDg15;
        let pubkey = parse_dg15(&read_file(&mut secure, FileId::Dg15, chunk)?)?;

        PassportRecord::from_mrz(mrz, pubkey)
    }
}

impl<C: CardChannel, R: RngCore + CryptoRng> fmt::Debug for PassportReader<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassportReader")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Reads a passport with the default configuration and `max_attempts` attempts.
///
/// # Errors
///
/// [`ReadFailure`] with the error of the last attempt.
pub fn read_passport<C: CardChannel>(
    channel: C,
    document_number: &str,
    date_of_birth: &str,
    date_of_expiry: &str,
    max_attempts: u32,
) -> Result<PassportRecord, ReadFailure> {
    PassportReader::new(channel)
        .with_config(ReaderConfig::default().with_max_attempts(max_attempts))
        .read(document_number, date_of_birth, date_of_expiry)
}
