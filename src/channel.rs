//! Transports that carry raw APDUs to the chip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, trace, warn};

use crate::{bytes2hex, PassportError};

/// Default deadline for a single command/response exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// A synchronous request/response link to a contactless chip.
///
/// At most one command is outstanding at a time; `&mut self` enforces this.
/// Implementations report a physical disconnect as [`PassportError::ChannelLost`].
pub trait CardChannel {
    /// Acquires the link for one read attempt.
    ///
    /// # Errors
    ///
    /// `PassportError::ChannelLost` if the chip can not be reached.
    fn connect(&mut self) -> Result<(), PassportError> {
        Ok(())
    }

    /// Sends one command APDU and returns the complete response APDU, status word included.
    ///
    /// # Errors
    ///
    /// `PassportError::ChannelLost` if the link drops during the exchange.
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, PassportError>;

    /// Releases the link. Called after every attempt, whether it succeeded or not.
    fn close(&mut self) {}
}

impl<T: CardChannel + ?Sized> CardChannel for &mut T {
    fn connect(&mut self) -> Result<(), PassportError> {
        (**self).connect()
    }
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, PassportError> {
        (**self).transceive(command)
    }
    fn close(&mut self) {
        (**self).close();
    }
}

impl<T: CardChannel + ?Sized> CardChannel for Box<T> {
    fn connect(&mut self) -> Result<(), PassportError> {
        (**self).connect()
    }
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, PassportError> {
        (**self).transceive(command)
    }
    fn close(&mut self) {
        (**self).close();
    }
}

/// A PC/SC reader with a contactless card on it.
pub struct PcscChannel {
    card: pcsc::Card,
}

impl PcscChannel {
    /// Wraps a connected card. Both `connect` and `close` reset it.
    #[must_use]
    pub const fn new(card: pcsc::Card) -> Self {
        Self { card }
    }

    /// Answer to Reset of the card currently in the field.
    ///
    /// # Errors
    ///
    /// `PassportError` if the reader can not report the ATR.
    pub fn get_atr(&self) -> Result<Vec<u8>, PassportError> {
        self.card
            .get_attribute_owned(pcsc::Attribute::AtrString)
            .map_err(pcsc_error)
    }
}

impl core::fmt::Debug for PcscChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PcscChannel").finish_non_exhaustive()
    }
}

/// Maps transport-level PC/SC failures to `ChannelLost`, everything else to `PcscError`.
fn pcsc_error(err: pcsc::Error) -> PassportError {
    match err {
        pcsc::Error::RemovedCard
        | pcsc::Error::ResetCard
        | pcsc::Error::NoSmartcard
        | pcsc::Error::UnpoweredCard
        | pcsc::Error::UnresponsiveCard
        | pcsc::Error::ReaderUnavailable
        | pcsc::Error::CommError
        | pcsc::Error::Timeout => PassportError::ChannelLost(err.to_string()),
        other => PassportError::PcscError(other),
    }
}

impl CardChannel for PcscChannel {
    fn connect(&mut self) -> Result<(), PassportError> {
        // A reset drops whatever secure messaging state the chip still holds.
        self.card
            .reconnect(
                pcsc::ShareMode::Shared,
                pcsc::Protocols::ANY,
                pcsc::Disposition::ResetCard,
            )
            .map_err(pcsc_error)
    }

    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, PassportError> {
        let mut response_buffer = [0; pcsc::MAX_BUFFER_SIZE];
        let response = self
            .card
            .transmit(command, &mut response_buffer)
            .map_err(pcsc_error)?;
        Ok(response.to_vec())
    }

    fn close(&mut self) {
        // Ends the session on the chip now instead of on the next connect.
        if let Err(err) = self.card.reconnect(
            pcsc::ShareMode::Shared,
            pcsc::Protocols::ANY,
            pcsc::Disposition::ResetCard,
        ) {
            warn!("Resetting the card on close failed: {err}");
        }
    }
}

enum Request {
    Connect,
    Transceive(Vec<u8>),
    Close,
}

type Reply = Result<Vec<u8>, PassportError>;

/// Runs an inner channel on a dedicated thread and bounds every exchange with a deadline.
///
/// Card I/O may block forever once the chip leaves the field. A stalled exchange is
/// reported as [`PassportError::ChannelLost`]; its late reply, should it ever arrive, is
/// discarded.
pub struct TimeoutChannel {
    requests: Sender<(u64, Request)>,
    replies: Receiver<(u64, Reply)>,
    next_id: u64,
    timeout: Duration,
}

impl TimeoutChannel {
    /// Moves `inner` onto a worker thread and applies `timeout` to every exchange.
    pub fn spawn<C>(inner: C, timeout: Duration) -> Self
    where
        C: CardChannel + Send + 'static,
    {
        let (requests, worker_requests) = mpsc::channel::<(u64, Request)>();
        let (worker_replies, replies) = mpsc::channel::<(u64, Reply)>();

        thread::spawn(move || {
            let mut inner = inner;
            for (id, request) in worker_requests {
                let reply = match request {
                    Request::Connect => inner.connect().map(|()| Vec::new()),
                    Request::Transceive(command) => inner.transceive(&command),
                    Request::Close => {
                        inner.close();
                        Ok(Vec::new())
                    }
                };
                if worker_replies.send((id, reply)).is_err() {
                    break;
                }
            }
            trace!("Card channel worker exiting");
        });

        Self {
            requests,
            replies,
            next_id: 0,
            timeout,
        }
    }

    fn exchange(&mut self, request: Request) -> Reply {
        self.next_id += 1;
        let id = self.next_id;
        if self.requests.send((id, request)).is_err() {
            error!("Card channel worker is gone");
            return Err(PassportError::ChannelLost(
                "card channel worker stopped".to_owned(),
            ));
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok((reply_id, reply)) if reply_id == id => return reply,
                Ok((stale_id, _)) => {
                    warn!("Discarding late reply to exchange {stale_id}");
                }
                Err(RecvTimeoutError::Timeout) => {
                    error!("No answer from the card within {:?}", self.timeout);
                    return Err(PassportError::ChannelLost(format!(
                        "no answer within {:?}",
                        self.timeout
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    error!("Card channel worker is gone");
                    return Err(PassportError::ChannelLost(
                        "card channel worker stopped".to_owned(),
                    ));
                }
            }
        }
    }
}

impl core::fmt::Debug for TimeoutChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimeoutChannel")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CardChannel for TimeoutChannel {
    fn connect(&mut self) -> Result<(), PassportError> {
        self.exchange(Request::Connect).map(drop)
    }

    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, PassportError> {
        self.exchange(Request::Transceive(command.to_vec()))
    }

    fn close(&mut self) {
        self.next_id += 1;
        // fire and forget, the reply is discarded as stale by the next exchange
        let _ = self.requests.send((self.next_id, Request::Close));
    }
}

/// Cooperative cancellation flag shared between a running read and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that the read stops before its next card exchange.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Channel wrapper that logs every exchange and refuses to transmit once cancelled.
pub(crate) struct TracedChannel<'c, C: CardChannel> {
    inner: &'c mut C,
    cancel: Option<&'c CancelToken>,
}

impl<'c, C: CardChannel> TracedChannel<'c, C> {
    pub(crate) fn new(inner: &'c mut C, cancel: Option<&'c CancelToken>) -> Self {
        Self { inner, cancel }
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), PassportError> {
        if self.cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("Read cancelled, refusing to send further commands");
            return Err(PassportError::Cancelled);
        }
        Ok(())
    }
}

impl<C: CardChannel> CardChannel for TracedChannel<'_, C> {
    fn connect(&mut self) -> Result<(), PassportError> {
        self.check_cancelled()?;
        self.inner.connect()
    }

    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, PassportError> {
        self.check_cancelled()?;
        trace!("Sending APDU: {}", bytes2hex(command));
        let response = self.inner.transceive(command)?;
        trace!("Received R_APDU: {}", bytes2hex(&response));
        Ok(response)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}
