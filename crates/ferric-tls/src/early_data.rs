//! 0-RTT early data state machine.
//!
//! Clients send application data before the handshake completes; servers
//! read it before the client is authenticated and may answer while still
//! unauthenticated. The machine tracks where each side is so that blocked
//! operations resume at the right step when re-invoked with identical
//! arguments.

use ferric_types::TlsError;

use crate::engine::{EarlyDataDisposition, ProtocolEngine};
use crate::TlsRole;

/// Where the early-data exchange currently stands.
///
/// `Connecting`, `Accepting`, `Writing`, `Reading`, and `UnauthWriting` are
/// transient: they are only observable from a callback that fires while an
/// operation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyDataState {
    None,
    ConnectRetry,
    Connecting,
    AcceptRetry,
    Accepting,
    WriteRetry,
    Writing,
    WriteFlush,
    ReadRetry,
    Reading,
    FinishedReading,
    UnauthWriting,
}

/// Outcome of one early-data read step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyDataRead {
    /// Early data was received into the caller's buffer.
    Bytes(usize),
    /// The sender has finished; proceed with the rest of the handshake.
    Finished,
}

/// Per-connection early-data machine.
#[derive(Debug)]
pub struct EarlyData {
    state: EarlyDataState,
}

impl Default for EarlyData {
    fn default() -> Self {
        Self {
            state: EarlyDataState::None,
        }
    }
}

impl EarlyData {
    pub fn state(&self) -> EarlyDataState {
        self.state
    }

    /// Send early data.
    ///
    /// On a client this drives the handshake as far as needed, writes the
    /// whole buffer as one unit, and flushes it. On a server it is only
    /// valid once early data has been read (or finished) and answers the
    /// still-unauthenticated client. `can_offer` says whether this
    /// connection is able to offer early data at all: a session permitting
    /// it, or an external PSK source. `partial_write` is the connection's
    /// partial-write mode flag; early data is written atomically, so the
    /// flag is suppressed for the duration of the write and restored after.
    pub fn write(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        role: TlsRole,
        can_offer: bool,
        handshake_started: bool,
        partial_write: &mut bool,
        buf: &[u8],
    ) -> Result<usize, TlsError> {
        match self.state {
            EarlyDataState::None => {
                if role != TlsRole::Client {
                    return Err(TlsError::Sequence(
                        "server cannot initiate early data".into(),
                    ));
                }
                if handshake_started || !can_offer {
                    return Err(TlsError::Sequence(
                        "connection cannot offer early data".into(),
                    ));
                }
                self.connect_then_write(engine, partial_write, buf)
            }
            EarlyDataState::ConnectRetry => self.connect_then_write(engine, partial_write, buf),
            EarlyDataState::WriteRetry => self.write_then_flush(engine, partial_write, buf),
            EarlyDataState::WriteFlush => self.finish_flush(engine, buf.len()),
            EarlyDataState::ReadRetry | EarlyDataState::FinishedReading => {
                self.unauth_write(engine, buf)
            }
            _ => Err(TlsError::Sequence(
                "early data write not valid in current state".into(),
            )),
        }
    }

    fn connect_then_write(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        partial_write: &mut bool,
        buf: &[u8],
    ) -> Result<usize, TlsError> {
        self.state = EarlyDataState::Connecting;
        if let Err(e) = engine.connect() {
            self.state = EarlyDataState::ConnectRetry;
            return Err(e);
        }
        self.write_then_flush(engine, partial_write, buf)
    }

    fn write_then_flush(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        partial_write: &mut bool,
        buf: &[u8],
    ) -> Result<usize, TlsError> {
        self.state = EarlyDataState::Writing;
        // Early data must land as one unit, so partial write is off for the
        // duration of this write.
        let saved = *partial_write;
        *partial_write = false;
        let result = engine.write(buf);
        *partial_write = saved;
        match result {
            Ok(_) => self.finish_flush(engine, buf.len()),
            Err(e) => {
                self.state = EarlyDataState::WriteRetry;
                Err(e)
            }
        }
    }

    fn finish_flush(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        written: usize,
    ) -> Result<usize, TlsError> {
        self.state = EarlyDataState::WriteFlush;
        engine.flush()?;
        self.state = EarlyDataState::WriteRetry;
        Ok(written)
    }

    fn unauth_write(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        buf: &[u8],
    ) -> Result<usize, TlsError> {
        let resting = self.state;
        self.state = EarlyDataState::UnauthWriting;
        let result = engine.write(buf);
        if result.is_ok() {
            // The response must not sit buffered behind an unfinished
            // handshake; a failed flush is reported by a later operation.
            let _ = engine.flush();
        }
        self.state = resting;
        result
    }

    /// Receive early data on a server.
    ///
    /// Drives the handshake until early data can flow, then reads until the
    /// client signals it has finished. Once finished (or when the offer was
    /// rejected), every further call reports [`EarlyDataRead::Finished`].
    pub fn read(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        role: TlsRole,
        handshake_started: bool,
        buf: &mut [u8],
    ) -> Result<EarlyDataRead, TlsError> {
        match self.state {
            EarlyDataState::None => {
                if role != TlsRole::Server || handshake_started {
                    return Err(TlsError::Sequence(
                        "early data read is a pre-handshake server operation".into(),
                    ));
                }
                self.accept_then_read(engine, buf)
            }
            EarlyDataState::AcceptRetry => self.accept_then_read(engine, buf),
            EarlyDataState::ReadRetry => self.read_step(engine, buf),
            EarlyDataState::FinishedReading => Ok(EarlyDataRead::Finished),
            _ => Err(TlsError::Sequence(
                "early data read not valid in current state".into(),
            )),
        }
    }

    fn accept_then_read(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        buf: &mut [u8],
    ) -> Result<EarlyDataRead, TlsError> {
        self.state = EarlyDataState::Accepting;
        if let Err(e) = engine.accept() {
            self.state = EarlyDataState::AcceptRetry;
            return Err(e);
        }
        if engine.early_data_disposition() != EarlyDataDisposition::Accepted {
            self.state = EarlyDataState::FinishedReading;
            return Ok(EarlyDataRead::Finished);
        }
        self.read_step(engine, buf)
    }

    fn read_step(
        &mut self,
        engine: &mut dyn ProtocolEngine,
        buf: &mut [u8],
    ) -> Result<EarlyDataRead, TlsError> {
        self.state = EarlyDataState::Reading;
        match engine.read(buf) {
            Ok(n) => {
                self.state = EarlyDataState::ReadRetry;
                Ok(EarlyDataRead::Bytes(n))
            }
            Err(e) => {
                if engine.early_data_finished() {
                    self.state = EarlyDataState::FinishedReading;
                    Ok(EarlyDataRead::Finished)
                } else {
                    self.state = EarlyDataState::ReadRetry;
                    Err(e)
                }
            }
        }
    }

    /// Whether an early-data exchange is underway on this connection.
    pub fn in_progress(&self) -> bool {
        self.state != EarlyDataState::None
    }
}
