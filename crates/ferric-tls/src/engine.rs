//! Record/handshake layer seam.
//!
//! The control plane drives handshake, read, write, flush, and shutdown
//! through this trait; the engine owns message construction, record
//! protection, and the transport binding. Blocking transport conditions
//! surface as `TlsError::Retry` sentinels so the control plane can park
//! state machines and resume later.

use ferric_types::TlsError;

/// Whether the peer accepted early data on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyDataDisposition {
    /// No early data was negotiated (or the offer was declined).
    Rejected,
    /// Early data was negotiated and accepted.
    Accepted,
}

/// The record/handshake layer driven by a connection.
///
/// Operations return `Err(TlsError::Retry(..))` when they would block; the
/// caller must re-invoke with identical arguments. Any other error is final
/// for the operation.
pub trait ProtocolEngine: Send {
    /// Drive the client handshake to completion.
    fn connect(&mut self) -> Result<(), TlsError>;

    /// Drive the server handshake to completion.
    fn accept(&mut self) -> Result<(), TlsError>;

    /// Read decrypted application data.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError>;

    /// Write application data; may report a short write when the caller
    /// permits partial writes. A successful call on a non-empty buffer must
    /// make progress; `Ok(0)` is reserved for empty input.
    fn write(&mut self, buf: &[u8]) -> Result<usize, TlsError>;

    /// Flush buffered records to the transport.
    fn flush(&mut self) -> Result<(), TlsError>;

    /// Send the closure alert.
    fn shutdown(&mut self) -> Result<(), TlsError>;

    /// Early-data disposition negotiated during the handshake.
    fn early_data_disposition(&self) -> EarlyDataDisposition;

    /// Whether the end-of-early-data signal has been consumed. The read-side
    /// early-data state machine flips to its finished state when this turns
    /// true.
    fn early_data_finished(&self) -> bool;
}

/// An engine that refuses every operation. Placeholder until a connection is
/// bound to a real record layer; also the engine deep-duplicated connections
/// start with, since in-flight record state cannot be copied.
#[derive(Debug, Default)]
pub struct UnboundEngine;

impl ProtocolEngine for UnboundEngine {
    fn connect(&mut self) -> Result<(), TlsError> {
        Err(TlsError::Config("no record layer bound".into()))
    }

    fn accept(&mut self) -> Result<(), TlsError> {
        Err(TlsError::Config("no record layer bound".into()))
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, TlsError> {
        Err(TlsError::Config("no record layer bound".into()))
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize, TlsError> {
        Err(TlsError::Config("no record layer bound".into()))
    }

    fn flush(&mut self) -> Result<(), TlsError> {
        Err(TlsError::Config("no record layer bound".into()))
    }

    fn shutdown(&mut self) -> Result<(), TlsError> {
        Err(TlsError::Config("no record layer bound".into()))
    }

    fn early_data_disposition(&self) -> EarlyDataDisposition {
        EarlyDataDisposition::Rejected
    }

    fn early_data_finished(&self) -> bool {
        false
    }
}
