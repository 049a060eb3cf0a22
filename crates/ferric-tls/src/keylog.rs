//! NSS-format key material logging.
//!
//! One process-wide sink shared by every context. Lines follow the
//! SSLKEYLOGFILE convention: `LABEL <hex client random> <hex secret>`.
//! The sink is installed once and torn down when the last context that
//! used it goes away.

use std::io::Write;
use std::sync::{Mutex, OnceLock};

use ferric_types::TlsError;

static SINK: OnceLock<Mutex<Option<Box<dyn Write + Send>>>> = OnceLock::new();

fn sink() -> &'static Mutex<Option<Box<dyn Write + Send>>> {
    SINK.get_or_init(|| Mutex::new(None))
}

/// Install the process-wide key log sink, replacing any previous one.
pub fn attach(writer: Box<dyn Write + Send>) {
    if let Ok(mut guard) = sink().lock() {
        *guard = Some(writer);
    }
}

/// Whether a sink is currently installed.
pub fn is_attached() -> bool {
    sink().lock().map(|g| g.is_some()).unwrap_or(false)
}

/// Remove and drop the sink. Called when the last keylogging context is
/// dropped.
pub fn teardown() {
    if let Ok(mut guard) = sink().lock() {
        *guard = None;
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Emit one key log line. A missing sink is not an error; write failures are.
pub fn log_line(label: &str, client_random: &[u8], secret: &[u8]) -> Result<(), TlsError> {
    let mut guard = sink()
        .lock()
        .map_err(|_| TlsError::Resource("key log sink poisoned".into()))?;
    if let Some(w) = guard.as_mut() {
        writeln!(w, "{label} {} {}", hex(client_random), hex(secret))
            .map_err(|e| TlsError::Resource(format!("key log write: {e}")))?;
    }
    Ok(())
}
