//! Request/response RPC over MQTT v5: classical single-response commands and
//! the streamed variant.

pub mod executor;
pub mod invoker;
pub mod streaming;

mod cache;
mod correlation;

pub use executor::{CommandExecutor, CommandExecutorOptions, CommandReply, CommandRequest};
pub use invoker::{CommandInvoker, CommandInvokerOptions, CommandResponse, InvokeOptions};

use crate::error::{Error, ErrorKind, Result};
use std::time::Duration;
use uuid::Uuid;

/// Correlation data is exactly the 16 raw bytes of a UUID.
pub(crate) fn correlation_uuid(bytes: &[u8]) -> Option<Uuid> {
    Uuid::from_slice(bytes).ok()
}

/// Message-expiry interval for a call: the override or the timeout, rounded
/// up to whole seconds as the wire requires.
pub(crate) fn expiry_interval(
    timeout: Duration,
    override_expiry: Option<Duration>,
) -> Result<Duration> {
    if timeout.is_zero() {
        return Err(Error::shallow(ErrorKind::ArgumentInvalid, "timeout must be non-zero"));
    }
    let base = override_expiry.unwrap_or(timeout);
    let mut seconds = base.as_secs();
    if base.subsec_nanos() > 0 || seconds == 0 {
        seconds = seconds.saturating_add(1);
    }
    if seconds > u64::from(u32::MAX) {
        return Err(Error::shallow(
            ErrorKind::ArgumentInvalid,
            "message expiry exceeds the MQTT limit",
        ));
    }
    Ok(Duration::from_secs(seconds))
}
