// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Monotonic-enough microsecond time.
//!
//! All durations and timestamps in this crate are plain `i64` microsecond
//! counts (`Microsec`), matching the wire and on-disk formats exactly so no
//! conversion happens at the serialization boundary.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Microseconds, signed so that differences (e.g. "now minus touched") can
/// be negative without wrapping.
pub type Microsec = i64;

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn time() -> Result<Microsec> {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::InvalidArg("system clock before unix epoch"))?;
    Ok(since_epoch.as_micros() as Microsec)
}

/// Sleep for `usec` microseconds. Negative durations are a caller error.
pub fn sleep(usec: Microsec) -> Result<()> {
    if usec < 0 {
        return Err(Error::InvalidArg("clock::sleep: negative duration"));
    }
    std::thread::sleep(Duration::from_micros(usec as u64));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_is_monotonic_enough_for_ordering() {
        let a = time().unwrap();
        sleep(1_000).unwrap();
        let b = time().unwrap();
        assert!(b >= a);
    }

    #[test]
    fn sleep_rejects_negative_duration() {
        assert!(matches!(sleep(-1), Err(Error::InvalidArg(_))));
    }

    #[test]
    fn sleep_zero_returns_immediately() {
        sleep(0).unwrap();
    }
}
