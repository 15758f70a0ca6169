// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runtime configuration — single source of truth for the tunables that
//! govern sender/receiver pacing, liveness detection and overrun policy.
//!
//! Every field has the default the original implementation hardcoded;
//! each can be overridden by an `LANCASTER_*` environment variable via
//! [`RuntimeConfig::from_env`], for deployments that need to tune these
//! without a recompile.

use crate::clock::Microsec;

/// Sender-side: how long a partially-filled multicast packet may sit
/// before being flushed even though more room remains.
pub const DEFAULT_MAX_PKT_AGE_USEC: Microsec = 1_000;

/// Sender-side and receiver-side: the nominal heartbeat period.
pub const DEFAULT_HEARTBEAT_USEC: Microsec = 1_000_000;

/// Sender-side: how long without a storage touch before the producer is
/// declared dead.
pub const DEFAULT_ORPHAN_TIMEOUT_USEC: Microsec = 3_000_000;

/// Sender main loop: idle debounce window before sleeping.
pub const DEFAULT_IDLE_TIMEOUT_USEC: Microsec = 10;

/// Sender main loop: sleep duration once idle.
pub const DEFAULT_IDLE_SLEEP_USEC: Microsec = 1;

/// Receiver-side: elongated heartbeat window granted before the first
/// multicast datagram has ever been seen.
pub const DEFAULT_INITIAL_MC_HEARTBEAT_USEC: Microsec = 10_000_000;

/// Receiver-side: bound on reading the sender's greeting after connect.
pub const DEFAULT_CONNECT_READ_TIMEOUT_USEC: Microsec = 10_000_000;

/// Toucher: how often the touched timestamp is refreshed.
pub const DEFAULT_TOUCH_PERIOD_USEC: Microsec = 1_000_000;

/// Extra heartbeat periods tolerated before declaring `NoHeartbeat`.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 2;

/// Tunables shared by the sender and receiver main loops.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub max_pkt_age_usec: Microsec,
    pub heartbeat_usec: Microsec,
    pub orphan_timeout_usec: Microsec,
    pub idle_timeout_usec: Microsec,
    pub idle_sleep_usec: Microsec,
    pub initial_mc_heartbeat_usec: Microsec,
    pub connect_read_timeout_usec: Microsec,
    pub touch_period_usec: Microsec,
    pub max_missed_heartbeats: u32,
    /// If `true`, a change-queue overrun jumps the cursor forward instead
    /// of failing with [`crate::Error::ChangeQueueOverrun`].
    pub ignore_overrun: bool,
    /// If `true`, a stale touched timestamp is not fatal.
    pub ignore_orphan: bool,
    /// If `true`, a changed creation timestamp is not fatal.
    pub ignore_recreate: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_pkt_age_usec: DEFAULT_MAX_PKT_AGE_USEC,
            heartbeat_usec: DEFAULT_HEARTBEAT_USEC,
            orphan_timeout_usec: DEFAULT_ORPHAN_TIMEOUT_USEC,
            idle_timeout_usec: DEFAULT_IDLE_TIMEOUT_USEC,
            idle_sleep_usec: DEFAULT_IDLE_SLEEP_USEC,
            initial_mc_heartbeat_usec: DEFAULT_INITIAL_MC_HEARTBEAT_USEC,
            connect_read_timeout_usec: DEFAULT_CONNECT_READ_TIMEOUT_USEC,
            touch_period_usec: DEFAULT_TOUCH_PERIOD_USEC,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            ignore_overrun: false,
            ignore_orphan: false,
            ignore_recreate: false,
        }
    }
}

impl RuntimeConfig {
    /// Start from [`Default`] and apply any `LANCASTER_*` environment
    /// overrides present in the process environment. Malformed values are
    /// ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        apply_usec_env(&mut cfg.max_pkt_age_usec, "LANCASTER_MAX_PKT_AGE_USEC");
        apply_usec_env(&mut cfg.heartbeat_usec, "LANCASTER_HEARTBEAT_USEC");
        apply_usec_env(&mut cfg.orphan_timeout_usec, "LANCASTER_ORPHAN_TIMEOUT_USEC");
        apply_usec_env(&mut cfg.idle_timeout_usec, "LANCASTER_IDLE_TIMEOUT_USEC");
        apply_usec_env(&mut cfg.idle_sleep_usec, "LANCASTER_IDLE_SLEEP_USEC");
        apply_usec_env(
            &mut cfg.initial_mc_heartbeat_usec,
            "LANCASTER_INITIAL_MC_HEARTBEAT_USEC",
        );
        apply_usec_env(
            &mut cfg.connect_read_timeout_usec,
            "LANCASTER_CONNECT_READ_TIMEOUT_USEC",
        );
        apply_usec_env(&mut cfg.touch_period_usec, "LANCASTER_TOUCH_PERIOD_USEC");

        if let Ok(v) = std::env::var("LANCASTER_MAX_MISSED_HEARTBEATS") {
            if let Ok(v) = v.parse() {
                cfg.max_missed_heartbeats = v;
            }
        }
        cfg.ignore_overrun = bool_env("LANCASTER_IGNORE_OVERRUN");
        cfg.ignore_orphan = bool_env("LANCASTER_IGNORE_ORPHAN");
        cfg.ignore_recreate = bool_env("LANCASTER_IGNORE_RECREATE");
        cfg
    }

    /// The heartbeat silence deadline derived from `heartbeat_usec` and
    /// `max_missed_heartbeats`, per the receiver's liveness rule in
    /// `SPEC_FULL.md` §4.5: `heartbeat_usec * (max_missed_hb + 1) + 100ms`.
    pub fn heartbeat_deadline_usec(&self) -> Microsec {
        self.heartbeat_usec * (self.max_missed_heartbeats as i64 + 1) + 100_000
    }
}

fn apply_usec_env(field: &mut Microsec, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(v) = v.parse() {
            *field = v;
        }
    }
}

fn bool_env(key: &str) -> bool {
    matches!(std::env::var(key).as_deref(), Ok("1") | Ok("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_constants() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.orphan_timeout_usec, 3_000_000);
        assert_eq!(cfg.idle_timeout_usec, 10);
        assert_eq!(cfg.idle_sleep_usec, 1);
        assert_eq!(cfg.initial_mc_heartbeat_usec, 10_000_000);
    }

    #[test]
    fn heartbeat_deadline_matches_spec_formula() {
        let mut cfg = RuntimeConfig::default();
        cfg.heartbeat_usec = 1_000_000;
        cfg.max_missed_heartbeats = 2;
        assert_eq!(cfg.heartbeat_deadline_usec(), 3_100_000);
    }
}
