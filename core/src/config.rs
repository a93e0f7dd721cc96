//! Environment-variable configuration (spec §6). Collected into one
//! `Config` value at `init`, teacher-style (a plain struct with a
//! `Default` impl and one `from_env` constructor), rather than a layered
//! file-based config — the teacher's comms crates read individual
//! env/config fields directly.

use std::env;
use std::str::FromStr;

/// `GASNET_WAIT_MODE` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Spin,
    Block,
    SpinBlock,
}

impl FromStr for WaitMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SPIN" => Ok(WaitMode::Spin),
            "BLOCK" => Ok(WaitMode::Block),
            "SPINBLOCK" => Ok(WaitMode::SpinBlock),
            other => Err(format!("unknown GASNET_WAIT_MODE {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub freeze: bool,
    pub wait_mode: WaitMode,
    pub networkdepth_total: u32,
    pub networkdepth_pp: u32,
    pub am_credits_total: u32,
    pub am_credits_pp: u32,
    pub am_credits_slack: u32,
    pub bbuf_count: u32,
    pub pin_maxsz: u64,
    pub num_qps: u32,
    pub inlinesend_limit: u32,
    pub nonbulkput_bounce_limit: u32,
    pub packedlong_limit: u32,
    pub rcv_thread: bool,
    pub firehose_m: u64,
    pub firehose_maxvictim_m: u64,
    pub use_firehose: bool,
    pub hca_id: String,
    pub port_num: u32,
    /// Max messages reaped per completion-polling pass (spec §4.2,
    /// `RCV_REAP_LIMIT ~= 16`). Not independently configurable upstream but
    /// exposed here since the engine needs a concrete value.
    pub rcv_reap_limit: usize,
    pub max_args: usize,
    pub max_medium: u32,
    pub max_long_request: u32,
    pub max_long_reply: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            freeze: false,
            wait_mode: WaitMode::SpinBlock,
            networkdepth_total: 1024,
            networkdepth_pp: 32,
            am_credits_total: 256,
            am_credits_pp: 32,
            am_credits_slack: 4,
            bbuf_count: 16,
            pin_maxsz: 1 << 30,
            num_qps: 1,
            inlinesend_limit: 72,
            nonbulkput_bounce_limit: 1 << 16,
            packedlong_limit: 1 << 13,
            rcv_thread: false,
            firehose_m: 1 << 28,
            firehose_maxvictim_m: 1 << 26,
            use_firehose: true,
            hca_id: String::new(),
            port_num: 1,
            rcv_reap_limit: 16,
            max_args: crate::am::frame::MAX_ARGS,
            max_medium: 1 << 16,
            max_long_request: 1 << 24,
            max_long_reply: 1 << 20,
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name).ok().and_then(|v| v.parse::<u32>().ok()).map(|v| v != 0).unwrap_or(default)
}

impl Config {
    /// Reads the environment variables enumerated in spec §6. Unset
    /// variables fall back to the defaults above. `GASNET_TRACEFILE`,
    /// `GASNET_STATSFILE`, `GASNET_TRACEMASK`, `GASNET_STATSMASK` are
    /// recognized (so reading this config never logs an "unknown env var"
    /// surprise) but intentionally inert — tracing/stats emission is an
    /// out-of-scope collaborator per spec §1 (see SPEC_FULL.md §0).
    pub fn from_env() -> Self {
        let defaults = Config::default();
        let wait_mode = env::var("GASNET_WAIT_MODE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.wait_mode);
        let _ = env::var("GASNET_TRACEFILE");
        let _ = env::var("GASNET_STATSFILE");
        let _ = env::var("GASNET_TRACEMASK");
        let _ = env::var("GASNET_STATSMASK");
        Config {
            freeze: env_bool("GASNET_FREEZE", defaults.freeze),
            wait_mode,
            networkdepth_total: env_u32("GASNET_NETWORKDEPTH_TOTAL", defaults.networkdepth_total),
            networkdepth_pp: env_u32("GASNET_NETWORKDEPTH_PP", defaults.networkdepth_pp),
            am_credits_total: env_u32("GASNET_AM_CREDITS_TOTAL", defaults.am_credits_total),
            am_credits_pp: env_u32("GASNET_AM_CREDITS_PP", defaults.am_credits_pp),
            am_credits_slack: env_u32("GASNET_AM_CREDITS_SLACK", defaults.am_credits_slack),
            bbuf_count: env_u32("GASNET_BBUF_COUNT", defaults.bbuf_count),
            pin_maxsz: env_u64("GASNET_PIN_MAXSZ", defaults.pin_maxsz),
            num_qps: env_u32("GASNET_NUM_QPS", defaults.num_qps),
            inlinesend_limit: env_u32("GASNET_INLINESEND_LIMIT", defaults.inlinesend_limit),
            nonbulkput_bounce_limit: env_u32("GASNET_NONBULKPUT_BOUNCE_LIMIT", defaults.nonbulkput_bounce_limit),
            packedlong_limit: env_u32("GASNET_PACKEDLONG_LIMIT", defaults.packedlong_limit),
            rcv_thread: env_bool("GASNET_RCV_THREAD", defaults.rcv_thread),
            firehose_m: env_u64("GASNET_FIREHOSE_M", defaults.firehose_m),
            firehose_maxvictim_m: env_u64("GASNET_FIREHOSE_MAXVICTIM_M", defaults.firehose_maxvictim_m),
            use_firehose: env_bool("GASNET_USE_FIREHOSE", defaults.use_firehose),
            hca_id: env::var("GASNET_HCA_ID").unwrap_or(defaults.hca_id),
            port_num: env_u32("GASNET_PORT_NUM", defaults.port_num),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_mode_parses() {
        assert_eq!("spin".parse::<WaitMode>().unwrap(), WaitMode::Spin);
        assert_eq!("BLOCK".parse::<WaitMode>().unwrap(), WaitMode::Block);
        assert!("bogus".parse::<WaitMode>().is_err());
    }

    #[test]
    fn defaults_are_self_consistent() {
        let c = Config::default();
        assert!(c.am_credits_pp <= c.am_credits_total);
        assert!(c.max_args <= crate::am::frame::MAX_ARGS);
    }
}
