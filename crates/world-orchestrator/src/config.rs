use crate::error::OrchestratorError;
use chrono::{FixedOffset, Offset, Utc, Weekday};
use std::time::Duration;

/// Configuration for the world orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often the scheduler loop drains due tasks. Default: 1s.
    pub scheduler_tick: Duration,
    /// Period of the heartbeat loop. Default: 30s.
    pub heartbeat_interval: Duration,
    /// Ceiling of a player's heartbeat retry counter. A player is demoted on
    /// exactly this many consecutive failed probes. Default: 3.
    pub heartbeat_retry_ceiling: u32,
    /// Deadline applied to every shard and directory RPC. Default: 5s.
    pub rpc_timeout: Duration,
    /// Lead time before a world boss expires at which shards are warned.
    /// Default: 60s.
    pub world_boss_warn_window: Duration,
    /// Lead time before a global portal expires at which shards are warned.
    /// Zero disables the warning. Default: 0.
    pub global_portal_warn_window: Duration,
    /// Day of the week the weekly reset happens on (at local midnight).
    /// Default: Friday.
    pub weekly_reset_day: Weekday,
    /// Offset used as "local time" for daily/weekly/monthly boundaries.
    /// Default: UTC.
    pub reset_utc_offset: FixedOffset,
    /// Upper bound on how long shutdown waits for in-flight loops and
    /// lifetime monitors before abandoning them. Default: 15s.
    pub monitor_shutdown_grace: Duration,
    /// Delay before the next plot expiry sweep when no plot is pending.
    /// Default: 1 day.
    pub plot_check_fallback: Duration,
    /// Delay before retrying the plot sweep when an expired plot could not
    /// be forfeited. Default: 10 minutes.
    pub plot_retry_delay: Duration,
    /// How long an expired, owner-less plot stays closed before it is put
    /// back up for sale. Default: 3 days.
    pub plot_sale_waiting_time: Duration,
}

impl OrchestratorConfig {
    /// Validate configuration values.
    ///
    /// Loop periods, the RPC deadline and the shutdown grace must be
    /// non-zero, and the retry ceiling must be at least one.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let non_zero = [
            ("scheduler_tick", self.scheduler_tick),
            ("heartbeat_interval", self.heartbeat_interval),
            ("rpc_timeout", self.rpc_timeout),
            ("monitor_shutdown_grace", self.monitor_shutdown_grace),
            ("plot_check_fallback", self.plot_check_fallback),
            ("plot_retry_delay", self.plot_retry_delay),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(OrchestratorError::InvalidConfig {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        if self.heartbeat_retry_ceiling == 0 {
            return Err(OrchestratorError::InvalidConfig {
                reason: "heartbeat_retry_ceiling must be >= 1".to_string(),
            });
        }
        if self.rpc_timeout >= self.heartbeat_interval {
            return Err(OrchestratorError::InvalidConfig {
                reason: format!(
                    "rpc_timeout ({:?}) must be shorter than heartbeat_interval ({:?})",
                    self.rpc_timeout, self.heartbeat_interval
                ),
            });
        }
        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scheduler_tick: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_retry_ceiling: 3,
            rpc_timeout: Duration::from_secs(5),
            world_boss_warn_window: Duration::from_secs(60),
            global_portal_warn_window: Duration::ZERO,
            weekly_reset_day: Weekday::Fri,
            reset_utc_offset: Utc.fix(),
            monitor_shutdown_grace: Duration::from_secs(15),
            plot_check_fallback: Duration::from_secs(86_400),
            plot_retry_delay: Duration::from_secs(600),
            plot_sale_waiting_time: Duration::from_secs(3 * 86_400),
        }
    }
}
