use std::time::Duration;

use bqproxy_contracts::bytes_to_gb;
use bqproxy_quota::DailyUsage;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateLimits {
    pub max_query_bytes: u64,
    /// `None` disables the daily quota.
    pub daily_quota_gb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateRejection {
    QueryTooLarge {
        estimated_bytes: u64,
        max_bytes: u64,
    },
    DailyQuotaExceeded {
        estimated_gb: f64,
        used_gb: f64,
        limit_gb: f64,
        resets_in: Option<Duration>,
    },
}

impl GateRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            GateRejection::QueryTooLarge { .. } => "query_too_large",
            GateRejection::DailyQuotaExceeded { .. } => "daily_quota_exceeded",
        }
    }

    pub fn message(&self) -> String {
        match self {
            GateRejection::QueryTooLarge {
                estimated_bytes,
                max_bytes,
            } => format!(
                "query would process {} bytes ({:.2} GB), more than the per-query limit of {} bytes ({:.2} GB)",
                estimated_bytes,
                bytes_to_gb(*estimated_bytes),
                max_bytes,
                bytes_to_gb(*max_bytes)
            ),
            GateRejection::DailyQuotaExceeded {
                estimated_gb,
                used_gb,
                limit_gb,
                resets_in,
            } => {
                let reset = match resets_in {
                    Some(remaining) => format!("quota resets in {}", format_duration(*remaining)),
                    None if *used_gb <= 0.0 => "the query alone exceeds the quota".to_string(),
                    None => "quota reset time is unknown".to_string(),
                };
                format!(
                    "query would process {:.2} GB, exceeding the daily quota of {} GB with {:.2} GB already used; {}",
                    estimated_gb,
                    format_gb_limit(*limit_gb),
                    used_gb,
                    reset
                )
            }
        }
    }
}

pub(super) fn check_query_size(limits: &GateLimits, estimated_bytes: u64) -> Result<(), GateRejection> {
    if estimated_bytes > limits.max_query_bytes {
        return Err(GateRejection::QueryTooLarge {
            estimated_bytes,
            max_bytes: limits.max_query_bytes,
        });
    }
    Ok(())
}

/// A projected total exactly at the limit is allowed.
pub(super) fn check_daily_quota(
    limits: &GateLimits,
    estimated_bytes: u64,
    usage: &DailyUsage,
) -> Result<(), GateRejection> {
    let Some(limit_gb) = limits.daily_quota_gb else {
        return Ok(());
    };

    let estimated_gb = bytes_to_gb(estimated_bytes);
    if usage.used_gb + estimated_gb > limit_gb {
        return Err(GateRejection::DailyQuotaExceeded {
            estimated_gb,
            used_gb: usage.used_gb,
            limit_gb,
            resets_in: usage.resets_in,
        });
    }
    Ok(())
}

fn format_gb_limit(gb: f64) -> String {
    if gb.fract() == 0.0 {
        format!("{}", gb as u64)
    } else {
        format!("{:.2}", gb)
    }
}

fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
