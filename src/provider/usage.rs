//! Provider-reported quota usage, parsed opportunistically from response headers.
//!
//! Meta reports utilisation as percentages in JSON headers
//! (`X-App-Usage`, `X-Ad-Account-Usage`, `X-Business-Use-Case-Usage`). Other
//! endpoints report `X-RateLimit-Remaining` and `Retry-After`. Anything that
//! fails to parse is ignored.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use super::RawResponse;

/// Longest wait a provider hint can impose. Larger values are clamped.
pub const MAX_RETRY_HINT: Duration = Duration::from_secs(24 * 60 * 60);

/// Usage figures a provider attached to one response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProviderUsage {
    /// Highest utilisation percentage reported (0–100+)
    pub used_percent: Option<f64>,
    /// Calls remaining in the provider's current window
    pub remaining: Option<u64>,
    /// Provider-mandated wait before the next call
    pub retry_after: Option<Duration>,
}

impl ProviderUsage {
    pub fn is_empty(&self) -> bool {
        self.used_percent.is_none() && self.remaining.is_none() && self.retry_after.is_none()
    }

    /// Parses every known usage header on `response`.
    pub fn from_response(response: &RawResponse) -> Self {
        let mut usage = ProviderUsage::default();
        let mut regain_after: Option<Duration> = None;

        for header in ["x-app-usage", "x-ad-account-usage"] {
            if let Some(value) = response.header(header).and_then(parse_json) {
                usage.merge_percent(max_percent(&value));
            }
        }

        if let Some(Value::Object(businesses)) =
            response.header("x-business-use-case-usage").and_then(parse_json)
        {
            for entries in businesses.values() {
                for entry in entries.as_array().into_iter().flatten() {
                    usage.merge_percent(max_percent(entry));
                    let minutes = entry
                        .get("estimated_time_to_regain_access")
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    if minutes > 0 {
                        let wait = Duration::from_secs(minutes.saturating_mul(60))
                            .min(MAX_RETRY_HINT);
                        regain_after = Some(regain_after.map_or(wait, |w| w.max(wait)));
                    }
                }
            }
        }

        usage.remaining = response
            .header("x-ratelimit-remaining")
            .and_then(|v| v.trim().parse::<u64>().ok());

        usage.retry_after = response
            .header("retry-after")
            .and_then(parse_retry_after)
            .or(regain_after);

        usage
    }

    fn merge_percent(&mut self, percent: Option<f64>) {
        if let Some(percent) = percent {
            self.used_percent = Some(self.used_percent.map_or(percent, |p| p.max(percent)));
        }
    }
}

fn parse_json(raw: &str) -> Option<Value> {
    serde_json::from_str(raw).ok()
}

/// Largest numeric utilisation field in a Meta usage object.
fn max_percent(value: &Value) -> Option<f64> {
    const FIELDS: [&str; 4] = ["call_count", "total_time", "total_cputime", "acc_id_util_pct"];

    FIELDS
        .iter()
        .filter_map(|field| value.get(*field).and_then(Value::as_f64))
        .fold(None, |max, v| Some(max.map_or(v, |m: f64| m.max(v))))
}

/// `Retry-After` as delta-seconds or an HTTP date, at most [`MAX_RETRY_HINT`].
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_HINT));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delta = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Some(delta.min(MAX_RETRY_HINT))
}
