// ABOUTME: Environment-based configuration for credentials, timing knobs and outputs
// ABOUTME: Reads LVCONNECT_* variables with the CUSTOMCONNSTR_ prefix fallback
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::retry::RetryPolicy;
use crate::upload::NightscoutTarget;

/// Nightscout refuses short secrets; enforce the same bound before the
/// first upload instead of at upload time
pub const MIN_SECRET_LENGTH: usize = 12;

/// Daemon poll interval bounds: no shorter than 5 minutes, no longer
/// than 8 hours
const MIN_INTERVAL_MS: u64 = 300_000;
const MAX_INTERVAL_MS: u64 = 28_800_000;
const DEFAULT_INTERVAL_MS: u64 = 3_600_000;

/// LibreView account credentials and patient selection
#[derive(Debug, Clone)]
pub struct LoginConfig {
    /// Account email
    pub account_name: String,
    /// Account password
    pub password: String,
    /// Device-trust token presented as the login fingerprint
    pub trusted_device_token: String,
    /// Patient to sync; required for professional (managing) accounts
    pub patient_id: Option<String>,
    /// Remote credential-bundle URL for centrally managed deployments
    pub pro_credentials_url: Option<String>,
    /// Key selecting this bridge's entry within the credential bundle
    pub pro_credentials_key: Option<String>,
}

/// Full configuration bundle, read-only to the pipeline except where the
/// credential resolver overwrites rotated login details
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Login descriptor
    pub login: LoginConfig,
    /// Region code or explicit vendor hostname, resolved at engine start
    pub server: String,
    /// Dashboard endpoint; optional when a store callback is injected
    pub nightscout: Option<NightscoutTarget>,
    /// Attempt budget for the combined authenticate-and-fetch stage
    pub max_failures: u32,
    /// Lookback window in days for the very first sync of a process
    pub first_full_days: i64,
    /// Local UTC offset in minutes, applied to vendor timestamps
    pub time_offset_minutes: i64,
    /// Delay between report-completion polls
    pub poll_interval: Duration,
    /// Attempt budget for the report-completion poll
    pub poll_max_attempts: u32,
    /// Hard per-request timeout
    pub fetch_timeout: Duration,
    /// Daemon-mode pause between runs, clamped to [5 min, 8 h]
    pub interval: Duration,
    /// Extra protocol chatter in logs
    pub debug: bool,
}

impl ConnectConfig {
    /// Build the configuration from `LVCONNECT_*` environment variables.
    ///
    /// Variables are also looked up under the `CUSTOMCONNSTR_` prefix and
    /// in lowercase, matching how hosted deployments expose settings.
    ///
    /// # Errors
    ///
    /// Fails when account credentials are missing, when a numeric knob
    /// does not parse, or when the configured API secret is shorter than
    /// [`MIN_SECRET_LENGTH`].
    pub fn from_env() -> Result<Self> {
        let account_name = read_env("LVCONNECT_USER_NAME")
            .or_else(|| read_env("LVCONNECT_PRO_USER_NAME"))
            .context("LVCONNECT_USER_NAME (or LVCONNECT_PRO_USER_NAME) must be set")?;
        let password = read_env("LVCONNECT_PASSWORD")
            .or_else(|| read_env("LVCONNECT_PRO_PASSWORD"))
            .context("LVCONNECT_PASSWORD (or LVCONNECT_PRO_PASSWORD) must be set")?;
        let trusted_device_token = read_env("LVCONNECT_TRUSTED_DEVICE_TOKEN")
            .or_else(|| read_env("LVCONNECT_PRO_TRUSTED_DEVICE_TOKEN"))
            .context(
                "LVCONNECT_TRUSTED_DEVICE_TOKEN (or LVCONNECT_PRO_TRUSTED_DEVICE_TOKEN) must be set",
            )?;

        let nightscout = match read_env("NS").or_else(|| {
            read_env("WEBSITE_HOSTNAME").map(|host| format!("https://{host}"))
        }) {
            Some(endpoint) => {
                let secret = read_env("API_SECRET").context("API_SECRET must be set")?;
                if secret.len() < MIN_SECRET_LENGTH {
                    bail!("API_SECRET should be at least {MIN_SECRET_LENGTH} characters long");
                }
                Some(NightscoutTarget::new(endpoint, secret))
            }
            None => None,
        };

        Ok(Self {
            login: LoginConfig {
                account_name,
                password,
                trusted_device_token,
                patient_id: read_env("LVCONNECT_PATIENT_ID"),
                pro_credentials_url: read_env("LVCONNECT_PRO_CREDENTIALS_URL"),
                pro_credentials_key: read_env("LVCONNECT_PRO_CREDENTIALS_KEY"),
            },
            server: read_env("LVCONNECT_SERVER").unwrap_or_else(|| "api.libreview.io".to_owned()),
            nightscout,
            max_failures: parse_env("LVCONNECT_MAX_FAILURES", 3)?,
            first_full_days: parse_env("LVCONNECT_FIRST_FULL_DAYS", 90)?,
            time_offset_minutes: match read_env("LVCONNECT_TIME_OFFSET") {
                Some(raw) => raw
                    .parse()
                    .context("LVCONNECT_TIME_OFFSET must be an integer number of minutes")?,
                None => system_offset_minutes(),
            },
            poll_interval: Duration::from_millis(parse_env("LVCONNECT_POLL_INTERVAL", 2_000)?),
            poll_max_attempts: parse_env("LVCONNECT_POLL_MAX_ATTEMPTS", 10)?,
            fetch_timeout: Duration::from_millis(parse_env("LVCONNECT_FETCH_TIMEOUT", 30_000)?),
            interval: Duration::from_millis(clamp_interval(parse_env(
                "LVCONNECT_INTERVAL",
                DEFAULT_INTERVAL_MS,
            )?)),
            debug: read_env("LVCONNECT_DEBUG").is_some(),
        })
    }

    /// Local UTC offset in seconds, the correction applied to every
    /// vendor timestamp and to report window bounds
    #[must_use]
    pub fn local_offset_secs(&self) -> i64 {
        self.time_offset_minutes * 60
    }

    /// Retry policy for the combined authenticate-and-fetch stage
    #[must_use]
    pub fn auth_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            min_delay: Duration::from_secs(3),
            max_attempts: self.max_failures.max(1),
            backoff_factor: 1.5,
        }
    }

    /// Retry policy for the report-completion poll: shorter delay, no
    /// backoff growth, and its own attempt budget
    #[must_use]
    pub fn poll_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            min_delay: self.poll_interval,
            max_attempts: self.poll_max_attempts.max(1),
            backoff_factor: 1.0,
        }
    }
}

/// Clamp a daemon interval to the supported range, falling back to the
/// default for out-of-range values
pub(crate) fn clamp_interval(ms: u64) -> u64 {
    if (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&ms) {
        ms
    } else {
        DEFAULT_INTERVAL_MS
    }
}

/// Minutes west of UTC for the system timezone, matching the sign the
/// original bridge inherited from its runtime
fn system_offset_minutes() -> i64 {
    let east_secs = i64::from(chrono::Local::now().offset().local_minus_utc());
    -east_secs / 60
}

fn read_env(name: &str) -> Option<String> {
    // Some hosting platforms expose connection settings under this prefix
    env::var(format!("CUSTOMCONNSTR_{name}"))
        .or_else(|_| env::var(format!("CUSTOMCONNSTR_{}", name.to_lowercase())))
        .or_else(|_| env::var(name))
        .or_else(|_| env::var(name.to_lowercase()))
        .ok()
        .filter(|value| !value.is_empty())
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match read_env(name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{name} has an invalid value: {raw}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_clamped_to_supported_range() {
        assert_eq!(clamp_interval(1_000), DEFAULT_INTERVAL_MS);
        assert_eq!(clamp_interval(MIN_INTERVAL_MS), MIN_INTERVAL_MS);
        assert_eq!(clamp_interval(MAX_INTERVAL_MS + 1), DEFAULT_INTERVAL_MS);
        assert_eq!(clamp_interval(7_200_000), 7_200_000);
    }
}
