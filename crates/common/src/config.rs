use std::env;
use std::time::Duration;

use errors::ErrorMetadata;

/// Packager runtime configuration. Read once at startup from the process
/// environment; nothing in the packaging pipeline reloads it mid-flight
/// (spec's "read-only after startup" note applies here too).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackagerConfig {
    /// `synapse.poll.interval.millis`: sleep between poll attempts.
    pub poll_interval: Duration,
    /// `synapse.poll.max.tries`: poll retry cap, must be > 0.
    pub poll_max_tries: u32,
    /// `udd.synapse.url.expiration.hours`: pre-signed URL lifetime.
    pub url_expiration_hours: i64,
    /// `udd.userdata.bucket`: destination bucket for archives.
    pub userdata_bucket: String,
}

const ENV_POLL_INTERVAL_MILLIS: &str = "SYNAPSE_POLL_INTERVAL_MILLIS";
const ENV_POLL_MAX_TRIES: &str = "SYNAPSE_POLL_MAX_TRIES";
const ENV_URL_EXPIRATION_HOURS: &str = "UDD_SYNAPSE_URL_EXPIRATION_HOURS";
const ENV_USERDATA_BUCKET: &str = "UDD_USERDATA_BUCKET";

impl PackagerConfig {
    /// Load from environment variables, applying the same defaults a fresh
    /// deployment would ship with.
    pub fn from_env() -> anyhow::Result<Self> {
        let poll_interval_millis = read_u64(ENV_POLL_INTERVAL_MILLIS, 1_000)?;
        let poll_max_tries = read_u32(ENV_POLL_MAX_TRIES, 30)?;
        let url_expiration_hours = read_i64(ENV_URL_EXPIRATION_HOURS, 12)?;
        let userdata_bucket = env::var(ENV_USERDATA_BUCKET)
            .unwrap_or_else(|_| "userdata".to_string());

        Self::new(
            Duration::from_millis(poll_interval_millis),
            poll_max_tries,
            url_expiration_hours,
            userdata_bucket,
        )
    }

    pub fn new(
        poll_interval: Duration,
        poll_max_tries: u32,
        url_expiration_hours: i64,
        userdata_bucket: impl Into<String>,
    ) -> anyhow::Result<Self> {
        if poll_max_tries == 0 {
            anyhow::bail!(ErrorMetadata::fatal(
                "InvalidConfig",
                "synapse.poll.max.tries must be > 0",
            ));
        }
        if url_expiration_hours <= 0 {
            anyhow::bail!(ErrorMetadata::fatal(
                "InvalidConfig",
                "udd.synapse.url.expiration.hours must be > 0",
            ));
        }
        Ok(Self {
            poll_interval,
            poll_max_tries,
            url_expiration_hours,
            userdata_bucket: userdata_bucket.into(),
        })
    }
}

fn read_u64(key: &str, default: u64) -> anyhow::Result<u64> {
    match env::var(key) {
        Ok(v) => v.parse().map_err(|_| {
            anyhow::Error::new(ErrorMetadata::fatal(
                "InvalidConfig",
                format!("{key} must be a non-negative integer"),
            ))
        }),
        Err(_) => Ok(default),
    }
}

fn read_u32(key: &str, default: u32) -> anyhow::Result<u32> {
    match env::var(key) {
        Ok(v) => v.parse().map_err(|_| {
            anyhow::Error::new(ErrorMetadata::fatal(
                "InvalidConfig",
                format!("{key} must be a positive integer"),
            ))
        }),
        Err(_) => Ok(default),
    }
}

fn read_i64(key: &str, default: i64) -> anyhow::Result<i64> {
    match env::var(key) {
        Ok(v) => v.parse().map_err(|_| {
            anyhow::Error::new(ErrorMetadata::fatal(
                "InvalidConfig",
                format!("{key} must be an integer"),
            ))
        }),
        Err(_) => Ok(default),
    }
}
