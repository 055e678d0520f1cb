use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::circuit::CircuitIdFactory;
use crate::delivery::DeliveryOptions;
use crate::persistence::PausedStoreOptions;
use crate::registry::RegistryOptions;
use crate::stream::StreamOptions;

#[derive(Clone)]
pub struct CircuitOptions {
    pub disconnected_max_retained: usize,
    pub disconnected_retention: Duration,
    pub eviction_scan_interval: Duration,
    pub max_unacked_batches: usize,
    pub detailed_errors: bool,
    pub max_chunk_bytes: usize,
    pub max_stream_bytes: u64,
    pub chunk_timeout: Duration,
    pub paused_max_retained: usize,
    pub paused_retention: Duration,
    pub token_secret: Option<Vec<u8>>,
}

impl Default for CircuitOptions {
    fn default() -> Self {
        Self {
            disconnected_max_retained: 100,
            disconnected_retention: Duration::from_secs(3 * 60),
            eviction_scan_interval: Duration::from_secs(1),
            max_unacked_batches: 10,
            detailed_errors: false,
            max_chunk_bytes: 32 * 1024,
            max_stream_bytes: 16 * 1024 * 1024,
            chunk_timeout: Duration::from_secs(60),
            paused_max_retained: 1000,
            paused_retention: Duration::from_secs(2 * 60 * 60),
            token_secret: None,
        }
    }
}

impl fmt::Debug for CircuitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitOptions")
            .field("disconnected_max_retained", &self.disconnected_max_retained)
            .field("disconnected_retention", &self.disconnected_retention)
            .field("eviction_scan_interval", &self.eviction_scan_interval)
            .field("max_unacked_batches", &self.max_unacked_batches)
            .field("detailed_errors", &self.detailed_errors)
            .field("max_chunk_bytes", &self.max_chunk_bytes)
            .field("max_stream_bytes", &self.max_stream_bytes)
            .field("chunk_timeout", &self.chunk_timeout)
            .field("paused_max_retained", &self.paused_max_retained)
            .field("paused_retention", &self.paused_retention)
            .field("token_secret", &self.token_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CircuitOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds options from an arbitrary variable source. Unset variables take
    /// their defaults; invalid ones are logged and also take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            disconnected_max_retained: parse_env(
                &lookup,
                "CIRCUIT_DISCONNECTED_MAX_RETAINED",
                defaults.disconnected_max_retained,
                0,
            ),
            disconnected_retention: parse_millis_env(
                &lookup,
                "CIRCUIT_DISCONNECTED_RETENTION_MS",
                defaults.disconnected_retention,
                1,
            ),
            eviction_scan_interval: parse_millis_env(
                &lookup,
                "CIRCUIT_EVICTION_SCAN_MS",
                defaults.eviction_scan_interval,
                1,
            ),
            max_unacked_batches: parse_env(
                &lookup,
                "CIRCUIT_MAX_UNACKED_BATCHES",
                defaults.max_unacked_batches,
                1,
            ),
            detailed_errors: lookup("CIRCUIT_DETAILED_ERRORS")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.detailed_errors),
            max_chunk_bytes: parse_env(
                &lookup,
                "CIRCUIT_MAX_CHUNK_BYTES",
                defaults.max_chunk_bytes,
                1,
            ),
            max_stream_bytes: parse_env(
                &lookup,
                "CIRCUIT_MAX_STREAM_BYTES",
                defaults.max_stream_bytes,
                1,
            ),
            chunk_timeout: parse_millis_env(
                &lookup,
                "CIRCUIT_CHUNK_TIMEOUT_MS",
                defaults.chunk_timeout,
                1,
            ),
            paused_max_retained: parse_env(
                &lookup,
                "CIRCUIT_PAUSED_MAX_RETAINED",
                defaults.paused_max_retained,
                0,
            ),
            paused_retention: parse_millis_env(
                &lookup,
                "CIRCUIT_PAUSED_RETENTION_MS",
                defaults.paused_retention,
                1,
            ),
            token_secret: lookup("CIRCUIT_TOKEN_SECRET").and_then(|value| {
                match hex::decode(value.trim()) {
                    Ok(secret) if !secret.is_empty() => Some(secret),
                    Ok(_) => None,
                    Err(err) => {
                        warn!(
                            target = "circuit_host::config",
                            error = %err,
                            "CIRCUIT_TOKEN_SECRET is not valid hex; using a random secret"
                        );
                        None
                    }
                }
            }),
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            max_retained: self.disconnected_max_retained,
            retention: self.disconnected_retention,
            scan_interval: self.eviction_scan_interval,
            entry_cost: 1,
        }
    }

    pub fn delivery_options(&self) -> DeliveryOptions {
        DeliveryOptions {
            max_unacked_batches: self.max_unacked_batches,
            ..DeliveryOptions::default()
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            max_chunk_bytes: self.max_chunk_bytes,
            max_stream_bytes: self.max_stream_bytes,
            chunk_timeout: self.chunk_timeout,
        }
    }

    pub fn paused_store_options(&self) -> PausedStoreOptions {
        PausedStoreOptions {
            max_retained: self.paused_max_retained,
            retention: self.paused_retention,
            scan_interval: self.eviction_scan_interval,
        }
    }

    pub fn id_factory(&self) -> CircuitIdFactory {
        match &self.token_secret {
            Some(secret) => CircuitIdFactory::new(secret.clone()),
            None => CircuitIdFactory::random(),
        }
    }
}

fn parse_env<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: T, min: T) -> T
where
    T: FromStr + PartialOrd + Copy + fmt::Display,
    T::Err: fmt::Display,
{
    let Some(value) = lookup(var) else {
        return default;
    };
    match value.trim().parse::<T>() {
        Ok(parsed) if parsed >= min => parsed,
        Ok(parsed) => {
            warn!(
                target = "circuit_host::config",
                var,
                %parsed,
                %min,
                %default,
                "config value below minimum; using default"
            );
            default
        }
        Err(err) => {
            warn!(
                target = "circuit_host::config",
                var,
                error = %err,
                %default,
                "failed to parse config value; using default"
            );
            default
        }
    }
}

fn parse_millis_env(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: Duration,
    min_ms: u64,
) -> Duration {
    let millis = parse_env(lookup, var, default.as_millis() as u64, min_ms);
    Duration::from_millis(millis)
}
