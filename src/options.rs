use std::time::Duration;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

/// Batching policy for a [`Batcher`](crate::Batcher) or
/// [`StreamBatcher`](crate::StreamBatcher).
///
/// A batch is dispatched as soon as it holds `max_batch_size` requests, or
/// when `batch_wait_timeout` has elapsed since the first request in the batch
/// arrived, whichever comes first. A zero timeout dispatches whatever is
/// already queued without waiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingOptions {
    /// Upper bound on the number of requests in a batch. Must be positive.
    #[serde(deserialize_with = "de_max_batch_size")]
    pub max_batch_size: usize,
    /// How long to hold an under-full batch open for more arrivals, measured
    /// from the arrival of its first request.
    #[serde(rename = "batch_wait_timeout_s", with = "timeout_secs")]
    pub batch_wait_timeout: Duration,
}

impl Default for BatchingOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            batch_wait_timeout: Duration::ZERO,
        }
    }
}

impl BatchingOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_batch_size > 0, "max_batch_size must be positive");
        Ok(())
    }
}

/// Deployment specs frequently carry numbers as reals, so `5.0` is accepted
/// where an integer is meant. Non-integral and negative values are rejected.
fn de_max_batch_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct SizeVisitor;

    impl serde::de::Visitor<'_> for SizeVisitor {
        type Value = usize;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "an integer (integer-valued reals are accepted)")
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<usize, E> {
            usize::try_from(v).map_err(E::custom)
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<usize, E> {
            if v < 0 {
                return Err(E::custom("max_batch_size must not be negative"));
            }
            Ok(v as usize)
        }

        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<usize, E> {
            if !v.is_finite() || v.fract() != 0.0 {
                return Err(E::custom("max_batch_size must be a whole number"));
            }
            if v < 0.0 {
                return Err(E::custom("max_batch_size must not be negative"));
            }
            Ok(v as usize)
        }
    }

    deserializer.deserialize_any(SizeVisitor)
}

mod timeout_secs {
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct SecondsVisitor;

        impl serde::de::Visitor<'_> for SecondsVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "a non-negative number of seconds")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Duration, E> {
                if v < 0 {
                    return Err(E::custom("batch_wait_timeout_s must be non-negative"));
                }
                Ok(Duration::from_secs(v as u64))
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Duration, E> {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("batch_wait_timeout_s must be non-negative"));
                }
                Duration::try_from_secs_f64(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SecondsVisitor)
    }
}
