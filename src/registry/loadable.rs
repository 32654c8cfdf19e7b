//! Externally-defined loadable objects.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{CinderError, Result};
use crate::registry::config::Config;

/// How long a loaded object stays fresh, in seconds.
///
/// The registry draws the next update time uniformly from
/// `[min_sec, max_sec]` after each successful load. A lifetime of
/// exactly `(0, 0)` disables updates; `max_sec < min_sec` marks the
/// object non-updateable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lifetime {
    pub min_sec: u64,
    pub max_sec: u64,
}

impl Lifetime {
    pub fn new(min_sec: u64, max_sec: u64) -> Self {
        Self { min_sec, max_sec }
    }

    /// Parse `{min, max}` or a bare seconds value.
    pub fn from_config(config: &Config, prefix: &str) -> Result<Self> {
        let min_key = format!("{}.min", prefix);
        let lifetime = if config.has(&min_key) {
            let min_sec = config.get_u64(&min_key).ok_or_else(|| {
                CinderError::config(format!("'{}' must be an integer", min_key))
            })?;
            let max_key = format!("{}.max", prefix);
            let max_sec = config.get_u64(&max_key).ok_or_else(|| {
                CinderError::config(format!("'{}' is required next to '{}'", max_key, min_key))
            })?;
            Self { min_sec, max_sec }
        } else {
            let seconds = config.get_u64(prefix).ok_or_else(|| {
                CinderError::config(format!("'{}' must be an integer or a {{min, max}} pair", prefix))
            })?;
            Self {
                min_sec: seconds,
                max_sec: seconds,
            }
        };

        if lifetime.min_sec > lifetime.max_sec {
            return Err(CinderError::config(format!(
                "Lifetime min_sec can't be greater than max_sec. min_sec={} max_sec={}",
                lifetime.min_sec, lifetime.max_sec
            )));
        }
        Ok(lifetime)
    }

    /// A lifetime of exactly `(0, 0)` disables background updates.
    pub fn is_zero(&self) -> bool {
        self.min_sec == 0 && self.max_sec == 0
    }
}

/// An externally-configured object managed by the loadable registry.
pub trait Loadable: Debug + Send + Sync {
    /// Return this object as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Name, unique within its provenance namespace.
    fn name(&self) -> &str;

    /// Update window.
    fn lifetime(&self) -> Lifetime;

    /// Whether background updates make sense for this object.
    fn supports_updates(&self) -> bool;

    /// Whether the underlying source changed since the last load.
    fn is_modified(&self) -> bool;

    /// Build a fresh version of this object.
    ///
    /// Construction failure is a value: the registry captures the error
    /// in the entry and schedules a retry with backoff.
    fn clone_loadable(&self) -> Result<Arc<dyn Loadable>>;
}
