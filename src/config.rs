//! Composition options
//!
//! ```rust,ignore
//! use streamsplice::{ComposeOptions, CancelHandle};
//!
//! let signal = CancelHandle::new();
//! let options = ComposeOptions::builder()
//!     .label("ingest")
//!     .teardown_timeout(std::time::Duration::from_secs(5))
//!     .signal(signal.clone())
//!     .build();
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::cancel::CancelHandle;

pub const ENV_LABEL: &str = "STREAMSPLICE_LABEL";
pub const ENV_TEARDOWN_TIMEOUT_MS: &str = "STREAMSPLICE_TEARDOWN_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

/// Whole milliseconds in `duration`, clamped to `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Options accepted by [`compose_with`](crate::compose_with).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeOptions {
    /// Name attached to the composition's tracing span.
    pub label: Option<String>,
    /// Upper bound on waiting for stages to close during teardown.
    pub teardown_timeout_ms: Option<u64>,
    /// Abort signal; cancelling it destroys the composed unit.
    #[serde(skip)]
    pub signal: Option<CancelHandle>,
}

impl ComposeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> ComposeOptionsBuilder {
        ComposeOptionsBuilder::default()
    }

    /// Read `STREAMSPLICE_LABEL` and `STREAMSPLICE_TEARDOWN_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        if let Some(label) = lookup(ENV_LABEL).filter(|label| !label.is_empty()) {
            builder = builder.label(label);
        }
        if let Some(raw) = lookup(ENV_TEARDOWN_TIMEOUT_MS) {
            let millis = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    var: ENV_TEARDOWN_TIMEOUT_MS,
                    value: raw.clone(),
                })?;
            builder = builder.teardown_timeout(Duration::from_millis(millis));
        }
        Ok(builder.build())
    }

    pub fn teardown_timeout(&self) -> Option<Duration> {
        self.teardown_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout_ms = Some(saturating_millis(timeout));
        self
    }

    pub fn with_signal(mut self, signal: CancelHandle) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Builder for [`ComposeOptions`].
#[derive(Debug, Default)]
pub struct ComposeOptionsBuilder {
    label: Option<String>,
    teardown_timeout: Option<Duration>,
    signal: Option<CancelHandle>,
}

impl ComposeOptionsBuilder {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = Some(timeout);
        self
    }

    pub fn signal(mut self, signal: CancelHandle) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn build(self) -> ComposeOptions {
        ComposeOptions {
            label: self.label,
            teardown_timeout_ms: self.teardown_timeout.map(saturating_millis),
            signal: self.signal,
        }
    }
}
