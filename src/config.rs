//! Weaver configuration.

use serde_derive::Deserialize;
use std::time::Duration;

/// Global configuration options used to drive a weaving session.
///
/// This structure exposes a builder-like interface and is primarily consumed
/// by [`Weaver::new`](crate::Weaver::new).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WeaverConfig {
    pub(crate) smart: bool,
    pub(crate) matcher_timeout: Duration,
    pub(crate) max_in_a_row: usize,
    pub(crate) indent: usize,
}

impl Default for WeaverConfig {
    fn default() -> Self {
        WeaverConfig {
            smart: true,
            matcher_timeout: Duration::from_secs(120),
            max_in_a_row: usize::MAX,
            indent: 2,
        }
    }
}

impl WeaverConfig {
    /// Creates a new configuration object with the default configuration
    /// specified.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures whether advice is applied in smart mode by default.
    ///
    /// Smart mode preserves the typing of the WebAssembly value stack by
    /// spilling the advice result into fresh locals.
    ///
    /// This is `true` by default.
    pub fn smart(&mut self, enable: bool) -> &mut Self {
        self.smart = enable;
        self
    }

    /// Configures the wall-clock budget given to an external pattern matcher.
    ///
    /// This is 120 seconds by default.
    pub fn matcher_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.matcher_timeout = timeout;
        self
    }

    /// Configures the default group size used when rearranging consecutive
    /// join-points.
    pub fn max_in_a_row(&mut self, max: usize) -> &mut Self {
        self.max_in_a_row = max.max(1);
        self
    }

    /// Configures the number of spaces per nesting level in indented output.
    pub fn indent(&mut self, spaces: usize) -> &mut Self {
        self.indent = spaces;
        self
    }

    /// Returns whether smart mode is the default.
    pub fn is_smart(&self) -> bool {
        self.smart
    }

    /// Returns the pattern matcher timeout.
    pub fn timeout(&self) -> Duration {
        self.matcher_timeout
    }

    /// Returns the default rearrangement group size.
    pub fn group_size(&self) -> usize {
        self.max_in_a_row
    }

    /// Returns the indentation width.
    pub fn indent_width(&self) -> usize {
        self.indent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WeaverConfig::new();
        assert!(config.is_smart());
        assert_eq!(config.timeout(), Duration::from_secs(120));
        assert_eq!(config.indent_width(), 2);
    }

    #[test]
    fn builder() {
        let mut config = WeaverConfig::new();
        config.smart(false).max_in_a_row(0).indent(4);
        assert!(!config.is_smart());
        assert_eq!(config.group_size(), 1);
        assert_eq!(config.indent_width(), 4);
    }

    #[test]
    fn deserialize_partial() {
        let config: WeaverConfig = serde_json::from_str(r#"{ "smart": false }"#).unwrap();
        assert!(!config.is_smart());
        assert_eq!(config.indent_width(), 2);
    }
}
