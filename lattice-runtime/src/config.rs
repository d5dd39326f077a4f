//! Render configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-query timeout of the server render.
pub const DEFAULT_SSR_TIMEOUT: Duration = Duration::from_millis(100);

/// Default global the payload script assigns to.
pub const DEFAULT_PAYLOAD_VAR: &str = "__LATTICE_DATA__";

/// Options for server rendering.
///
/// Deserializes from configuration files with the timeout in milliseconds:
///
/// ```rust
/// use lattice_runtime::RenderOptions;
///
/// let options = RenderOptions::from_json(r#"{"ssr_timeout_ms": 0}"#).unwrap();
/// assert!(options.ssr_timeout.is_zero());
/// assert!(options.include_payload);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// How long the render waits for each query. Zero disables data loading
    /// on the server entirely.
    #[serde(rename = "ssr_timeout_ms", with = "duration_ms")]
    pub ssr_timeout: Duration,

    /// Global variable the payload script assigns to.
    pub payload_var: String,

    /// Whether to produce the payload script at all.
    pub include_payload: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            ssr_timeout: DEFAULT_SSR_TIMEOUT,
            payload_var: DEFAULT_PAYLOAD_VAR.to_string(),
            include_payload: true,
        }
    }
}

impl RenderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-query timeout.
    pub fn ssr_timeout(mut self, timeout: Duration) -> Self {
        self.ssr_timeout = timeout;
        self
    }

    /// Disables server data loading (same as a zero timeout).
    pub fn no_data(self) -> Self {
        self.ssr_timeout(Duration::ZERO)
    }

    pub fn payload_var(mut self, var: impl Into<String>) -> Self {
        self.payload_var = var.into();
        self
    }

    pub fn without_payload(mut self) -> Self {
        self.include_payload = false;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = RenderOptions::default();
        assert_eq!(options.ssr_timeout, Duration::from_millis(100));
        assert_eq!(options.payload_var, "__LATTICE_DATA__");
        assert!(options.include_payload);
    }

    #[test]
    fn builder() {
        let options = RenderOptions::new()
            .ssr_timeout(Duration::from_millis(250))
            .payload_var("__APP__")
            .without_payload();
        assert_eq!(options.ssr_timeout, Duration::from_millis(250));
        assert_eq!(options.payload_var, "__APP__");
        assert!(!options.include_payload);
        assert!(RenderOptions::new().no_data().ssr_timeout.is_zero());
    }

    #[test]
    fn json_roundtrip_uses_milliseconds() {
        let options = RenderOptions::new().ssr_timeout(Duration::from_millis(42));
        let json = serde_json::to_string(&options).unwrap();
        assert!(json.contains("\"ssr_timeout_ms\":42"));
        assert_eq!(RenderOptions::from_json(&json).unwrap(), options);
    }
}
