//! Serialized render payload.
//!
//! The server embeds every query it resolved in time as an ordered list of
//! `{key, value}` entries, in discovery order. The client reads the list back
//! before building its own queries so server-resolved data is not fetched a
//! second time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PayloadError;

/// One resolved query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEntry {
    pub key: String,
    pub value: Value,
}

/// Resolved query values, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderPayload {
    entries: Vec<PayloadEntry>,
}

impl RenderPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. An existing entry with the same key keeps its position
    /// and takes the new value.
    pub fn push(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => entry.value = value,
            None => self.entries.push(PayloadEntry { key, value }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn entries(&self) -> &[PayloadEntry] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge `other` into this payload, `other` winning on conflicts.
    pub fn extend(&mut self, other: RenderPayload) {
        for entry in other.entries {
            self.push(entry.key, entry.value);
        }
    }

    pub fn to_json(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, PayloadError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Generates a classic `<script>` assigning the payload to `window.{var}`.
    ///
    /// # Errors
    ///
    /// [`PayloadError::InvalidVar`] when `var` is not a plain JavaScript
    /// identifier.
    pub fn to_script_tag(&self, var: &str) -> Result<String, PayloadError> {
        if !is_js_identifier(var) {
            return Err(PayloadError::InvalidVar(var.to_string()));
        }
        let json = escape_json_for_script(&self.to_json()?);
        Ok(format!(r#"<script id="lattice-data">window.{var} = {json};</script>"#))
    }

    /// Read a payload back from the body of a script produced by
    /// [`RenderPayload::to_script_tag`].
    pub fn from_script(body: &str) -> Result<Self, PayloadError> {
        let start = body
            .find('[')
            .ok_or_else(|| PayloadError::Frame("payload script has no entry list".to_string()))?;
        let end = body
            .rfind(']')
            .filter(|end| *end >= start)
            .ok_or_else(|| PayloadError::Frame("payload script is truncated".to_string()))?;
        Self::from_json(&body[start..=end])
    }
}

fn is_js_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let head = |c: char| c.is_ascii_alphabetic() || c == '_' || c == '$';
    chars.next().is_some_and(head) && chars.all(|c| head(c) || c.is_ascii_digit())
}

/// Escapes `</` so the payload cannot close its script element. JSON reads
/// `<\/` back as `</`.
fn escape_json_for_script(json: &str) -> String {
    json.replace("</", "<\\/").replace("<!--", "<\\u0021--")
}
