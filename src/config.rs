/* Clone job configuration.
 *
 * Carries the whole option surface a frontend exposes. The pipeline itself
 * consumes the identities, the interception flag and the identity payload;
 * label, locale and the behavior flags pass through for the surrounding
 * tooling to pick up from the result.
 */

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Absolute path to the source APK.
    pub source_apk: PathBuf,
    pub source_package: String,
    pub clone_package: String,
    pub output_dir: PathBuf,

    /// Display label override for the clone.
    #[serde(default)]
    pub label: Option<String>,
    /// Forced locale, e.g. "en-US".
    #[serde(default)]
    pub locale: Option<String>,

    /// Whether identity calls are redirected to the interception stubs.
    #[serde(default = "default_true")]
    pub enable_interception: bool,
    /// Spoofed identity values keyed by payload name ("imei", "ssid", ...).
    #[serde(default)]
    pub identity: BTreeMap<String, String>,

    /// Forwarded to the clone at runtime; not interpreted here.
    #[serde(default = "default_true")]
    pub forward_notifications: bool,
    #[serde(default)]
    pub keep_lifecycle_events: bool,
}

fn default_true() -> bool {
    true
}

impl CloneConfig {
    pub fn new(
        source_apk: impl Into<PathBuf>,
        source_package: &str,
        clone_package: &str,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        CloneConfig {
            source_apk: source_apk.into(),
            source_package: source_package.to_string(),
            clone_package: clone_package.to_string(),
            output_dir: output_dir.into(),
            label: None,
            locale: None,
            enable_interception: true,
            identity: BTreeMap::new(),
            forward_notifications: true,
            keep_lifecycle_events: false,
        }
    }

    /// The identity payload as a JSON object, escaped for embedding as a
    /// string constant in the stub pool.
    pub fn identity_json(&self) -> String {
        let mut out = String::from("{");
        for (i, (key, value)) in self.identity.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push('"');
            out.push_str(&escape(key));
            out.push_str("\":\"");
            out.push_str(&escape(value));
            out.push('"');
        }
        out.push('}');
        out
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

/// Deterministic clone package name: `com.app` -> `com.app.clone1`.
pub fn clone_package_name(source_package: &str, index: u32) -> String {
    format!("{source_package}.clone{index}")
}
