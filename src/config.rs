use crate::inspect::{MalformedPartPolicy, Whitelist, DEFAULT_HEADER_INSPECT_SIZE};
use crate::output::DEFAULT_QUEUE_SIZE;
use anyhow::Context;
use log::LevelFilter;
use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/opensmtpd-filter-mimetype.yaml";
pub const DEFAULT_LOG_TAG: &str = "mime-filter";
const DEFAULT_SCANNER_BUFFER_MB: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_tag: String,
    pub log_level: String,
    #[serde(deserialize_with = "lenient_int")]
    pub scanner_buffer_max_mb: Option<i64>,
    pub allowed_mime_types: Vec<String>,
    #[serde(deserialize_with = "lenient_int")]
    pub header_inspect_size: Option<i64>,
    #[serde(deserialize_with = "lenient_int")]
    pub max_inspect_bytes: Option<i64>,
    #[serde(deserialize_with = "lenient_int")]
    pub output_queue_size: Option<i64>,
    pub require_headers: bool,
    pub malformed_parts: MalformedPartPolicy,
    pub inspect_single_part: bool,
}

// Numbers in hand-edited files show up as strings, floats or nothing at all;
// anything that is not an integer reads as unset.
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_yaml::Value::Number(n) => n.as_i64(),
        serde_yaml::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn positive(value: Option<i64>) -> Option<u64> {
    value.filter(|v| *v > 0).map(|v| v as u64)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_tag: DEFAULT_LOG_TAG.to_string(),
            log_level: "info".to_string(),
            scanner_buffer_max_mb: Some(DEFAULT_SCANNER_BUFFER_MB as i64),
            allowed_mime_types: Vec::new(),
            header_inspect_size: Some(DEFAULT_HEADER_INSPECT_SIZE as i64),
            max_inspect_bytes: Some(0),
            output_queue_size: Some(DEFAULT_QUEUE_SIZE as i64),
            require_headers: false,
            malformed_parts: MalformedPartPolicy::Skip,
            inspect_single_part: true,
        }
    }
}

impl Config {
    /// Starting point written by `--generate-config`.
    pub fn example() -> Self {
        Config {
            allowed_mime_types: [
                "application/pdf",
                "image/png",
                "image/jpeg",
                "image/gif",
            ]
            .iter()
            .map(|t| t.to_string())
            .collect(),
            ..Default::default()
        }
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration file: {path}"))?;
        Ok(())
    }

    pub fn log_tag(&self) -> &str {
        let tag = self.log_tag.trim();
        if tag.is_empty() {
            DEFAULT_LOG_TAG
        } else {
            tag
        }
    }

    pub fn level_filter(&self) -> LevelFilter {
        match self.log_level.trim().to_ascii_lowercase().as_str() {
            "debug" => LevelFilter::Debug,
            "warn" | "warning" => LevelFilter::Warn,
            "error" => LevelFilter::Error,
            _ => LevelFilter::Info,
        }
    }

    pub fn whitelist(&self) -> Whitelist {
        Whitelist::new(&self.allowed_mime_types)
    }

    pub fn header_inspect_size(&self) -> usize {
        positive(self.header_inspect_size)
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(DEFAULT_HEADER_INSPECT_SIZE)
    }

    /// Zero disables draining.
    pub fn max_inspect_bytes(&self) -> u64 {
        positive(self.max_inspect_bytes).unwrap_or(0)
    }

    /// Longest control line accepted, in bytes.
    pub fn max_line_bytes(&self) -> usize {
        let mb = positive(self.scanner_buffer_max_mb)
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(DEFAULT_SCANNER_BUFFER_MB);
        mb.saturating_mul(1024 * 1024)
    }

    /// Settings that were present but unusable and fell back to defaults.
    pub fn fallback_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let level = self.log_level.trim().to_ascii_lowercase();
        let known = ["debug", "info", "warn", "warning", "error"];
        if !level.is_empty() && !known.contains(&level.as_str()) {
            warnings.push(format!("Unknown log_level '{}', using info", self.log_level));
        }
        for (key, value) in [
            ("scanner_buffer_max_mb", self.scanner_buffer_max_mb),
            ("header_inspect_size", self.header_inspect_size),
            ("output_queue_size", self.output_queue_size),
        ] {
            if matches!(value, Some(v) if v <= 0) {
                warnings.push(format!("{key} must be positive, using the default"));
            }
        }
        warnings
    }

    pub fn output_queue_size(&self) -> usize {
        positive(self.output_queue_size)
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(DEFAULT_QUEUE_SIZE)
    }
}
