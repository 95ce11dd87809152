//! Runtime settings for ingestion and inference.

use serde::Deserialize;

/// Rows per engine page during bulk ingestion.
pub const DEFAULT_PAGE_SIZE: usize = 100_000;
/// Leading values sampled per column during type inference.
pub const DEFAULT_INFERENCE_SAMPLE: usize = 100;
/// Initial window of rows scanned for extra keys in row-oriented input.
pub const DEFAULT_SCHEMA_SCAN_WINDOW: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub page_size: usize,
    pub inference_sample: usize,
    pub schema_scan_window: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            page_size: DEFAULT_PAGE_SIZE,
            inference_sample: DEFAULT_INFERENCE_SAMPLE,
            schema_scan_window: DEFAULT_SCHEMA_SCAN_WINDOW,
        }
    }
}

impl Settings {
    /// Reads `LIVEPIVOT_PAGE_SIZE`, `LIVEPIVOT_INFERENCE_SAMPLE` and
    /// `LIVEPIVOT_SCHEMA_SCAN_WINDOW`, keeping defaults for unset or invalid
    /// values.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let read = |key: &str, default: usize| -> usize {
            match lookup(key) {
                None => default,
                Some(raw) => match raw.trim().parse::<usize>() {
                    Ok(v) if v > 0 => v,
                    _ => {
                        log::warn!("Ignoring invalid {}={:?}, using {}", key, raw, default);
                        default
                    }
                },
            }
        };

        Settings {
            page_size: read("LIVEPIVOT_PAGE_SIZE", defaults.page_size),
            inference_sample: read("LIVEPIVOT_INFERENCE_SAMPLE", defaults.inference_sample),
            schema_scan_window: read("LIVEPIVOT_SCHEMA_SCAN_WINDOW", defaults.schema_scan_window),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_settings_from_lookup() {
        let mut env = HashMap::new();
        env.insert("LIVEPIVOT_PAGE_SIZE", "10".to_string());
        env.insert("LIVEPIVOT_INFERENCE_SAMPLE", "zero".to_string());
        let settings = Settings::from_lookup(|k| env.get(k).cloned());
        assert_eq!(settings.page_size, 10);
        assert_eq!(settings.inference_sample, DEFAULT_INFERENCE_SAMPLE);
        assert_eq!(settings.schema_scan_window, DEFAULT_SCHEMA_SCAN_WINDOW);
    }

    #[test]
    fn test_settings_deserialize_partial() {
        let settings: Settings = serde_json::from_str(r#"{"page_size": 5}"#).unwrap();
        assert_eq!(settings.page_size, 5);
        assert_eq!(settings.inference_sample, DEFAULT_INFERENCE_SAMPLE);
    }
}
