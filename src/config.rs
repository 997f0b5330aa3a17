use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path};

use crate::cascade::SchedulingPolicy;
use crate::model::MergeOptions;
use crate::{Error, InternalResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormConfig {
    /// Maintain `enk:ordinal` and `enk:last-used-ordinal` on repeat instances.
    #[serde(default)]
    pub repeat_ordinals: bool,

    #[serde(default)]
    pub scheduling: SchedulingPolicy,

    /// Rounds a single change may trigger before the cascade gives up.
    #[serde(default = "default_max_cascade_depth")]
    pub max_cascade_depth: usize,

    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Upper bound for instances created from a repeat count expression.
    #[serde(default = "default_max_repeat_count")]
    pub max_repeat_count: usize,

    /// Compute choice lists that read only a secondary instance once.
    #[serde(default = "default_true")]
    pub static_itemset_cache: bool,

    #[serde(default)]
    pub merge: MergeOptions,
}

impl Default for FormConfig {
    fn default() -> Self {
        Self {
            repeat_ordinals: false,
            scheduling: SchedulingPolicy::default(),
            max_cascade_depth: default_max_cascade_depth(),
            event_buffer_size: default_event_buffer_size(),
            max_repeat_count: default_max_repeat_count(),
            static_itemset_cache: default_true(),
            merge: MergeOptions::default(),
        }
    }
}

impl FormConfig {
    pub fn from_file(path: &str) -> InternalResult<Self> {
        from_file(path)
    }

    pub fn batched(mut self) -> Self {
        self.scheduling = SchedulingPolicy::Batched;
        self
    }

    pub fn with_ordinals(mut self) -> Self {
        self.repeat_ordinals = true;
        self
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> InternalResult<T> {
    let file = File::open(path)
        .map_err(|e| Error::Internal(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Internal(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> InternalResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Internal(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

fn default_max_cascade_depth() -> usize {
    64
}

fn default_event_buffer_size() -> usize {
    1024
}

fn default_max_repeat_count() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_from_empty_object() {
        let config: FormConfig = from_str("{}").unwrap();
        assert_eq!(config, FormConfig::default());
        assert_eq!(config.max_cascade_depth, 64);
        assert_eq!(config.max_repeat_count, 1000);
        assert!(config.static_itemset_cache);
        assert!(config.merge.deprecate_instance_id);
    }

    #[test]
    fn test_partial_override() {
        let config: FormConfig = from_str(
            r#"{"repeat_ordinals": true, "scheduling": "batched", "merge": {"deprecate_instance_id": false}}"#,
        )
        .unwrap();
        assert!(config.repeat_ordinals);
        assert_eq!(config.scheduling, SchedulingPolicy::Batched);
        assert!(!config.merge.deprecate_instance_id);
        assert_eq!(config.event_buffer_size, 1024);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("formcascade-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"max_cascade_depth": 8}"#).unwrap();
        let config: FormConfig = from_file(&path).unwrap();
        assert_eq!(config.max_cascade_depth, 8);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            FormConfig::from_file("/nonexistent/formcascade.json"),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_builders() {
        let config = FormConfig::default().batched().with_ordinals();
        assert_eq!(config.scheduling, SchedulingPolicy::Batched);
        assert!(config.repeat_ordinals);
    }
}
