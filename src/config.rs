//! Engine selection and sorter configuration

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::distance::DistanceMetric;
use crate::{Error, Result};

/// Default `G_local`
pub const DEFAULT_GROUP_SIZE: u32 = 256;

/// Co-sort engine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "basic", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Local sorting network plus run-level odd-even merge
    #[default]
    Network,
    /// LSD radix sort
    Radix,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Network => write!(f, "network"),
            Self::Radix => write!(f, "radix"),
        }
    }
}

/// Sorter configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortConfig {
    /// Engine used for every sort of the job
    pub engine:     Engine,
    /// Network group size; ignored by the radix engine
    pub group_size: u32,
    /// Sort direction
    pub ascending:  bool,
    /// Key produced from positions by distance sorts
    pub metric:     DistanceMetric,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            engine:     Engine::Network,
            group_size: DEFAULT_GROUP_SIZE,
            ascending:  true,
            metric:     DistanceMetric::Squared,
        }
    }
}

impl SortConfig {
    /// Checks the group size is a positive multiple of two.
    pub fn validate(&self) -> Result<()> {
        if self.group_size == 0 || self.group_size % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "group size must be a positive multiple of 2, got {}",
                self.group_size
            )));
        }
        Ok(())
    }

    /// Loads and validates a JSON configuration. Missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Granularity the length compensator pads to
    pub fn granularity(&self) -> usize {
        match self.engine {
            Engine::Network => self.group_size as usize,
            Engine::Radix => 1,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = SortConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.granularity(), 256);
        let radix = SortConfig { engine: Engine::Radix, ..config };
        assert_eq!(radix.granularity(), 1);
    }

    #[test]
    fn test_rejects_odd_group_sizes() {
        for group_size in [0, 1, 7, 255] {
            let config = SortConfig { group_size, ..Default::default() };
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_partial_json() {
        let config: SortConfig = serde_json::from_str(r#"{"engine": "radix", "metric": "euclidean"}"#).unwrap();
        assert_eq!(config.engine, Engine::Radix);
        assert_eq!(config.metric, DistanceMetric::Euclidean);
        assert_eq!(config.group_size, DEFAULT_GROUP_SIZE);
        assert!(config.ascending);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("cosort_config_{}.json", std::process::id()));
        std::fs::write(&path, r#"{"group_size": 64, "ascending": false}"#).unwrap();
        let config = SortConfig::from_file(&path).unwrap();
        assert_eq!(config.group_size, 64);
        assert!(!config.ascending);

        std::fs::write(&path, r#"{"group_size": 3}"#).unwrap();
        assert!(matches!(SortConfig::from_file(&path), Err(Error::InvalidConfig(_))));
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(SortConfig::from_file(&path), Err(Error::Io(_))));
    }
}
