//! Definition of the KeepLevels filter.

use std::collections::HashSet;

use record::Record;
use serde::Deserialize;
use serde_yaml::Value;

use crate::{Error, Filter, FilterFactory};

/// Configuration of the [`KeepLevels`] filter.
#[derive(Debug, Deserialize)]
struct KeepLevelsConfig {
    /// The set of levels to keep.
    levels: Vec<String>,
}

/// A filter that keeps a record only when its level is in a configured set.
pub struct KeepLevels {
    name: String,
    levels: HashSet<String>,
}

impl KeepLevels {
    /// Creates a new KeepLevels filter from a list of levels.
    pub fn new(name: impl Into<String>, levels: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            levels: levels.into_iter().map(|l| l.to_ascii_lowercase()).collect(),
        }
    }
}

impl Filter for KeepLevels {
    fn process(&self, record: &mut Record) -> bool {
        let keep = self.levels.contains(&record.level);
        if !keep {
            tracing::trace!(filter = %self.name, level = %record.level, "record dropped");
        }
        keep
    }
}

/// The factory of the KeepLevels filter, registered under the type
/// `keep_levels`.
#[derive(Default)]
pub struct KeepLevelsFactory {}

impl FilterFactory for KeepLevelsFactory {
    fn create(
        &self,
        filter_name: &str,
        filter_type: &str,
        config: Value,
    ) -> Result<Box<dyn Filter>, Error> {
        match filter_type {
            "keep_levels" => {
                let config: KeepLevelsConfig =
                    serde_yaml::from_value(config).map_err(|e| Error::InvalidConfig {
                        filter: filter_name.to_string(),
                        message: e.to_string(),
                    })?;
                Ok(Box::new(KeepLevels::new(filter_name, config.levels)))
            }
            _ => Err(Error::UnknownFilter {
                filter: filter_name.to_string(),
                filter_type: filter_type.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use record::Record;
    use serde_yaml::Value;

    use crate::keep_levels::{KeepLevels, KeepLevelsFactory};
    use crate::{Filter, FilterFactory};

    #[test]
    fn keeps_configured_levels() {
        let filter = KeepLevels::new("severity", vec!["error".to_string(), "warn".to_string()]);

        let mut error = Record::new("error", "y");
        let mut info = Record::new("info", "x");

        assert!(filter.process(&mut error));
        assert!(!filter.process(&mut info));
    }

    #[test]
    fn factory_rejects_unknown_type() {
        let factory = KeepLevelsFactory::default();
        let result = factory.create("severity", "nope", Value::Null);
        assert!(result.is_err());
    }

    #[test]
    fn factory_parses_levels() {
        let factory = KeepLevelsFactory::default();
        let config: Value = serde_yaml::from_str("levels: [ERROR, warn]").expect("valid yaml");
        let filter = factory
            .create("severity", "keep_levels", config)
            .expect("filter must be created");

        let mut record = Record::new("error", "boom");
        assert!(filter.process(&mut record));
    }
}
