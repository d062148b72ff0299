//! Declared configuration options per backend and validation of the
//! caller-supplied storage configuration against them.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::errors::ConfigError;

/// One option a backend understands. `default: None` means the caller must
/// supply a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigOption {
    pub name: &'static str,
    pub default: Option<&'static str>,
}

impl ConfigOption {
    pub const fn required(name: &'static str) -> Self {
        Self { name, default: None }
    }

    pub const fn optional(name: &'static str, default: &'static str) -> Self {
        Self {
            name,
            default: Some(default),
        }
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

pub type ConfigSchema = &'static [ConfigOption];

/// Storage configuration that has passed schema validation: every declared
/// option has a value and nothing undeclared is present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedConfig {
    values: BTreeMap<String, String>,
}

impl ValidatedConfig {
    /// Merge `supplied` over the schema defaults, then reject unknown keys and
    /// required keys left without a value.
    pub fn validate(
        schema: ConfigSchema,
        supplied: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut values: BTreeMap<String, String> = schema
            .iter()
            .filter_map(|opt| opt.default.map(|d| (opt.name.to_string(), d.to_string())))
            .collect();
        values.extend(supplied.iter().map(|(k, v)| (k.clone(), v.clone())));

        for opt in schema {
            let present = values
                .get(opt.name)
                .map(|v| !v.trim().is_empty() || !opt.is_required())
                .unwrap_or(false);
            if !present {
                return Err(ConfigError::Missing(opt.name.to_string()));
            }
        }

        if let Some(unknown) = values
            .keys()
            .find(|k| !schema.iter().any(|opt| opt.name == k.as_str()))
        {
            return Err(ConfigError::Unknown(unknown.clone()));
        }

        Ok(Self { values })
    }

    /// Value of a declared option. Declared options are always present after
    /// validation; an undeclared name yields the empty string.
    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or_default()
    }

    /// Declared option treated as absent when empty.
    pub fn get_opt(&self, key: &str) -> Option<&str> {
        Some(self.get(key).trim()).filter(|v| !v.is_empty())
    }

    pub fn parse<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }
}
