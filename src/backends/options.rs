// SPDX-License-Identifier: GPL-3.0-only

//! Read-only access to device options
//!
//! The option and constraint system belongs to the driver. The pipeline only
//! reads a few values from it when building stages, through [`OptionSource`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value of one device option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// On/off switch
    Toggle(bool),
    /// Numeric value
    Scalar(f64),
    /// Numeric range with optional quantization
    Range {
        min: f64,
        max: f64,
        #[serde(default)]
        quant: Option<f64>,
    },
    /// Free text (e.g. a helper program)
    Text(String),
}

/// Opaque getter over the driver's options
pub trait OptionSource: Send + Sync {
    /// Look up an option by key
    fn get(&self, key: &str) -> Option<OptionValue>;

    /// Numeric option
    fn scalar(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            OptionValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean option
    fn toggle(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            OptionValue::Toggle(v) => Some(v),
            _ => None,
        }
    }

    /// Range option as `(min, max)`
    fn range(&self, key: &str) -> Option<(f64, f64)> {
        match self.get(key)? {
            OptionValue::Range { min, max, .. } => Some((min, max)),
            _ => None,
        }
    }

    /// Text option
    fn text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            OptionValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Options backed by an in-memory map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapOptions {
    values: BTreeMap<String, OptionValue>,
}

impl MapOptions {
    /// Empty option set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an option, builder style
    pub fn with(mut self, key: &str, value: OptionValue) -> Self {
        self.set(key, value);
        self
    }

    /// Add or replace an option
    pub fn set(&mut self, key: &str, value: OptionValue) {
        self.values.insert(key.to_string(), value);
    }
}

impl OptionSource for MapOptions {
    fn get(&self, key: &str) -> Option<OptionValue> {
        self.values.get(key).cloned()
    }
}
