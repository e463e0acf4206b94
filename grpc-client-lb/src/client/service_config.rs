/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::any::Any;
use std::sync::Arc;

use serde::Deserialize;

use crate::Error;

/// An in-memory representation of a service config, usually provided to gRPC as
/// a JSON object by the name resolver.
///
/// Only the load balancing portion is interpreted by this crate.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Candidate LB policies in order of preference.  The first entry naming a
    /// registered policy is used.
    pub load_balancing_config: Vec<LbPolicyConfigEntry>,
}

/// One `{"policy_name": {...}}` element of a service config's
/// `loadBalancingConfig` list.
#[derive(Debug, Clone, PartialEq)]
pub struct LbPolicyConfigEntry {
    pub name: String,
    pub config: serde_json::Value,
}

impl LbPolicyConfigEntry {
    pub fn new(name: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceConfig {
    #[serde(default)]
    load_balancing_config: Vec<serde_json::Map<String, serde_json::Value>>,
}

impl ServiceConfig {
    /// Builds a service config selecting the given policies, in order of
    /// preference, each with an empty configuration.
    pub fn with_policies<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            load_balancing_config: names
                .into_iter()
                .map(|name| LbPolicyConfigEntry::new(name, serde_json::json!({})))
                .collect(),
        }
    }

    /// Parses the JSON form of a service config.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let raw: RawServiceConfig =
            serde_json::from_str(json).map_err(|e| Error::InvalidServiceConfig(e.to_string()))?;
        let mut load_balancing_config = Vec::with_capacity(raw.load_balancing_config.len());
        for entry in raw.load_balancing_config {
            if entry.len() != 1 {
                return Err(Error::InvalidServiceConfig(format!(
                    "each loadBalancingConfig entry must contain exactly one policy, found {}",
                    entry.len()
                )));
            }
            if let Some((name, config)) = entry.into_iter().next() {
                load_balancing_config.push(LbPolicyConfigEntry { name, config });
            }
        }
        Ok(Self {
            load_balancing_config,
        })
    }
}

/// A convenience wrapper for an LB policy's parsed configuration object.
#[derive(Debug, Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    /// Create a new LbConfig wrapper containing the provided config.
    pub fn new(config: impl Any + Send + Sync) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Convenience method to extract the LB policy's configuration object.
    pub fn convert_to<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.config.clone().downcast::<T>().ok()
    }
}
