/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Platform-specific filename extensions, install locations and install
//! rules.

use std::collections::BTreeMap;

use crate::rule::Rule;
use crate::source::BuildSource;
use crate::toolchain::ToolHolder;

#[derive(Debug)]
pub struct Platform {
    pub name: String,
    extensions: BTreeMap<String, String>,
    install_paths: BTreeMap<String, String>,
    install_rules: Vec<Rule>,
}

impl Platform {
    pub fn linux() -> Platform {
        let mut extensions = BTreeMap::new();
        extensions.insert("object".to_string(), ".o".to_string());
        extensions.insert("shared".to_string(), ".so".to_string());
        extensions.insert("static".to_string(), ".a".to_string());
        extensions.insert("exe".to_string(), String::new());

        let mut install_paths = BTreeMap::new();
        install_paths.insert("shared".to_string(), "/usr/lib".to_string());
        install_paths.insert("static".to_string(), "/usr/lib".to_string());
        install_paths.insert("exe".to_string(), "/usr/bin".to_string());

        let install_rules = ["shared", "static", "exe"]
            .iter()
            .map(|from| {
                Rule::new(
                    "install",
                    "cp $in $out",
                    "install $out",
                    &[],
                    (from, "install"),
                )
            })
            .collect();

        Platform {
            name: "linux".to_string(),
            extensions,
            install_paths,
            install_rules,
        }
    }

    pub fn extension(&self, target_type: &str) -> &str {
        self.extensions
            .get(target_type)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn install_path(&self, target_type: &str) -> Option<&str> {
        self.install_paths.get(target_type).map(String::as_str)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.install_rules
    }

    /// Inputs every target of a type must carry, gathered from the tools:
    /// e.g. a compiler demanding position-independent code for anything
    /// that ends up in a shared library.
    pub fn required_inputs(&self, target_type: &str, tools: &ToolHolder) -> Vec<BuildSource> {
        let mut result = Vec::new();
        for (_, external) in tools.iter_resolved() {
            if let Some(required) = external.required_inputs.get(target_type) {
                result.extend(required.iter().cloned());
            }
        }
        result
    }
}

impl Default for Platform {
    fn default() -> Platform {
        Platform::linux()
    }
}
