/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Ninja manifest writer.

use std::collections::BTreeSet;
use std::io::Error;
use std::io::Write;

use crate::registry::Manifest;
use crate::registry::Registry;
use crate::rule::PHONY_RULE;
use crate::source::BuildSource;

fn input_names(registry: &Registry, sources: &[BuildSource]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    sources
        .iter()
        .filter_map(|src| registry.source_name(src))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// True when the default selection is just the phony `all` aggregate; the
/// explicit `default` line is redundant then.
fn lone_default_is_all(registry: &Registry, manifest: &Manifest) -> bool {
    match manifest.defaults.as_slice() {
        [id] => {
            let target = registry.target(*id);
            target.build_rule.is_phony() && target.name == "all"
        }
        _ => false,
    }
}

pub fn write_ninja(
    out: &mut impl Write,
    registry: &Registry,
    manifest: &Manifest,
) -> Result<(), Error> {
    // one declaration per distinct rule-default; the canonicaliser has
    // already renamed keys whose values conflict
    let mut seen = BTreeSet::new();
    let mut wrote_vars = false;
    for rule in &manifest.rules {
        for (key, value) in &rule.defaults {
            if seen.insert(key.clone()) {
                writeln!(out, "{} = {}", key, value.trim())?;
                wrote_vars = true;
            }
        }
    }
    if wrote_vars {
        writeln!(out)?;
    }

    for rule in &manifest.rules {
        writeln!(out, "rule {}", rule.name)?;
        writeln!(out, "  command = {}", rule.cmd)?;
        writeln!(out, "  description = {}", rule.description)?;
        for (key, value) in &rule.params {
            writeln!(out, "  {} = {}", key, value)?;
        }
        writeln!(out)?;
    }

    for &id in &manifest.targets {
        let target = registry.target(id);
        let rule_name = if target.build_rule.is_phony() {
            PHONY_RULE
        } else {
            &target.build_rule.name
        };
        write!(out, "build {}: {}", target.name, rule_name)?;
        for name in input_names(registry, &target.build_inputs(registry)) {
            write!(out, " {}", name)?;
        }
        let deps = input_names(registry, &target.build_deps(registry));
        if !deps.is_empty() {
            write!(out, " |")?;
            for name in deps {
                write!(out, " {}", name)?;
            }
        }
        writeln!(out)?;
        for (key, value) in target.build_variables(registry) {
            writeln!(out, "  {} = {}", key, value)?;
        }
    }

    if !manifest.defaults.is_empty() && !lone_default_is_all(registry, manifest) {
        let names: Vec<String> = manifest
            .defaults
            .iter()
            .map(|&id| registry.target(id).name.clone())
            .collect();
        writeln!(out, "default {}", names.join(" "))?;
    }

    Ok(())
}
