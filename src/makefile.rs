/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! GNU Make writer. Follows the same variable and ordering discipline as
//! the Ninja writer; placeholders are expanded per target since Make has
//! no per-edge variable scope.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io::Error;
use std::io::Write;

use crate::registry::Manifest;
use crate::registry::Registry;
use crate::rule::expand_placeholders;
use crate::source::BuildSource;
use crate::target::BuildTarget;

fn input_names(registry: &Registry, sources: &[BuildSource]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    sources
        .iter()
        .filter_map(|src| registry.source_name(src))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Expand a rule template for one concrete target: `$in`/`$out` become the
/// real file lists, per-target variables are inlined, and rule defaults
/// become Make variable references.
fn expand(
    template: &str,
    target: &BuildTarget,
    inputs: &str,
    variables: &BTreeMap<String, String>,
) -> String {
    expand_placeholders(template, &mut |name| match name {
        "in" => inputs.to_string(),
        "out" => target.name.clone(),
        _ => {
            if let Some(value) = variables.get(name) {
                value.clone()
            } else if target.build_rule.defaults.contains_key(name) {
                format!("$({})", name)
            } else {
                String::new()
            }
        }
    })
}

pub fn write_makefile(
    out: &mut impl Write,
    registry: &Registry,
    manifest: &Manifest,
) -> Result<(), Error> {
    let mut seen = BTreeSet::new();
    let mut wrote_vars = false;
    for rule in &manifest.rules {
        for (key, value) in &rule.defaults {
            if seen.insert(key.clone()) {
                writeln!(out, "{} := {}", key, value.trim())?;
                wrote_vars = true;
            }
        }
    }
    if wrote_vars {
        writeln!(out)?;
    }

    // the default goal: the first listed default, or a synthetic phony
    // aggregate when several are listed
    match manifest.defaults.as_slice() {
        [] => {}
        [id] => {
            writeln!(out, ".DEFAULT_GOAL := {}", registry.target(*id).name)?;
            writeln!(out)?;
        }
        ids => {
            let names: Vec<String> = ids
                .iter()
                .map(|&id| registry.target(id).name.clone())
                .collect();
            writeln!(out, ".PHONY: default_target")?;
            writeln!(out, "default_target: {}", names.join(" "))?;
            writeln!(out)?;
        }
    }

    let mut outputs = Vec::new();
    for &id in &manifest.targets {
        let target = registry.target(id);
        let inputs = input_names(registry, &target.build_inputs(registry));
        let deps = input_names(registry, &target.build_deps(registry));
        let prereqs: Vec<String> = inputs.iter().chain(deps.iter()).cloned().collect();

        if target.build_rule.is_phony() {
            writeln!(out, ".PHONY: {}", target.name)?;
            writeln!(out, "{}: {}", target.name, prereqs.join(" "))?;
            writeln!(out)?;
            continue;
        }
        outputs.push(target.name.clone());

        let variables = target.build_variables(registry);
        let joined_inputs = inputs.join(" ");

        // dependency files opt in through the rule's gcc-deps params
        if target.build_rule.param("deps") == Some("gcc") {
            if let Some(depfile) = target.build_rule.param("depfile") {
                let depfile = expand(depfile, target, &joined_inputs, &variables);
                writeln!(out, "-include {}", depfile)?;
            }
        }

        writeln!(out, "{}: {}", target.name, prereqs.join(" "))?;
        let cmd = expand(&target.build_rule.cmd, target, &joined_inputs, &variables);
        writeln!(out, "\t{}", cmd)?;
        writeln!(out)?;
    }

    writeln!(out, "clean:")?;
    writeln!(out, "\trm -f {}", outputs.join(" "))?;
    writeln!(out, ".PHONY: clean")?;

    Ok(())
}
