/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Build targets and the consumption side of the on-use projection
//! protocol: a target computes its effective inputs, order-only deps and
//! variables by projecting from each of its sources under its own rule
//! name.

use std::collections::BTreeMap;

use crate::registry::Registry;
use crate::rule::Rule;
use crate::source::BuildSource;
use crate::source::Projected;
use crate::source::Projections;

#[derive(Debug)]
pub struct BuildTarget {
    /// Canonical build name: the output path in the emitted manifest.
    pub name: String,
    /// Name the build description used; `find_internal` looks this up.
    pub user_name: Option<String>,
    /// File name used when this target is installed.
    pub install_name: Option<String>,
    pub build_rule: Rule,
    pub build_src: Vec<BuildSource>,
    pub target_type: String,
    /// What this target contributes when it is used as a source.
    pub projections: Projections,
    /// The canonicaliser may not mangle this name on collision.
    pub no_rename: bool,
    /// Set once `opts` has been folded into the rule command.
    pub drop_opts: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Facet {
    Inputs,
    Deps,
}

impl BuildTarget {
    pub fn new(
        name: &str,
        target_type: &str,
        build_rule: Rule,
        build_src: Vec<BuildSource>,
    ) -> BuildTarget {
        BuildTarget {
            name: name.to_string(),
            user_name: None,
            install_name: None,
            build_rule,
            build_src,
            target_type: target_type.to_string(),
            projections: Projections::default(),
            no_rename: false,
            drop_opts: false,
        }
    }

    fn collect(&self, registry: &Registry, facet: Facet) -> Vec<BuildSource> {
        let mut result = Vec::new();
        for src in &self.build_src {
            if let BuildSource::Alias(alias) = src {
                // An alias has exactly one contribution: the wrapped
                // target as an input, under any rule.
                if facet == Facet::Inputs {
                    result.push(BuildSource::Target(alias.target));
                }
                continue;
            }
            let projections = source_projections(src, registry);
            let on_use = match facet {
                Facet::Inputs => &projections.inputs,
                Facet::Deps => &projections.deps,
            };
            if let Some(list) = on_use.select(&self.build_rule.name) {
                for projected in list {
                    result.push(match projected {
                        Projected::Own => src.clone(),
                        Projected::Source(source) => source.clone(),
                    });
                }
            }
        }
        result
    }

    pub fn build_inputs(&self, registry: &Registry) -> Vec<BuildSource> {
        self.collect(registry, Facet::Inputs)
    }

    pub fn build_deps(&self, registry: &Registry) -> Vec<BuildSource> {
        self.collect(registry, Facet::Deps)
    }

    /// Effective variable map: contributions merged per variable with
    /// order-preserving deduplication, each final string the unique values
    /// joined by a single space.
    pub fn build_variables(&self, registry: &Registry) -> BTreeMap<String, String> {
        let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for src in &self.build_src {
            if matches!(src, BuildSource::Alias(_)) {
                continue;
            }
            let projections = source_projections(src, registry);
            if let Some(vars) = projections.variables.select(&self.build_rule.name) {
                for (var, values) in vars {
                    let slot = merged.entry(var.clone()).or_default();
                    for value in values {
                        if !slot.contains(value) {
                            slot.push(value.clone());
                        }
                    }
                }
            }
        }
        if self.drop_opts {
            merged.remove("opts");
        }
        merged
            .into_iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(var, values)| (var, values.join(" ")))
            .collect()
    }

    pub fn opts_string(&self, registry: &Registry) -> String {
        self.build_variables(registry)
            .remove("opts")
            .unwrap_or_default()
    }
}

fn source_projections<'a>(src: &'a BuildSource, registry: &'a Registry) -> &'a Projections {
    match src {
        BuildSource::File(file) => &file.projections,
        BuildSource::Vars(vars) => &vars.projections,
        BuildSource::External(external) => &external.projections,
        BuildSource::Target(id) => &registry.target(*id).projections,
        BuildSource::Alias(_) => unreachable!("aliases are special-cased by collect"),
    }
}
