/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The polymorphic sources feeding into a build target, and the "on-use"
//! projection protocol through which a source tells its consuming target
//! what to contribute.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::external::External;

/// Index into the registry's target arena. Targets are always referenced
/// by id so that the canonicaliser can rewrite the graph in place.
pub type TargetId = usize;

/// An entry in a projection list. `Own` is the self-reference sentinel: it
/// resolves to the owning source when the projection is consumed, which
/// lets a node advertise "use me as an input" without a cyclic reference.
#[derive(Debug, Clone)]
pub enum Projected {
    Own,
    Source(BuildSource),
}

/// A map keyed by rule name with an "any rule" fallback. Selection picks
/// the first key (in sorted order) that is a substring of the consuming
/// rule's name; projection keys are typically rule families (`compile`,
/// `link_shared`), so a compiler external can feed all of its `compile_*`
/// rules with a single entry.
#[derive(Debug, Clone)]
pub struct OnUse<T> {
    by_rule: BTreeMap<String, T>,
    any: Option<T>,
}

impl<T> Default for OnUse<T> {
    fn default() -> OnUse<T> {
        OnUse {
            by_rule: BTreeMap::new(),
            any: None,
        }
    }
}

impl<T> OnUse<T> {
    pub fn any(value: T) -> OnUse<T> {
        OnUse {
            by_rule: BTreeMap::new(),
            any: Some(value),
        }
    }

    pub fn insert(&mut self, rule: Option<&str>, value: T) {
        match rule {
            Some(rule) => {
                self.by_rule.insert(rule.to_string(), value);
            }
            None => self.any = Some(value),
        }
    }

    pub fn select(&self, rule_name: &str) -> Option<&T> {
        for (key, value) in &self.by_rule {
            if rule_name.contains(key.as_str()) {
                return Some(value);
            }
        }
        self.any.as_ref()
    }

    pub fn entries(&self) -> impl Iterator<Item = (Option<&str>, &T)> {
        self.any.iter().map(|v| (None, v)).chain(
            self.by_rule
                .iter()
                .map(|(k, v)| (Some(k.as_str()), v)),
        )
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.any.iter_mut().chain(self.by_rule.values_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.any.is_none() && self.by_rule.is_empty()
    }
}

/// The three on-use facets every source carries: what it contributes as
/// inputs, as order-only dependencies, and as rule variables.
#[derive(Debug, Clone, Default)]
pub struct Projections {
    pub inputs: OnUse<Vec<Projected>>,
    pub deps: OnUse<Vec<Projected>>,
    pub variables: OnUse<BTreeMap<String, Vec<String>>>,
}

impl Projections {
    /// Variables under a single key, the common case for flag bundles.
    pub fn variables_for(rule: Option<&str>, vars: BTreeMap<String, Vec<String>>) -> Projections {
        let mut projections = Projections::default();
        projections.variables.insert(rule, vars);
        projections
    }

    /// Rewrite every target reference held in a projection list; used by
    /// the canonicaliser when deduplication replaces a target.
    pub fn remap_targets(&mut self, remap: &mut impl FnMut(TargetId) -> TargetId) {
        for list in self
            .inputs
            .values_mut()
            .chain(self.deps.values_mut())
        {
            for projected in list {
                if let Projected::Source(source) = projected {
                    match source {
                        BuildSource::Target(id) => *id = remap(*id),
                        BuildSource::Alias(alias) => alias.target = remap(alias.target),
                        _ => {}
                    }
                }
            }
        }
    }
}

/// A literal input file. By default it appears as an input under any rule;
/// `with_rules` restricts it to a set of rule-name keys. `target_type`
/// overrides extension-based classification when set.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub target_type: Option<String>,
    pub projections: Projections,
}

impl InputFile {
    pub fn new(name: &str) -> InputFile {
        let mut projections = Projections::default();
        projections.inputs.insert(None, vec![Projected::Own]);
        InputFile {
            name: name.to_string(),
            target_type: None,
            projections,
        }
    }

    pub fn with_rules(name: &str, rules: &[&str]) -> InputFile {
        let mut projections = Projections::default();
        for rule in rules {
            projections.inputs.insert(Some(rule), vec![Projected::Own]);
        }
        InputFile {
            name: name.to_string(),
            target_type: None,
            projections,
        }
    }

    pub fn with_target_type(mut self, target_type: &str) -> InputFile {
        self.target_type = Some(target_type.to_string());
        self
    }
}

/// A carrier that injects variable values (typically an `opts` list) into
/// its consuming target without contributing any inputs.
#[derive(Debug, Clone)]
pub struct RuleVariables {
    pub projections: Projections,
}

impl RuleVariables {
    pub fn new(rule: Option<&str>, vars: BTreeMap<String, Vec<String>>) -> RuleVariables {
        RuleVariables {
            projections: Projections::variables_for(rule, vars),
        }
    }

    /// An `opts` carrier; the value string is whitespace-split so that
    /// merge-time deduplication works flag by flag.
    pub fn opts(rule: Option<&str>, opts: &str) -> RuleVariables {
        let values = opts.split_whitespace().map(str::to_string).collect();
        let mut vars = BTreeMap::new();
        vars.insert("opts".to_string(), values);
        RuleVariables::new(rule, vars)
    }
}

/// Wraps a target so it appears as an input without altering ownership;
/// used by install targets.
#[derive(Debug, Clone)]
pub struct TargetAlias {
    pub target: TargetId,
}

#[derive(Debug, Clone)]
pub enum BuildSource {
    File(InputFile),
    Vars(RuleVariables),
    Alias(TargetAlias),
    External(Rc<External>),
    Target(TargetId),
}

impl BuildSource {
    pub fn file(name: &str) -> BuildSource {
        BuildSource::File(InputFile::new(name))
    }

    /// An `opts` carrier, or `None` when there are no values to carry.
    pub fn opts_carrier(rule: Option<&str>, opts: &str) -> Option<BuildSource> {
        if opts.split_whitespace().next().is_none() {
            return None;
        }
        Some(BuildSource::Vars(RuleVariables::opts(rule, opts)))
    }

    pub fn as_target(&self) -> Option<TargetId> {
        match self {
            BuildSource::Target(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, BuildSource::External(_))
    }

    /// Pure flag carriers form the "environment" that linking adds to every
    /// synthesised object build.
    pub fn is_flag_carrier(&self) -> bool {
        matches!(self, BuildSource::Vars(_) | BuildSource::External(_))
    }
}
