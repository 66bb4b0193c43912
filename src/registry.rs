/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The target registry and the canonicalisation pass that turns a
//! potentially redundant, name-colliding graph into a minimal,
//! deterministic one before emission.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use anyhow::bail;
use anyhow::Result;

use crate::fingerprint::Fingerprint;
use crate::fingerprint::FingerprintHasher;
use crate::rule::rename_placeholder;
use crate::rule::Rule;
use crate::source::BuildSource;
use crate::source::TargetAlias;
use crate::target::BuildTarget;
use crate::source::TargetId;

/// Everything the writers need: unified rules sorted by name, targets in
/// stable emission order, and the resolved default selection.
#[derive(Debug)]
pub struct Manifest {
    pub rules: Vec<Rule>,
    pub targets: Vec<TargetId>,
    pub defaults: Vec<TargetId>,
}

#[derive(Default)]
pub struct FpMemo {
    done: BTreeMap<TargetId, Fingerprint>,
    visiting: BTreeSet<TargetId>,
}

#[derive(Debug, Default)]
pub struct Registry {
    targets: Vec<BuildTarget>,
    pub all_targets: Vec<TargetId>,
    pub install_targets: Vec<TargetId>,
    pub rename_all_targets: bool,
    pub rename_all_rules: bool,
    pub rename_all_constants: bool,
    pub fold_target_opts: bool,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            fold_target_opts: true,
            ..Default::default()
        }
    }

    pub fn register(&mut self, target: BuildTarget) -> TargetId {
        self.targets.push(target);
        self.targets.len() - 1
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn target(&self, id: TargetId) -> &BuildTarget {
        &self.targets[id]
    }

    pub fn target_mut(&mut self, id: TargetId) -> &mut BuildTarget {
        &mut self.targets[id]
    }

    /// The manifest name a source appears under, if it has one. Flag
    /// carriers have none.
    pub fn source_name(&self, src: &BuildSource) -> Option<String> {
        match src {
            BuildSource::File(file) => Some(file.name.clone()),
            BuildSource::Target(id) => Some(self.targets[*id].name.clone()),
            BuildSource::Alias(alias) => Some(self.targets[alias.target].name.clone()),
            BuildSource::Vars(_) | BuildSource::External(_) => None,
        }
    }

    /// Look a target up by the name the build description used. Zero or
    /// several hits are both configuration errors.
    pub fn find_internal(&self, name: &str) -> Result<TargetId> {
        match self.find_internal_opt(name)? {
            Some(id) => Ok(id),
            None => bail!("no target named {:?}", name),
        }
    }

    pub fn find_internal_opt(&self, name: &str) -> Result<Option<TargetId>> {
        let by_user: Vec<TargetId> = (0..self.targets.len())
            .filter(|&id| self.targets[id].user_name.as_deref() == Some(name))
            .collect();
        let matches = if by_user.is_empty() {
            (0..self.targets.len())
                .filter(|&id| self.targets[id].install_name.as_deref() == Some(name))
                .collect()
        } else {
            by_user
        };
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            n => bail!("{} targets named {:?}; names must be unique to reference them", n, name),
        }
    }

    /// Aggregate several targets under a phony name (`all`, `install`,
    /// include groups).
    pub fn add_phony(&mut self, name: &str, members: &[TargetId]) -> TargetId {
        let build_src = members
            .iter()
            .map(|&target| BuildSource::Alias(TargetAlias { target }))
            .collect();
        let mut target = BuildTarget::new(name, "phony", Rule::phony(), build_src);
        target.no_rename = true;
        target.user_name = Some(name.to_string());
        self.register(target)
    }

    pub fn source_fingerprint(&self, src: &BuildSource, memo: &mut FpMemo) -> Fingerprint {
        match src {
            BuildSource::File(file) => {
                let mut hasher = FingerprintHasher::new("file");
                hasher.text(&file.name);
                for (key, _) in file.projections.inputs.entries() {
                    hasher.opt_text(key);
                }
                hasher.finish()
            }
            BuildSource::Vars(vars) => {
                let mut hasher = FingerprintHasher::new("vars");
                hash_variables(&mut hasher, &vars.projections);
                hasher.finish()
            }
            BuildSource::External(external) => {
                let mut hasher = FingerprintHasher::new("external");
                hasher.text(&external.name);
                hasher.opt_text(external.version.as_deref());
                hash_variables(&mut hasher, &external.projections);
                hasher.finish()
            }
            BuildSource::Alias(alias) => {
                let mut hasher = FingerprintHasher::new("alias");
                let fp = self.target_fingerprint(alias.target, memo);
                hasher.fingerprint(&fp);
                hasher.finish()
            }
            BuildSource::Target(id) => self.target_fingerprint(*id, memo),
        }
    }

    /// Identity of a target: its name, rule, and effective inputs, deps
    /// and variables. Shared subgraphs are memoised; the graph is expected
    /// to be acyclic.
    pub fn target_fingerprint(&self, id: TargetId, memo: &mut FpMemo) -> Fingerprint {
        if let Some(fp) = memo.done.get(&id) {
            return fp.clone();
        }
        if !memo.visiting.insert(id) {
            return Fingerprint::of_text("cycle", &id.to_string());
        }
        let target = &self.targets[id];
        let mut hasher = FingerprintHasher::new("target");
        hasher.text(&target.name);
        hasher.fingerprint(&target.build_rule.fingerprint());

        let mut input_fps: Vec<Fingerprint> = target
            .build_inputs(self)
            .iter()
            .map(|src| self.source_fingerprint(src, memo))
            .collect();
        input_fps.sort();
        hasher.text("inputs");
        for fp in &input_fps {
            hasher.fingerprint(fp);
        }

        let mut dep_fps: Vec<Fingerprint> = target
            .build_deps(self)
            .iter()
            .map(|src| self.source_fingerprint(src, memo))
            .collect();
        dep_fps.sort();
        hasher.text("deps");
        for fp in &dep_fps {
            hasher.fingerprint(fp);
        }

        hasher.text("vars");
        for (key, value) in target.build_variables(self) {
            hasher.pair(&key, &value);
        }

        let fp = hasher.finish();
        memo.visiting.remove(&id);
        memo.done.insert(id, fp.clone());
        fp
    }

    /// The canonicalisation pass. Deterministic end to end; the only
    /// failure is a duplicate-`no_rename` name collision.
    pub fn finalise(&mut self, defaults: Vec<TargetId>) -> Result<Manifest> {
        let mut memo = FpMemo::default();
        let fps: Vec<Fingerprint> = (0..self.targets.len())
            .map(|id| self.target_fingerprint(id, &mut memo))
            .collect();

        // (a) recursive deduplication by fingerprint
        let mut canonical: BTreeMap<Fingerprint, TargetId> = BTreeMap::new();
        let mut emitted: Vec<TargetId> = Vec::new();
        for id in 0..self.targets.len() {
            self.dedup_visit(id, &fps, &mut canonical, &mut emitted);
        }
        let remap = |ids: &[TargetId]| -> Vec<TargetId> {
            let mut seen = BTreeSet::new();
            ids.iter()
                .map(|&id| canonical[&fps[id]])
                .filter(|&id| seen.insert(id))
                .collect()
        };
        let all_targets = remap(&self.all_targets);
        self.all_targets = all_targets;
        let install_targets = remap(&self.install_targets);
        self.install_targets = install_targets;
        let defaults = remap(&defaults);

        // (b) rename name collisions; at most one no_rename target may
        // keep a contested name
        let mut by_name: BTreeMap<String, Vec<TargetId>> = BTreeMap::new();
        for &id in &emitted {
            by_name
                .entry(self.targets[id].name.clone())
                .or_default()
                .push(id);
        }
        for (name, ids) in by_name {
            let distinct: BTreeSet<&Fingerprint> = ids.iter().map(|&id| &fps[id]).collect();
            if distinct.len() == 1 && !self.rename_all_targets {
                continue;
            }
            let keepers = ids.iter().filter(|&&id| self.targets[id].no_rename).count();
            if keepers > 1 {
                bail!(
                    "{} distinct targets named {:?} are marked no_rename; at most one may keep the name",
                    keepers,
                    name
                );
            }
            for &id in &ids {
                if self.targets[id].no_rename {
                    continue;
                }
                let renamed = {
                    let (base, ext) = split_extension(&self.targets[id].name);
                    format!("{}_{}{}", base, fps[id], ext)
                };
                self.targets[id].name = renamed;
            }
        }

        // (c) option folding: every (rule, opts) group used by two or more
        // targets folds its opts into the rule command
        if self.fold_target_opts {
            let rename_all_rules = self.rename_all_rules;
            let mut groups: BTreeMap<(Fingerprint, String), Vec<TargetId>> = BTreeMap::new();
            for &id in &emitted {
                if self.targets[id].build_rule.is_phony() {
                    continue;
                }
                let rule_fp = self.targets[id].build_rule.fingerprint();
                let opts = self.targets[id].opts_string(self);
                groups.entry((rule_fp, opts)).or_default().push(id);
            }
            for ((_, opts), ids) in groups {
                if opts.is_empty() || ids.len() < 2 {
                    continue;
                }
                let suffix = Fingerprint::of_text("opts", &opts);
                for id in ids {
                    let target = &mut self.targets[id];
                    target.build_rule.cmd = target.build_rule.cmd.replace("${opts}", &opts);
                    if !rename_all_rules {
                        target.build_rule.name =
                            format!("{}_{}", target.build_rule.name, suffix);
                    }
                    target.drop_opts = true;
                }
            }
        }

        // (d) rule unification by fingerprint, then constant renaming and
        // residual rule-name disambiguation
        let mut target_rule_fp: BTreeMap<TargetId, Fingerprint> = BTreeMap::new();
        let mut unique: BTreeMap<Fingerprint, Rule> = BTreeMap::new();
        for &id in &emitted {
            let rule = &self.targets[id].build_rule;
            let fp = rule.fingerprint();
            unique.entry(fp.clone()).or_insert_with(|| rule.clone());
            target_rule_fp.insert(id, fp);
        }

        let mut values_by_key: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for rule in unique.values() {
            for (key, value) in &rule.defaults {
                values_by_key
                    .entry(key.clone())
                    .or_default()
                    .insert(value.clone());
            }
        }
        let conflicted: BTreeSet<String> = values_by_key
            .into_iter()
            .filter(|(_, values)| values.len() > 1 || self.rename_all_constants)
            .map(|(key, _)| key)
            .collect();
        for rule in unique.values_mut() {
            for key in &conflicted {
                if let Some(value) = rule.defaults.remove(key) {
                    let new_key =
                        format!("{}_{}", key, Fingerprint::of_text("constant", &value));
                    rule.cmd = rename_placeholder(&rule.cmd, key, &new_key);
                    rule.defaults.insert(new_key, value);
                }
            }
        }

        let mut fps_by_name: BTreeMap<String, Vec<Fingerprint>> = BTreeMap::new();
        for (fp, rule) in &unique {
            fps_by_name
                .entry(rule.name.clone())
                .or_default()
                .push(fp.clone());
        }
        for (_, fplist) in fps_by_name {
            let distinct: BTreeSet<Fingerprint> = fplist
                .iter()
                .map(|fp| unique[fp].fingerprint())
                .collect();
            if distinct.len() == 1 && !self.rename_all_rules {
                continue;
            }
            for fp in fplist {
                let rule = unique.get_mut(&fp).unwrap();
                if rule.is_phony() {
                    continue;
                }
                let new_fp = rule.fingerprint();
                rule.name = format!("{}_{}", rule.name, new_fp);
            }
        }

        for &id in &emitted {
            self.targets[id].build_rule = unique[&target_rule_fp[&id]].clone();
        }

        let mut rules_by_name: BTreeMap<String, Rule> = BTreeMap::new();
        for rule in unique.into_values() {
            if !rule.is_phony() {
                rules_by_name.insert(rule.name.clone(), rule);
            }
        }

        Ok(Manifest {
            rules: rules_by_name.into_values().collect(),
            targets: emitted,
            defaults,
        })
    }

    fn dedup_visit(
        &mut self,
        id: TargetId,
        fps: &[Fingerprint],
        canonical: &mut BTreeMap<Fingerprint, TargetId>,
        emitted: &mut Vec<TargetId>,
    ) -> TargetId {
        if let Some(&canon) = canonical.get(&fps[id]) {
            if canon != id && self.targets[id].no_rename {
                self.targets[canon].no_rename = true;
            }
            return canon;
        }
        canonical.insert(fps[id].clone(), id);
        emitted.push(id);
        for i in 0..self.targets[id].build_src.len() {
            let child = match &self.targets[id].build_src[i] {
                BuildSource::Target(t) => Some(*t),
                BuildSource::Alias(alias) => Some(alias.target),
                _ => None,
            };
            if let Some(t) = child {
                let canon_child = self.dedup_visit(t, fps, canonical, emitted);
                if canon_child != t {
                    match &mut self.targets[id].build_src[i] {
                        BuildSource::Target(t) => *t = canon_child,
                        BuildSource::Alias(alias) => alias.target = canon_child,
                        _ => {}
                    }
                }
            }
        }
        let mut projections = std::mem::take(&mut self.targets[id].projections);
        projections.remap_targets(&mut |t| self.dedup_visit(t, fps, canonical, emitted));
        self.targets[id].projections = projections;
        id
    }
}

fn hash_variables(hasher: &mut FingerprintHasher, projections: &crate::source::Projections) {
    for (key, vars) in projections.variables.entries() {
        hasher.opt_text(key);
        for (var, values) in vars {
            hasher.text(var);
            for value in values {
                hasher.text(value);
            }
        }
    }
}

/// Split a build name into base and extension, ignoring dots in leading
/// directory components.
pub(crate) fn split_extension(name: &str) -> (&str, &str) {
    let file_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[file_start..].rfind('.') {
        Some(dot) if dot > 0 => name.split_at(file_start + dot),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RuleVariables;

    fn compile_rule() -> Rule {
        Rule::new(
            "compile_cpp",
            "$CXX ${opts} -c $in -o $out",
            "compile $out",
            &[("CXX", "g++")],
            ("cpp", "object"),
        )
    }

    fn object_target(name: &str, src: &str, opts: &str) -> BuildTarget {
        let mut build_src = vec![BuildSource::file(src)];
        if let Some(carrier) = BuildSource::opts_carrier(None, opts) {
            build_src.push(carrier);
        }
        let mut target = BuildTarget::new(name, "object", compile_rule(), build_src);
        target
            .projections
            .inputs
            .insert(None, vec![crate::source::Projected::Own]);
        target
    }

    #[test]
    fn identical_targets_are_emitted_once() {
        let mut registry = Registry::new();
        registry.register(object_target("a.o", "a.cpp", ""));
        registry.register(object_target("a.o", "a.cpp", ""));
        let manifest = registry.finalise(vec![]).unwrap();
        assert_eq!(manifest.targets.len(), 1);
        assert_eq!(registry.target(manifest.targets[0]).name, "a.o");
    }

    #[test]
    fn colliding_targets_are_renamed_with_their_fingerprint() {
        let mut registry = Registry::new();
        let debug = registry.register(object_target("a.o", "a.cpp", ""));
        let release = registry.register(object_target("a.o", "a.cpp", "-O3"));
        let mut memo = FpMemo::default();
        let debug_fp = registry.target_fingerprint(debug, &mut memo);
        let release_fp = registry.target_fingerprint(release, &mut memo);
        let manifest = registry.finalise(vec![]).unwrap();
        assert_eq!(manifest.targets.len(), 2);
        assert_eq!(registry.target(debug).name, format!("a_{}.o", debug_fp));
        assert_eq!(registry.target(release).name, format!("a_{}.o", release_fp));
    }

    #[test]
    fn no_rename_keeps_its_name_and_duplicates_fail() {
        let mut registry = Registry::new();
        let plain = registry.register(object_target("x.o", "x.cpp", ""));
        let keeper = registry.register(object_target("x.o", "x.cpp", "-O3"));
        registry.target_mut(keeper).no_rename = true;
        let manifest = registry.finalise(vec![]).unwrap();
        assert_eq!(registry.target(keeper).name, "x.o");
        assert_ne!(registry.target(plain).name, "x.o");
        drop(manifest);

        let mut registry = Registry::new();
        let a = registry.register(object_target("x.o", "x.cpp", "-O2"));
        let b = registry.register(object_target("x.o", "x.cpp", "-O3"));
        registry.target_mut(a).no_rename = true;
        registry.target_mut(b).no_rename = true;
        assert!(registry.finalise(vec![]).is_err());
    }

    #[test]
    fn shared_opts_fold_into_the_rule() {
        let mut registry = Registry::new();
        for name in ["a", "b", "c"] {
            registry.register(object_target(
                &format!("{}.o", name),
                &format!("{}.cpp", name),
                "-O3",
            ));
        }
        let manifest = registry.finalise(vec![]).unwrap();
        assert_eq!(manifest.rules.len(), 1);
        let rule = &manifest.rules[0];
        assert!(rule.cmd.contains("-O3"));
        assert!(!rule.cmd.contains("${opts}"));
        assert!(rule.name.starts_with("compile_cpp_"));
        for &id in &manifest.targets {
            assert!(!registry.target(id).build_variables(&registry).contains_key("opts"));
        }
    }

    #[test]
    fn distinct_opts_groups_fold_independently() {
        // debug/release: each opts group folds into its own rule
        let mut registry = Registry::new();
        for name in ["a", "b"] {
            registry.register(object_target(&format!("{}.o", name), "in.cpp", "-O0"));
        }
        for name in ["c", "d"] {
            registry.register(object_target(&format!("{}.o", name), "in.cpp", "-O3"));
        }
        let manifest = registry.finalise(vec![]).unwrap();
        assert_eq!(manifest.rules.len(), 2);
        let cmds: Vec<&str> = manifest.rules.iter().map(|r| r.cmd.as_str()).collect();
        assert!(cmds.iter().any(|cmd| cmd.contains("-O0")));
        assert!(cmds.iter().any(|cmd| cmd.contains("-O3")));
    }

    #[test]
    fn lone_target_keeps_per_target_opts() {
        let mut registry = Registry::new();
        registry.register(object_target("a.o", "a.cpp", "-O3"));
        let manifest = registry.finalise(vec![]).unwrap();
        let rule = &manifest.rules[0];
        assert!(rule.cmd.contains("${opts}"));
        let id = manifest.targets[0];
        assert_eq!(registry.target(id).build_variables(&registry)["opts"], "-O3");
    }

    #[test]
    fn conflicting_rule_constants_are_renamed_apart() {
        let mut registry = Registry::new();
        let mut clang_rule = compile_rule();
        clang_rule.defaults.insert("CXX".to_string(), "clang++".to_string());
        registry.register(object_target("a.o", "a.cpp", ""));
        let mut other = BuildTarget::new(
            "b.o",
            "object",
            clang_rule,
            vec![BuildSource::file("b.cpp")],
        );
        other
            .projections
            .inputs
            .insert(None, vec![crate::source::Projected::Own]);
        registry.register(other);
        let manifest = registry.finalise(vec![]).unwrap();
        assert_eq!(manifest.rules.len(), 2);
        let mut keys = BTreeSet::new();
        for rule in &manifest.rules {
            rule.check_placeholders().unwrap();
            assert!(rule.name.starts_with("compile_cpp_"));
            for key in rule.defaults.keys() {
                assert!(keys.insert(key.clone()), "default {} collides", key);
                assert!(key.starts_with("CXX_"));
            }
        }
    }

    #[test]
    fn emission_is_deterministic() {
        let build = || {
            let mut registry = Registry::new();
            registry.register(object_target("a.o", "a.cpp", "-O1"));
            registry.register(object_target("b.o", "b.cpp", "-O1"));
            registry.register(object_target("a.o", "a.cpp", ""));
            let manifest = registry.finalise(vec![]).unwrap();
            let names: Vec<String> = manifest
                .targets
                .iter()
                .map(|&id| registry.target(id).name.clone())
                .collect();
            let rules: Vec<String> = manifest.rules.iter().map(|r| r.name.clone()).collect();
            (names, rules)
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn phony_aggregate_survives_unrenamed() {
        let mut registry = Registry::new();
        let a = registry.register(object_target("a.o", "a.cpp", ""));
        let b = registry.register(object_target("b.o", "b.cpp", ""));
        let all = registry.add_phony("all", &[a, b]);
        let manifest = registry.finalise(vec![all]).unwrap();
        assert_eq!(registry.target(all).name, "all");
        assert!(manifest.rules.iter().all(|r| !r.is_phony()));
        assert_eq!(manifest.defaults, vec![all]);
    }

    #[test]
    fn registered_vars_do_not_collide_with_vars_of_other_targets() {
        let mut registry = Registry::new();
        let with_vars = BuildTarget::new(
            "v.o",
            "object",
            compile_rule(),
            vec![
                BuildSource::file("v.cpp"),
                BuildSource::Vars(RuleVariables::opts(Some("compile"), "-DX")),
            ],
        );
        let id = registry.register(with_vars);
        let vars = registry.target(id).build_variables(&registry);
        assert_eq!(vars["opts"], "-DX");
    }

    #[test]
    fn split_extension_ignores_directory_dots() {
        assert_eq!(split_extension("a.o"), ("a", ".o"));
        assert_eq!(split_extension("dir.d/prog"), ("dir.d/prog", ""));
        assert_eq!(split_extension("dir/lib.so"), ("dir/lib", ".so"));
        assert_eq!(split_extension(".hidden"), (".hidden", ""));
    }
}
