/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Emittable command templates.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use anyhow::bail;
use anyhow::Result;

use crate::fingerprint::Fingerprint;
use crate::fingerprint::FingerprintHasher;

pub const PHONY_RULE: &str = "phony";

/// A command template plus the metadata needed to emit it. `connection`
/// routes rule resolution during graph construction (`(from, to)` target
/// types) and is neither serialised nor part of the rule's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub cmd: String,
    pub description: String,
    pub defaults: BTreeMap<String, String>,
    pub params: Vec<(String, String)>,
    pub connection: (String, String),
}

impl Rule {
    pub fn new(
        name: &str,
        cmd: &str,
        description: &str,
        defaults: &[(&str, &str)],
        connection: (&str, &str),
    ) -> Rule {
        Rule {
            name: name.to_string(),
            cmd: cmd.to_string(),
            description: description.to_string(),
            defaults: defaults
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            params: Vec::new(),
            connection: (connection.0.to_string(), connection.1.to_string()),
        }
    }

    pub fn with_params(mut self, params: &[(&str, &str)]) -> Rule {
        self.params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.params.sort();
        self
    }

    /// The synthetic rule behind aggregate targets (`all`, `install`,
    /// include groups). Writers special-case it: Ninja has a builtin
    /// `phony`, Make emits a `.PHONY` prerequisite line.
    pub fn phony() -> Rule {
        Rule::new(PHONY_RULE, "", "", &[], ("", ""))
    }

    pub fn is_phony(&self) -> bool {
        self.name == PHONY_RULE
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = FingerprintHasher::new("rule");
        hasher.text(&self.name);
        hasher.text(&self.cmd);
        hasher.text(&self.description);
        for (key, value) in &self.defaults {
            hasher.pair(key, value);
        }
        for (key, value) in &self.params {
            hasher.pair(key, value);
        }
        hasher.finish()
    }

    /// All `$VAR` / `${var}` placeholders in the command template.
    pub fn placeholders(&self) -> BTreeSet<String> {
        scan_placeholders(&self.cmd)
    }

    /// Template placeholders other than `in`/`out`/`opts` must be backed by
    /// a default or a param; anything else would emit an undefined variable.
    pub fn check_placeholders(&self) -> Result<()> {
        for name in self.placeholders() {
            if matches!(name.as_str(), "in" | "out" | "opts") {
                continue;
            }
            if self.defaults.contains_key(&name) {
                continue;
            }
            if self.params.iter().any(|(k, _)| *k == name) {
                continue;
            }
            bail!(
                "rule {}: placeholder ${{{}}} has no default or param",
                self.name,
                name
            );
        }
        Ok(())
    }
}

pub fn scan_placeholders(cmd: &str) -> BTreeSet<String> {
    let mut result = BTreeSet::new();
    let bytes = cmd.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        if i >= bytes.len() {
            break;
        }
        if bytes[i] == b'{' {
            if let Some(end) = cmd[i + 1..].find('}') {
                result.insert(cmd[i + 1..i + 1 + end].to_string());
                i += end + 2;
            } else {
                break;
            }
        } else {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            if i > start {
                result.insert(cmd[start..i].to_string());
            }
        }
    }
    result
}

/// Rewrite one placeholder name inside a command template, leaving every
/// other occurrence of `$` untouched. Used by the constant-rename pass.
pub fn rename_placeholder(cmd: &str, old: &str, new: &str) -> String {
    let mut result = String::with_capacity(cmd.len());
    let bytes = cmd.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            result.push(bytes[i] as char);
            i += 1;
            continue;
        }
        if cmd[i + 1..].starts_with('{') {
            if let Some(end) = cmd[i + 2..].find('}') {
                let name = &cmd[i + 2..i + 2 + end];
                if name == old {
                    result.push_str("${");
                    result.push_str(new);
                    result.push('}');
                } else {
                    result.push_str(&cmd[i..i + 3 + end]);
                }
                i += end + 3;
                continue;
            }
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
            end += 1;
        }
        if &cmd[start..end] == old {
            result.push('$');
            result.push_str(new);
        } else {
            result.push_str(&cmd[i..end]);
        }
        i = end.max(start);
    }
    result
}

/// Expand every `$VAR` / `${var}` in a command template through `lookup`.
/// Text that is not a placeholder passes through untouched.
pub fn expand_placeholders(cmd: &str, lookup: &mut impl FnMut(&str) -> String) -> String {
    let mut result = String::with_capacity(cmd.len());
    let bytes = cmd.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            result.push(bytes[i] as char);
            i += 1;
            continue;
        }
        if cmd[i + 1..].starts_with('{') {
            if let Some(end) = cmd[i + 2..].find('}') {
                result.push_str(&lookup(&cmd[i + 2..i + 2 + end]));
                i += end + 3;
                continue;
            }
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
            end += 1;
        }
        if end > start {
            result.push_str(&lookup(&cmd[start..end]));
        } else {
            result.push('$');
        }
        i = end.max(start);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_rule() -> Rule {
        Rule::new(
            "compile_cpp",
            "$CXX $CXX_FLAGS ${opts} -MMD -MT $out -MF $out.d -c $in -o $out",
            "compile(cpp) $out",
            &[("CXX", "g++"), ("CXX_FLAGS", "-Wall")],
            ("cpp", "object"),
        )
        .with_params(&[("depfile", "$out.d"), ("deps", "gcc")])
    }

    #[test]
    fn placeholder_scan() {
        let names = compile_rule().placeholders();
        let expected: BTreeSet<String> = ["CXX", "CXX_FLAGS", "opts", "in", "out"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn placeholder_closure_holds() {
        compile_rule().check_placeholders().unwrap();
        let loose = Rule::new("bad", "$TOOL $in", "", &[], ("", ""));
        assert!(loose.check_placeholders().is_err());
    }

    #[test]
    fn identity_ignores_connection() {
        let mut a = compile_rule();
        let b = compile_rule();
        a.connection = ("other".to_string(), "object".to_string());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn identity_tracks_defaults() {
        let mut a = compile_rule();
        a.defaults.insert("CXX".to_string(), "clang++".to_string());
        assert_ne!(a.fingerprint(), compile_rule().fingerprint());
    }

    #[test]
    fn rename_placeholder_both_syntaxes() {
        let cmd = "$CXX ${CXX} $CXXFOO -o $out";
        let out = rename_placeholder(cmd, "CXX", "CXX_1234");
        assert_eq!(out, "$CXX_1234 ${CXX_1234} $CXXFOO -o $out");
    }
}
