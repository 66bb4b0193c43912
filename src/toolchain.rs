/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Toolchains bind tool roles (c, cpp, fortran, linker) to externals
//! lazily; the ToolHolder is the mutable facade a context consults.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::rc::Rc;

use anyhow::bail;
use anyhow::Result;

use crate::external;
use crate::external::External;
use crate::external::ExternalArgs;

/// A lazy bundle of tool roles. Each role resolves to an external from the
/// catalogue; the factory runs at most once, and a probe or version
/// failure leaves the slot unbound without aborting.
#[derive(Debug)]
pub struct Toolchain {
    pub name: String,
    roles: BTreeMap<String, String>,
    cache: RefCell<BTreeMap<String, Option<Rc<External>>>>,
}

impl Toolchain {
    pub fn new(name: &str, roles: &[(&str, &str)]) -> Toolchain {
        Toolchain {
            name: name.to_string(),
            roles: roles
                .iter()
                .map(|(role, external)| (role.to_string(), external.to_string()))
                .collect(),
            cache: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    pub fn lookup(&self, role: &str, args: &ExternalArgs) -> Option<Rc<External>> {
        if let Some(cached) = self.cache.borrow().get(role) {
            return cached.clone();
        }
        let resolved = self
            .roles
            .get(role)
            .and_then(|name| external::probe_external(name, args));
        self.cache
            .borrow_mut()
            .insert(role.to_string(), resolved.clone());
        resolved
    }
}

/// Look a toolchain up by name. An unknown toolchain is a configuration
/// error; whether its tools actually probe is decided lazily per role.
pub fn find_toolchain(name: &str) -> Result<Rc<Toolchain>> {
    let toolchain = match name.to_lowercase().as_str() {
        "gcc" => Toolchain::new(
            "gcc",
            &[
                ("c", "gcc-c"),
                ("cpp", "gcc"),
                ("fortran", "gfortran"),
                ("linker", "gcc"),
            ],
        ),
        "clang" | "llvm" => Toolchain::new(
            "clang",
            &[("c", "clang-c"), ("cpp", "clang"), ("linker", "clang")],
        ),
        _ => bail!("unknown toolchain {:?}", name),
    };
    Ok(Rc::new(toolchain))
}

/// The tool set a context consults. Roles can be bound directly, resolved
/// through a toolchain, or deleted; deletions are sticky, so a removed
/// role is never re-populated from the toolchain. Iteration order is
/// stable by role name.
#[derive(Debug, Clone, Default)]
pub struct ToolHolder {
    bound: BTreeMap<String, Rc<External>>,
    toolchain: Option<Rc<Toolchain>>,
    deleted: BTreeSet<String>,
    role_args: BTreeMap<String, ExternalArgs>,
}

impl ToolHolder {
    pub fn new() -> ToolHolder {
        ToolHolder::default()
    }

    pub fn with_toolchain(toolchain: Rc<Toolchain>) -> ToolHolder {
        ToolHolder {
            toolchain: Some(toolchain),
            ..Default::default()
        }
    }

    pub fn set_toolchain(&mut self, toolchain: Rc<Toolchain>) {
        self.toolchain = Some(toolchain);
    }

    pub fn set(&mut self, role: &str, external: Rc<External>) {
        self.deleted.remove(role);
        self.bound.insert(role.to_string(), external);
    }

    pub fn remove(&mut self, role: &str) {
        self.bound.remove(role);
        self.deleted.insert(role.to_string());
    }

    /// Per-role factory arguments (`std`, version predicates); must be set
    /// before the role is first resolved.
    pub fn set_args(&mut self, role: &str, args: ExternalArgs) {
        self.role_args.insert(role.to_string(), args);
    }

    pub fn get(&self, role: &str) -> Option<Rc<External>> {
        if self.deleted.contains(role) {
            return None;
        }
        if let Some(external) = self.bound.get(role) {
            return Some(external.clone());
        }
        let toolchain = self.toolchain.as_ref()?;
        let default_args = ExternalArgs::default();
        let args = self.role_args.get(role).unwrap_or(&default_args);
        toolchain.lookup(role, args)
    }

    pub fn roles(&self) -> Vec<String> {
        let mut roles: BTreeSet<String> = self.bound.keys().cloned().collect();
        if let Some(toolchain) = &self.toolchain {
            roles.extend(toolchain.roles().map(str::to_string));
        }
        roles
            .into_iter()
            .filter(|role| !self.deleted.contains(role))
            .collect()
    }

    /// All resolvable tools, in stable role order. Resolving forces the
    /// lazy toolchain bindings.
    pub fn iter_resolved(&self) -> Vec<(String, Rc<External>)> {
        self.roles()
            .into_iter()
            .filter_map(|role| self.get(&role).map(|external| (role, external)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::test_fixtures::toy_cpp;

    #[test]
    fn deleted_roles_stay_deleted() {
        let mut tools = ToolHolder::new();
        tools.set("cpp", Rc::new(toy_cpp()));
        assert!(tools.get("cpp").is_some());
        tools.remove("cpp");
        assert!(tools.get("cpp").is_none());
        // sticky even with a toolchain that knows the role
        tools.set_toolchain(find_toolchain("gcc").unwrap());
        assert!(tools.get("cpp").is_none());
        assert!(!tools.roles().contains(&"cpp".to_string()));
    }

    #[test]
    fn rebinding_revives_a_deleted_role() {
        let mut tools = ToolHolder::new();
        tools.remove("cpp");
        tools.set("cpp", Rc::new(toy_cpp()));
        assert!(tools.get("cpp").is_some());
    }

    #[test]
    fn unknown_toolchain_is_an_error() {
        assert!(find_toolchain("abcd").is_err());
        assert!(find_toolchain("gcc").is_ok());
    }

    #[test]
    fn toolchain_probe_runs_at_most_once() {
        // pthread's factory never spawns a process, so this is hermetic
        let toolchain = Toolchain::new("test", &[("threads", "pthread")]);
        let args = ExternalArgs::default();
        let first = toolchain.lookup("threads", &args).unwrap();
        let second = toolchain.lookup("threads", &args).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert!(toolchain.lookup("nonexistent-role", &args).is_none());
    }

    #[test]
    fn holder_iteration_is_stable_by_role() {
        let mut tools = ToolHolder::new();
        tools.set("linker", Rc::new(toy_cpp()));
        tools.set("c", Rc::new(toy_cpp()));
        tools.set("cpp", Rc::new(toy_cpp()));
        let roles: Vec<String> = tools.iter_resolved().into_iter().map(|(r, _)| r).collect();
        assert_eq!(roles, vec!["c", "cpp", "linker"]);
    }
}
