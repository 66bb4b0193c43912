/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The user-facing facade: resolves tool rules, classifies inputs,
//! materialises object-file intermediates, and constructs library,
//! executable and install targets. Nested contexts share the registry and
//! platform but carry their own tool set and name prefix.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::bail;
use anyhow::Result;

use crate::external;
use crate::external::External;
use crate::external::ExternalArgs;
use crate::files;
use crate::platform::Platform;
use crate::registry::split_extension;
use crate::registry::Registry;
use crate::rule::Rule;
use crate::source::BuildSource;
use crate::source::Projected;
use crate::source::Projections;
use crate::source::RuleVariables;
use crate::source::TargetAlias;
use crate::source::TargetId;
use crate::target::BuildTarget;
use crate::toolchain::ToolHolder;

/// Artifact kinds, as opposed to compilable source-language tags.
const ARTIFACT_TYPES: &[&str] = &["object", "shared", "static", "exe", "install", "phony"];

fn is_artifact(target_type: &str) -> bool {
    ARTIFACT_TYPES.contains(&target_type)
}

/// Replace a name's extension, ignoring dots in directory components.
fn normed_name(name: &str, forced_ext: &str) -> String {
    let (base, _) = split_extension(name);
    format!("{}{}", base, forced_ext)
}

fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn dirname(name: &str) -> &str {
    match name.rfind('/') {
        Some(0) => "/",
        Some(i) => &name[..i],
        None => ".",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMode {
    #[default]
    Single,
    Direct,
}

#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    pub compiler_opts: Option<String>,
    pub linker_opts: Option<String>,
    pub link_mode: LinkMode,
    pub no_rename: bool,
    pub install_name: Option<String>,
}

pub struct Context {
    registry: Rc<RefCell<Registry>>,
    platform: Rc<Platform>,
    pub tools: ToolHolder,
    prefix: String,
    base_dir: PathBuf,
    object_dir: Option<String>,
    pub implicit_object_input: Vec<BuildSource>,
    pub implicit_static_library_input: Vec<BuildSource>,
    pub implicit_shared_library_input: Vec<BuildSource>,
    pub implicit_executable_input: Vec<BuildSource>,
}

impl Context {
    pub fn new(
        registry: Rc<RefCell<Registry>>,
        platform: Rc<Platform>,
        tools: ToolHolder,
        base_dir: &Path,
    ) -> Context {
        Context {
            registry,
            platform,
            tools,
            prefix: String::new(),
            base_dir: base_dir.to_path_buf(),
            object_dir: None,
            implicit_object_input: Vec::new(),
            implicit_static_library_input: Vec::new(),
            implicit_shared_library_input: Vec::new(),
            implicit_executable_input: Vec::new(),
        }
    }

    pub fn registry(&self) -> Rc<RefCell<Registry>> {
        self.registry.clone()
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn set_object_dir(&mut self, dir: &str) {
        self.object_dir = Some(dir.trim_end_matches('/').to_string());
    }

    /// Join a name with the include-prefix chain.
    pub fn prefixed(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// A nested context for a sub-directory build description: shares the
    /// registry and platform, copies the tool set, joins prefixes.
    pub fn child(&self, dir_name: &str, inherit: bool) -> Context {
        Context {
            registry: self.registry.clone(),
            platform: self.platform.clone(),
            tools: self.tools.clone(),
            prefix: format!("{}{}/", self.prefix, dir_name),
            base_dir: self.base_dir.join(dir_name),
            object_dir: if inherit { self.object_dir.clone() } else { None },
            implicit_object_input: if inherit {
                self.implicit_object_input.clone()
            } else {
                Vec::new()
            },
            implicit_static_library_input: if inherit {
                self.implicit_static_library_input.clone()
            } else {
                Vec::new()
            },
            implicit_shared_library_input: if inherit {
                self.implicit_shared_library_input.clone()
            } else {
                Vec::new()
            },
            implicit_executable_input: if inherit {
                self.implicit_executable_input.clone()
            } else {
                Vec::new()
            },
        }
    }

    pub fn find_external(&self, name: &str, args: &ExternalArgs) -> Option<Rc<External>> {
        external::probe_external(name, args)
    }

    /// Resolve the rule connecting two target types: tools in stable role
    /// order first, then platform rules. Returns a fresh clone so that
    /// later mutation cannot leak back into the tool-owned template.
    pub fn find_rule(&self, from: &str, to: &str) -> Result<Rule> {
        let wanted = (from.to_string(), to.to_string());
        for (_, tool) in self.tools.iter_resolved() {
            for rule in &tool.rules {
                if rule.connection == wanted {
                    return Ok(rule.clone());
                }
            }
        }
        for rule in self.platform.rules() {
            if rule.connection == wanted {
                return Ok(rule.clone());
            }
        }
        bail!("no rule connects {:?} -> {:?}", from, to);
    }

    /// Target type of a source: its explicit type if set, otherwise by
    /// looking the filename extension up in every tool. More than one
    /// candidate type is an error; none makes the source passive.
    pub fn classify(&self, src: &BuildSource) -> Result<Option<String>> {
        match src {
            BuildSource::Target(id) => {
                Ok(Some(self.registry.borrow().target(*id).target_type.clone()))
            }
            BuildSource::Alias(alias) => Ok(Some(
                self.registry
                    .borrow()
                    .target(alias.target)
                    .target_type
                    .clone(),
            )),
            BuildSource::Vars(_) | BuildSource::External(_) => Ok(None),
            BuildSource::File(file) => {
                if let Some(explicit) = &file.target_type {
                    return Ok(Some(explicit.clone()));
                }
                let name = basename(&file.name);
                let ext = match name.rfind('.') {
                    Some(dot) if dot > 0 => &name[dot..],
                    _ => return Ok(None),
                };
                let mut types = BTreeSet::new();
                for (_, tool) in self.tools.iter_resolved() {
                    if let Some(target_type) = tool.target_types_by_ext.get(ext) {
                        types.insert(target_type.clone());
                    }
                }
                match types.len() {
                    0 | 1 => Ok(types.into_iter().next()),
                    _ => bail!(
                        "extension of {:?} maps to multiple target types {:?}; set the target type explicitly",
                        file.name,
                        types
                    ),
                }
            }
        }
    }

    fn object_target(
        &mut self,
        name: &str,
        inputs: Vec<BuildSource>,
        compiler_opts: Option<&str>,
    ) -> Result<TargetId> {
        let mut types = BTreeSet::new();
        for src in &inputs {
            if let Some(target_type) = self.classify(src)? {
                if !is_artifact(&target_type) {
                    types.insert(target_type);
                }
            }
        }
        if types.len() != 1 {
            bail!(
                "unable to find a unique source type (candidates {:?}) to generate {}",
                types,
                name
            );
        }
        let input_type = types.into_iter().next().unwrap();
        let rule = self.find_rule(&input_type, "object")?;

        let object_ext = self.platform.extension("object").to_string();
        let mut object_name = normed_name(name, &object_ext);
        if let Some(dir) = &self.object_dir {
            object_name = format!("{}/{}", dir, object_name);
        }

        let mut build_src = self.implicit_object_input.clone();
        build_src.extend(inputs);
        if let Some(opts) = compiler_opts {
            build_src.extend(BuildSource::opts_carrier(None, opts));
        }

        let mut target = BuildTarget::new(&object_name, "object", rule, build_src);
        // advertise the object as an input to later rules
        target.projections.inputs.insert(None, vec![Projected::Own]);
        Ok(self.registry.borrow_mut().register(target))
    }

    /// Synthesise an object-file target from exactly one source type.
    pub fn object_file(
        &mut self,
        name: &str,
        inputs: Vec<BuildSource>,
        compiler_opts: Option<&str>,
    ) -> Result<TargetId> {
        let prefixed = self.prefixed(name);
        let id = self.object_target(&prefixed, inputs, compiler_opts)?;
        self.registry.borrow_mut().target_mut(id).user_name = Some(name.to_string());
        Ok(id)
    }

    /// The unified link procedure behind shared/static/executable
    /// construction.
    fn link(
        &mut self,
        user_name: &str,
        build_name: &str,
        target_type: &str,
        inputs: Vec<BuildSource>,
        implicit: Vec<BuildSource>,
        projections: Projections,
        options: &LinkOptions,
    ) -> Result<TargetId> {
        let mut inputs = inputs;
        inputs.extend(self.platform.required_inputs(target_type, &self.tools));

        // partition: compilable sources, linkable artifacts, and the flag
        // environment that surrounds every synthesised object build
        let mut compile_groups: BTreeMap<String, Vec<BuildSource>> = BTreeMap::new();
        let mut linkable: Vec<BuildSource> = Vec::new();
        let mut environment: Vec<BuildSource> = Vec::new();
        for src in inputs {
            match self.classify(&src)? {
                Some(target_type) if !is_artifact(&target_type) => {
                    compile_groups.entry(target_type).or_default().push(src);
                }
                Some(_) => linkable.push(src),
                None => {
                    if src.is_flag_carrier() {
                        environment.push(src);
                    } else {
                        linkable.push(src);
                    }
                }
            }
        }

        let direct = options.link_mode == LinkMode::Direct && compile_groups.len() == 1;
        let compiler_opts = options.compiler_opts.as_deref();

        let mut build_src: Vec<BuildSource> = Vec::new();
        let rule;
        if direct {
            let (input_type, sources) = compile_groups.into_iter().next().unwrap();
            rule = self.find_rule(&input_type, target_type)?;
            build_src.extend(self.implicit_object_input.clone());
            if let Some(opts) = compiler_opts {
                build_src.extend(BuildSource::opts_carrier(None, opts));
            }
            build_src.extend(environment.iter().cloned());
            build_src.extend(sources);
        } else {
            rule = self.find_rule("object", target_type)?;
            for sources in compile_groups.into_values() {
                for src in sources {
                    let src_name = self
                        .registry
                        .borrow()
                        .source_name(&src)
                        .unwrap_or_else(|| build_name.to_string());
                    let mut object_inputs = environment.clone();
                    object_inputs.push(src);
                    let object = self.object_target(&src_name, object_inputs, compiler_opts)?;
                    build_src.push(BuildSource::Target(object));
                }
            }
            build_src.extend(environment.iter().cloned());
        }
        build_src.extend(linkable);
        build_src.extend(implicit);
        if let Some(opts) = options.linker_opts.as_deref() {
            build_src.extend(BuildSource::opts_carrier(None, opts));
        }

        // a static archive carries no link-time flags, only objects
        if target_type == "static" {
            build_src.retain(|src| !src.is_external());
        }

        let mut target = BuildTarget::new(build_name, target_type, rule, build_src);
        target.user_name = Some(user_name.to_string());
        target.install_name = Some(
            options
                .install_name
                .clone()
                .unwrap_or_else(|| basename(build_name).to_string()),
        );
        target.no_rename = options.no_rename;
        target.projections = projections;

        let mut registry = self.registry.borrow_mut();
        let id = registry.register(target);
        registry.all_targets.push(id);
        Ok(id)
    }

    pub fn shared_library(
        &mut self,
        name: &str,
        inputs: Vec<BuildSource>,
        options: &LinkOptions,
    ) -> Result<TargetId> {
        let shared_ext = self.platform.extension("shared").to_string();
        let build_name = normed_name(&self.prefixed(name), &shared_ext);
        let dir = dirname(&build_name).to_string();
        let stem = normed_name(basename(&build_name), "");
        let link_name = stem.strip_prefix("lib").unwrap_or(&stem).to_string();

        let mut projections = Projections::default();
        let mut vars = BTreeMap::new();
        vars.insert(
            "opts".to_string(),
            vec![
                format!("-L{}", dir),
                format!("-Wl,-rpath {}", dir),
                format!("-l{}", link_name),
            ],
        );
        projections.variables.insert(None, vars);
        projections.deps.insert(None, vec![Projected::Own]);
        // a shared library is an order-only dependency of its consumers,
        // never a direct input

        let implicit = self.implicit_shared_library_input.clone();
        self.link(
            name,
            &build_name,
            "shared",
            inputs,
            implicit,
            projections,
            options,
        )
    }

    pub fn static_library(
        &mut self,
        name: &str,
        inputs: Vec<BuildSource>,
        options: &LinkOptions,
    ) -> Result<TargetId> {
        let static_ext = self.platform.extension("static").to_string();
        let build_name = normed_name(&self.prefixed(name), &static_ext);
        let mut projections = Projections::default();
        projections.inputs.insert(None, vec![Projected::Own]);
        let implicit = self.implicit_static_library_input.clone();
        self.link(
            name,
            &build_name,
            "static",
            inputs,
            implicit,
            projections,
            options,
        )
    }

    pub fn executable(
        &mut self,
        name: &str,
        inputs: Vec<BuildSource>,
        options: &LinkOptions,
    ) -> Result<TargetId> {
        let exe_ext = self.platform.extension("exe").to_string();
        let mut build_name = self.prefixed(name);
        if !build_name.ends_with(&exe_ext) {
            build_name.push_str(&exe_ext);
        }
        let implicit = self.implicit_executable_input.clone();
        self.link(
            name,
            &build_name,
            "exe",
            inputs,
            implicit,
            Projections::default(),
            options,
        )
    }

    fn resolve_on_disk(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }

    /// A shared library that already exists on disk: no target is created,
    /// the returned carrier only injects the linker flags into consumers.
    pub fn shared_library_reference(&self, path: &str) -> Result<BuildSource> {
        let shared_ext = self.platform.extension("shared");
        let path = normed_name(path, shared_ext);
        if !self.resolve_on_disk(&path).is_file() {
            bail!("referenced shared library {:?} does not exist", path);
        }
        let dir = dirname(&path).to_string();
        let stem = normed_name(basename(&path), "");
        let link_name = stem.strip_prefix("lib").unwrap_or(&stem);
        let mut vars = BTreeMap::new();
        vars.insert(
            "opts".to_string(),
            vec![
                format!("-L{}", dir),
                format!("-Wl,-rpath {}", dir),
                format!("-l{}", link_name),
            ],
        );
        Ok(BuildSource::Vars(RuleVariables::new(Some("link"), vars)))
    }

    /// A static archive that already exists on disk: appears verbatim in
    /// the consumer's link line.
    pub fn static_library_reference(&self, path: &str) -> Result<BuildSource> {
        let static_ext = self.platform.extension("static");
        let path = normed_name(path, static_ext);
        if !self.resolve_on_disk(&path).is_file() {
            bail!("referenced static library {:?} does not exist", path);
        }
        Ok(BuildSource::file(&path))
    }

    /// Reference libraries matched from an on-disk directory.
    pub fn match_libs(&self, pattern: &str, dir: Option<&str>) -> Result<Vec<BuildSource>> {
        let dir = dir.unwrap_or("/usr/lib");
        let shared_ext = self.platform.extension("shared").to_string();
        let static_ext = self.platform.extension("static").to_string();
        let mut result = Vec::new();
        for name in files::match_files(pattern, Path::new(dir), false)? {
            let full = format!("{}/{}", dir.trim_end_matches('/'), name);
            if name.ends_with(&shared_ext) {
                result.push(self.shared_library_reference(&full)?);
            } else if name.ends_with(&static_ext) {
                result.push(self.static_library_reference(&full)?);
            }
        }
        Ok(result)
    }

    /// Install targets: one copy rule per installed artifact, plus
    /// registration in the install list used for the phony aggregate.
    pub fn install(
        &mut self,
        targets: &[TargetId],
        destination: Option<&str>,
    ) -> Result<Vec<TargetId>> {
        let mut result = Vec::new();
        for &target in targets {
            let (target_type, install_name) = {
                let registry = self.registry.borrow();
                let t = registry.target(target);
                let install_name = t
                    .install_name
                    .clone()
                    .unwrap_or_else(|| basename(&t.name).to_string());
                (t.target_type.clone(), install_name)
            };
            let dest = match destination {
                Some(dest) => dest.to_string(),
                None => match self.platform.install_path(&target_type) {
                    Some(path) => path.to_string(),
                    None => bail!(
                        "no install destination for target type {:?}; pass one explicitly",
                        target_type
                    ),
                },
            };
            let rule = self.find_rule(&target_type, "install")?;
            let name = format!("{}/{}", dest.trim_end_matches('/'), install_name);
            let build_src = vec![BuildSource::Alias(TargetAlias { target })];
            let install_target = BuildTarget::new(&name, "install", rule, build_src);
            let mut registry = self.registry.borrow_mut();
            let id = registry.register(install_target);
            registry.install_targets.push(id);
            result.push(id);
        }
        Ok(result)
    }

    pub fn find_internal(&self, name: &str) -> Result<TargetId> {
        self.registry.borrow().find_internal(name)
    }

    pub fn find_internal_opt(&self, name: &str) -> Result<Option<TargetId>> {
        self.registry.borrow().find_internal_opt(name)
    }

    /// Generate a language binding with SWIG: a wrapper-source generation
    /// target followed by a shared library linking the wrapper against the
    /// language runtime and the wrapped libraries.
    pub fn swig_wrapper(
        &mut self,
        lang: &str,
        name: &str,
        interface: &str,
        libs: Vec<BuildSource>,
        swig_opts: Option<&str>,
        wrapper_ext: Rc<External>,
    ) -> Result<TargetId> {
        let rule = Rule::new(
            &format!("swig_cpp_{}", lang),
            &format!(
                "swig -c++ -{} -I. ${{opts}} -module ${{module_name}} -o $out $in",
                lang
            ),
            &format!("swig(cpp -> {}) $out", lang),
            &[("module_name", "")],
            ("swig", "cpp"),
        );
        let src_name = normed_name(&self.prefixed(name), ".cpp");

        let mut vars = BTreeMap::new();
        vars.insert("module_name".to_string(), vec![name.to_string()]);
        if let Some(opts) = swig_opts {
            vars.insert(
                "opts".to_string(),
                opts.split_whitespace().map(str::to_string).collect(),
            );
        }
        let build_src = vec![
            BuildSource::file(&self.prefixed(interface)),
            BuildSource::Vars(RuleVariables::new(None, vars)),
        ];

        let mut wrapper = BuildTarget::new(&src_name, "cpp", rule, build_src);
        wrapper.projections.inputs.insert(None, vec![Projected::Own]);
        // consumers compiling the wrapper need the language runtime's flags
        wrapper.projections.variables = wrapper_ext.projections.variables.clone();
        let wrapper_id = self.registry.borrow_mut().register(wrapper);

        let mut inputs = vec![
            BuildSource::Target(wrapper_id),
            BuildSource::External(wrapper_ext),
        ];
        inputs.extend(libs);
        self.shared_library(&format!("_{}", name), inputs, &LinkOptions::default())
    }
}
