/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The declarative build description: a TOML document covering the whole
//! configuration surface (tool selection, externals, targets, installs,
//! sub-directory includes), deserialized with serde and evaluated against
//! a Context.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::bail;
use anyhow::Context as _;
use anyhow::Result;
use serde::Deserialize;

use crate::context::Context;
use crate::context::LinkMode;
use crate::context::LinkOptions;
use crate::external;
use crate::external::ExternalArgs;
use crate::files;
use crate::source::BuildSource;
use crate::source::InputFile;
use crate::source::TargetId;
use crate::toolchain;

fn default_true() -> bool {
    true
}

/// One or many; a single string is whitespace-split, matching the
/// convention of space-separated source lists.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Sources {
    One(String),
    Many(Vec<String>),
}

impl Sources {
    fn tokens(&self) -> Vec<String> {
        match self {
            Sources::One(text) => text.split_whitespace().map(str::to_string).collect(),
            Sources::Many(list) => list.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProjectSection {
    /// Targets selected by default; empty means the `all` aggregate.
    #[serde(default)]
    pub default_targets: Vec<String>,
    /// Back-ends to emit: `ninja`, `make`.
    #[serde(default)]
    pub output: Vec<String>,
    /// Directory prefix for synthesised object files.
    pub object_dir: Option<String>,
    /// Files implicitly added to every target's inputs.
    #[serde(default)]
    pub implicit_input: Vec<String>,
    #[serde(default)]
    pub rename_all_targets: bool,
    #[serde(default)]
    pub rename_all_rules: bool,
    #[serde(default)]
    pub rename_all_constants: bool,
    #[serde(default = "default_true")]
    pub fold_target_opts: bool,
}

/// Tool selection. Any key other than `toolchain`/`remove` names a role:
/// `cpp = { std = "c++17" }` passes factory arguments,
/// `linker = { external = "clang" }` binds the role outright.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ToolsSection {
    pub toolchain: Option<String>,
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(flatten, default)]
    pub roles: BTreeMap<String, RoleEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RoleEntry {
    /// Bind this role to a named external instead of the toolchain's.
    pub external: Option<String>,
    #[serde(flatten)]
    pub args: ExternalArgs,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExternalEntry {
    pub name: String,
    /// A missing optional external is skipped instead of failing the run.
    #[serde(default)]
    pub optional: bool,
    /// Apply this external to every target instead of per-target `uses`.
    #[serde(default)]
    pub global: bool,
    #[serde(flatten)]
    pub args: ExternalArgs,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ObjectEntry {
    pub name: String,
    pub sources: Sources,
    #[serde(default)]
    pub recurse: bool,
    pub compiler_opts: Option<String>,
    pub source_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TargetEntry {
    pub name: String,
    /// Absent sources turn a library entry into an on-disk reference.
    pub sources: Option<Sources>,
    #[serde(default)]
    pub recurse: bool,
    pub compiler_opts: Option<String>,
    pub linker_opts: Option<String>,
    /// `single` (default) or `direct`.
    pub link_mode: Option<String>,
    /// Externals this target consumes.
    #[serde(default)]
    pub uses: Vec<String>,
    /// Internal targets or on-disk reference libraries.
    #[serde(default)]
    pub libs: Vec<String>,
    /// Preprocessor definitions, each emitted as `-DNAME`.
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub no_rename: bool,
    pub install_name: Option<String>,
    pub source_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SwigEntry {
    pub language: String,
    pub name: String,
    pub interface: String,
    #[serde(default)]
    pub libs: Vec<String>,
    pub swig_opts: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct InstallEntry {
    pub targets: Vec<String>,
    pub destination: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct IncludeEntry {
    pub path: String,
    #[serde(default)]
    pub inherit: bool,
    /// Phony aggregate name for everything the included description adds.
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BuildFile {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default, rename = "external")]
    pub externals: Vec<ExternalEntry>,
    #[serde(default, rename = "include")]
    pub includes: Vec<IncludeEntry>,
    #[serde(default, rename = "object")]
    pub objects: Vec<ObjectEntry>,
    #[serde(default, rename = "static-library")]
    pub static_libraries: Vec<TargetEntry>,
    #[serde(default, rename = "shared-library")]
    pub shared_libraries: Vec<TargetEntry>,
    #[serde(default, rename = "executable")]
    pub executables: Vec<TargetEntry>,
    #[serde(default, rename = "swig-wrapper")]
    pub swig_wrappers: Vec<SwigEntry>,
    #[serde(default, rename = "install")]
    pub installs: Vec<InstallEntry>,
}

/// Script-level results the driver needs after evaluation.
#[derive(Debug, Default)]
pub struct Outcome {
    pub default_targets: Vec<String>,
    pub outputs: Vec<String>,
}

pub fn read_build_file(path: &Path) -> Result<BuildFile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read build description {}", path.display()))?;
    let build: BuildFile = toml::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(build)
}

/// Externals and reference libraries bound to names during evaluation.
type Scope = BTreeMap<String, BuildSource>;

pub fn evaluate(ctx: &mut Context, build: &BuildFile) -> Result<Outcome> {
    evaluate_at(ctx, build, 0)
}

fn evaluate_at(ctx: &mut Context, build: &BuildFile, depth: usize) -> Result<Outcome> {
    if depth > 32 {
        bail!("include nesting too deep; is there an include cycle?");
    }

    // project knobs: canonicaliser flags and defaults are global and only
    // honoured at the top level; path-shaping knobs apply per context
    if depth == 0 {
        let registry = ctx.registry();
        let mut registry = registry.borrow_mut();
        registry.rename_all_targets = build.project.rename_all_targets;
        registry.rename_all_rules = build.project.rename_all_rules;
        registry.rename_all_constants = build.project.rename_all_constants;
        registry.fold_target_opts = build.project.fold_target_opts;
    }
    if let Some(dir) = &build.project.object_dir {
        ctx.set_object_dir(dir);
    }
    for file in &build.project.implicit_input {
        let src = BuildSource::file(&ctx.prefixed(file));
        ctx.implicit_object_input.push(src.clone());
        ctx.implicit_static_library_input.push(src.clone());
        ctx.implicit_shared_library_input.push(src.clone());
        ctx.implicit_executable_input.push(src);
    }

    apply_tools(ctx, &build.tools)?;

    let mut scope = Scope::new();
    for entry in &build.externals {
        match ctx.find_external(&entry.name, &entry.args) {
            Some(ext) => {
                let src = BuildSource::External(ext);
                if entry.global {
                    ctx.implicit_object_input.push(src.clone());
                    ctx.implicit_static_library_input.push(src.clone());
                    ctx.implicit_shared_library_input.push(src.clone());
                    ctx.implicit_executable_input.push(src.clone());
                }
                scope.insert(entry.name.clone(), src);
            }
            None if entry.optional => {
                log::info!("optional external {} not available", entry.name);
            }
            None => bail!(
                "required external {:?} was not found; mark it optional to build without it",
                entry.name
            ),
        }
    }

    for entry in &build.includes {
        evaluate_include(ctx, entry, depth)?;
    }

    for entry in &build.objects {
        let inputs = resolve_sources(
            ctx,
            &scope,
            &entry.sources.tokens(),
            entry.recurse,
            entry.source_type.as_deref(),
        )?;
        ctx.object_file(&entry.name, inputs, entry.compiler_opts.as_deref())?;
    }

    for entry in &build.static_libraries {
        evaluate_target(ctx, &mut scope, entry, TargetKind::Static)?;
    }
    for entry in &build.shared_libraries {
        evaluate_target(ctx, &mut scope, entry, TargetKind::Shared)?;
    }
    for entry in &build.executables {
        evaluate_target(ctx, &mut scope, entry, TargetKind::Executable)?;
    }

    for entry in &build.swig_wrappers {
        evaluate_swig(ctx, &scope, entry)?;
    }

    for entry in &build.installs {
        let mut ids = Vec::new();
        for name in &entry.targets {
            ids.push(ctx.find_internal(name)?);
        }
        ctx.install(&ids, entry.destination.as_deref())?;
    }

    Ok(Outcome {
        default_targets: build.project.default_targets.clone(),
        outputs: build.project.output.clone(),
    })
}

fn apply_tools(ctx: &mut Context, tools: &ToolsSection) -> Result<()> {
    if let Some(name) = &tools.toolchain {
        ctx.tools.set_toolchain(toolchain::find_toolchain(name)?);
    }
    for role in &tools.remove {
        ctx.tools.remove(role);
    }
    for (role, entry) in &tools.roles {
        match &entry.external {
            Some(name) => match external::probe_external(name, &entry.args) {
                // an explicit binding that cannot probe is a hard error:
                // the description demanded this exact tool
                Some(ext) => ctx.tools.set(role, ext),
                None => bail!("external {:?} bound to tool role {:?} was not found", name, role),
            },
            None => ctx.tools.set_args(role, entry.args.clone()),
        }
    }
    Ok(())
}

fn evaluate_include(ctx: &mut Context, entry: &IncludeEntry, depth: usize) -> Result<()> {
    let path = Path::new(&entry.path);
    let (dir, file) = if path.extension().map_or(false, |ext| ext == "toml") {
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        (dir.to_path_buf(), path.to_path_buf())
    } else {
        (path.to_path_buf(), path.join("build.toml"))
    };
    let dir = dir.to_string_lossy().into_owned();
    if dir.is_empty() || dir == "." {
        bail!("include path {:?} must name a sub-directory", entry.path);
    }

    let registry = ctx.registry();
    let before = registry.borrow().len();

    let child_build = read_build_file(&ctx.base_dir().join(&file))?;
    let mut child = ctx.child(&dir, entry.inherit);
    evaluate_at(&mut child, &child_build, depth + 1)?;
    drop(child);

    if let Some(name) = &entry.name {
        let after = registry.borrow().len();
        let added: Vec<TargetId> = (before..after).collect();
        if !added.is_empty() {
            registry
                .borrow_mut()
                .add_phony(&ctx.prefixed(name), &added);
        }
    }
    Ok(())
}

enum TargetKind {
    Static,
    Shared,
    Executable,
}

fn evaluate_target(
    ctx: &mut Context,
    scope: &mut Scope,
    entry: &TargetEntry,
    kind: TargetKind,
) -> Result<()> {
    let sources = match &entry.sources {
        Some(sources) => sources.tokens(),
        None => {
            // reference library: the artifact already exists on disk and
            // only contributes link flags or inputs to consumers
            let reference = match kind {
                TargetKind::Shared => ctx.shared_library_reference(&entry.name)?,
                TargetKind::Static => ctx.static_library_reference(&entry.name)?,
                TargetKind::Executable => {
                    bail!("executable {:?} needs a sources list", entry.name)
                }
            };
            scope.insert(entry.name.clone(), reference);
            return Ok(());
        }
    };
    if sources.is_empty() {
        bail!("target {:?} has an empty sources list", entry.name);
    }

    let mut inputs = resolve_sources(ctx, scope, &sources, entry.recurse, entry.source_type.as_deref())?;
    for name in &entry.uses {
        match scope.get(name) {
            Some(src) => inputs.push(src.clone()),
            None => bail!(
                "target {:?} uses {:?}, which no [[external]] entry declares",
                entry.name,
                name
            ),
        }
    }
    for lib in &entry.libs {
        inputs.extend(resolve_lib(ctx, scope, lib)?);
    }
    if !entry.defines.is_empty() {
        let defines: Vec<String> = entry.defines.iter().map(|d| format!("-D{}", d)).collect();
        inputs.extend(BuildSource::opts_carrier(
            Some("compile"),
            &defines.join(" "),
        ));
    }

    let options = LinkOptions {
        compiler_opts: entry.compiler_opts.clone(),
        linker_opts: entry.linker_opts.clone(),
        link_mode: match entry.link_mode.as_deref() {
            None | Some("single") => LinkMode::Single,
            Some("direct") => LinkMode::Direct,
            Some(other) => bail!("unknown link mode {:?} for {:?}", other, entry.name),
        },
        no_rename: entry.no_rename,
        install_name: entry.install_name.clone(),
    };

    match kind {
        TargetKind::Static => ctx.static_library(&entry.name, inputs, &options)?,
        TargetKind::Shared => ctx.shared_library(&entry.name, inputs, &options)?,
        TargetKind::Executable => ctx.executable(&entry.name, inputs, &options)?,
    };
    Ok(())
}

fn evaluate_swig(ctx: &mut Context, scope: &Scope, entry: &SwigEntry) -> Result<()> {
    let missing = |what: &str| -> Result<()> {
        if entry.optional {
            log::info!("skipping swig wrapper {}: {} not available", entry.name, what);
            Ok(())
        } else {
            bail!("swig wrapper {:?}: {} not available", entry.name, what)
        }
    };

    let swig = match scope.get("swig") {
        Some(BuildSource::External(ext)) => Some(ext.clone()),
        _ => ctx.find_external("swig", &ExternalArgs::default()),
    };
    if swig.is_none() {
        return missing("swig");
    }
    let language_ext = match scope.get(&entry.language) {
        Some(BuildSource::External(ext)) => Some(ext.clone()),
        _ => ctx.find_external(&entry.language, &ExternalArgs::default()),
    };
    let language_ext = match language_ext {
        Some(ext) => ext,
        None => return missing(&entry.language),
    };

    let mut libs = Vec::new();
    for lib in &entry.libs {
        libs.extend(resolve_lib(ctx, scope, lib)?);
    }
    ctx.swig_wrapper(
        &entry.language,
        &entry.name,
        &entry.interface,
        libs,
        entry.swig_opts.as_deref(),
        language_ext,
    )?;
    Ok(())
}

fn input_file(ctx: &Context, name: &str, source_type: Option<&str>) -> BuildSource {
    let file = InputFile::new(&ctx.prefixed(name));
    match source_type {
        Some(target_type) => BuildSource::File(file.with_target_type(target_type)),
        None => BuildSource::File(file),
    }
}

/// Source tokens: glob patterns expand against the context's directory,
/// names of already-registered targets resolve to those targets, anything
/// else is a literal input file.
fn resolve_sources(
    ctx: &Context,
    scope: &Scope,
    tokens: &[String],
    recurse: bool,
    source_type: Option<&str>,
) -> Result<Vec<BuildSource>> {
    let mut result = Vec::new();
    let mut patterns = Vec::new();
    for token in tokens {
        if files::is_pattern(token) {
            patterns.push(token.clone());
        } else if let Some(src) = scope.get(token) {
            result.push(src.clone());
        } else if let Some(id) = ctx.find_internal_opt(token)? {
            result.push(BuildSource::Target(id));
        } else {
            result.push(input_file(ctx, token, source_type));
        }
    }
    if !patterns.is_empty() {
        for rel in files::match_files(&patterns.join(" "), ctx.base_dir(), recurse)? {
            result.push(input_file(ctx, &rel, source_type));
        }
    }
    Ok(result)
}

/// A `libs` token: a bound name, an internal target, a glob over an
/// on-disk library directory, or a reference-library path.
fn resolve_lib(ctx: &Context, scope: &Scope, token: &str) -> Result<Vec<BuildSource>> {
    if let Some(src) = scope.get(token) {
        return Ok(vec![src.clone()]);
    }
    if let Some(id) = ctx.find_internal_opt(token)? {
        return Ok(vec![BuildSource::Target(id)]);
    }
    if files::is_pattern(token) {
        let path = Path::new(token);
        let pattern = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| token.to_string());
        let dir = path
            .parent()
            .map(|d| d.to_string_lossy().into_owned())
            .filter(|d| !d.is_empty());
        return ctx.match_libs(&pattern, dir.as_deref());
    }
    let shared_ext = ctx.platform().extension("shared").to_string();
    let static_ext = ctx.platform().extension("static").to_string();
    if !shared_ext.is_empty() && token.ends_with(&shared_ext) {
        return Ok(vec![ctx.shared_library_reference(token)?]);
    }
    if !static_ext.is_empty() && token.ends_with(&static_ext) {
        return Ok(vec![ctx.static_library_reference(token)?]);
    }
    if let Ok(src) = ctx.shared_library_reference(token) {
        return Ok(vec![src]);
    }
    if let Ok(src) = ctx.static_library_reference(token) {
        return Ok(vec![src]);
    }
    bail!(
        "library {:?} is neither an internal target nor an on-disk library",
        token
    );
}
