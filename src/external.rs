/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The catalogue of external components: compilers, linkers, flag bundles
//! and config-tool backed packages. Probing runs the component's tool once
//! and captures failures as values, so discovery can degrade to "absent"
//! without aborting the run.

use std::collections::BTreeMap;
use std::process::Command;
use std::process::ExitStatus;
use std::rc::Rc;

use serde::Deserialize;
use thiserror::Error;

use crate::rule::Rule;
use crate::source::BuildSource;
use crate::source::Projections;
use crate::source::RuleVariables;
use crate::version::VersionParseError;
use crate::version::VersionSpec;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unable to run {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{cmd} exited with {status}")]
    Status { cmd: String, status: ExitStatus },
    #[error(transparent)]
    Version(#[from] VersionParseError),
    #[error("{tool} version {found} does not satisfy {spec}")]
    VersionMismatch {
        tool: String,
        found: String,
        spec: VersionSpec,
    },
    #[error("{tool} reported no parsable version")]
    VersionUnknown { tool: String },
    #[error("external {name} needs a build-helper")]
    MissingHelper { name: String },
}

/// Arguments a build description may pass to an external's factory.
/// Deserialized both standalone and flattened into schema entries, so
/// unknown-field rejection is left to the surrounding tables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExternalArgs {
    /// Version predicate, e.g. `">= 2.0"`.
    pub version: Option<String>,
    /// Language standard for compiler externals (`c++17`, ...).
    pub std: Option<String>,
    /// Config tool backing a user-defined external (`xml2-config`, ...).
    pub build_helper: Option<String>,
    /// Helper flag that prints the version (`--version`).
    pub version_query: Option<String>,
    /// Rule-name key to helper flag, e.g. `compile_cpp = "--cflags"`,
    /// `link = "--libs"`.
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
}

/// A named external component. It can contribute flag projections to its
/// consumers, rules to the toolchain, filename-extension classifications,
/// and per-target-type required inputs (carriers injected into every
/// target of that type).
#[derive(Debug)]
pub struct External {
    pub name: String,
    pub version: Option<String>,
    pub projections: Projections,
    pub rules: Vec<Rule>,
    pub target_types_by_ext: BTreeMap<String, String>,
    pub required_inputs: BTreeMap<String, Vec<BuildSource>>,
}

impl External {
    pub fn flag_bundle(name: &str, version: Option<String>, compile: &str, link: &str) -> External {
        let mut projections = Projections::default();
        if !compile.trim().is_empty() {
            projections
                .variables
                .insert(Some("compile"), opts_map(compile));
        }
        if !link.trim().is_empty() {
            projections.variables.insert(Some("link"), opts_map(link));
        }
        External {
            name: name.to_string(),
            version,
            projections,
            rules: Vec::new(),
            target_types_by_ext: BTreeMap::new(),
            required_inputs: BTreeMap::new(),
        }
    }
}

fn opts_map(opts: &str) -> BTreeMap<String, Vec<String>> {
    let mut vars = BTreeMap::new();
    vars.insert(
        "opts".to_string(),
        opts.split_whitespace().map(str::to_string).collect(),
    );
    vars
}

fn pic_required_inputs() -> BTreeMap<String, Vec<BuildSource>> {
    let mut required = BTreeMap::new();
    required.insert(
        "shared".to_string(),
        vec![BuildSource::Vars(RuleVariables::opts(
            Some("compile"),
            "-fPIC",
        ))],
    );
    required
}

/// Run a probe subprocess, capturing stdout and stderr. A spawn failure or
/// a non-zero exit is a probe error, not a crash.
pub fn run_probe(args: &[&str]) -> Result<(String, String), ProbeError> {
    let cmd = args.join(" ");
    let output = Command::new(args[0])
        .args(&args[1..])
        .output()
        .map_err(|source| ProbeError::Spawn {
            cmd: cmd.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(ProbeError::Status {
            cmd,
            status: output.status,
        });
    }
    Ok((
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

/// Last whitespace token of the first line, the `--version` convention of
/// the GNU tools ("g++ (GCC) 13.2.0" -> "13.2.0").
fn last_token_version(output: &str) -> Option<String> {
    output
        .lines()
        .next()?
        .split_whitespace()
        .last()
        .map(str::to_string)
}

/// Token following a "version" token anywhere in the output, the
/// clang/swig convention ("clang version 17.0.6" -> "17.0.6").
fn after_version_token(output: &str) -> Option<String> {
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token.eq_ignore_ascii_case("version") {
                return tokens.next().map(str::to_string);
            }
        }
    }
    None
}

fn check_version(
    tool: &str,
    found: Option<&str>,
    spec: Option<&str>,
) -> Result<(), ProbeError> {
    let spec = match spec {
        Some(spec) => VersionSpec::parse(spec)?,
        None => return Ok(()),
    };
    let found = found.ok_or_else(|| ProbeError::VersionUnknown {
        tool: tool.to_string(),
    })?;
    if !spec.check_str(found)? {
        return Err(ProbeError::VersionMismatch {
            tool: tool.to_string(),
            found: found.to_string(),
            spec,
        });
    }
    Ok(())
}

/// The shared shape of a C++ compiler external: compile and link rules,
/// source-extension classification, and the position-independent-code
/// requirement for shared targets.
fn cpp_compiler(
    name: &str,
    compiler: &str,
    static_linker: &str,
    version: Option<String>,
    compile_flags: &str,
) -> External {
    let rules = vec![
        Rule::new(
            "compile_cpp",
            "$CXX $CXX_FLAGS ${opts} -MMD -MT $out -MF $out.d -c $in -o $out",
            "compile(cpp) $out",
            &[("CXX", compiler), ("CXX_FLAGS", compile_flags)],
            ("cpp", "object"),
        )
        .with_params(&[("depfile", "$out.d"), ("deps", "gcc")]),
        Rule::new(
            "link_static",
            "rm -f $out && $LINKER_STATIC $LINKER_STATIC_FLAGS ${opts} $out $in",
            "link(static) $out",
            &[("LINKER_STATIC", static_linker), ("LINKER_STATIC_FLAGS", "rcs")],
            ("object", "static"),
        ),
        Rule::new(
            "link_shared",
            "$LINKER_SHARED $LINKER_SHARED_FLAGS ${opts} -o $out $in",
            "link(shared) $out",
            &[
                ("LINKER_SHARED", compiler),
                ("LINKER_SHARED_FLAGS", "-shared -g -fPIC"),
            ],
            ("object", "shared"),
        ),
        Rule::new(
            "link_exe",
            "$LINKER_EXE $LINKER_EXE_FLAGS ${opts} -o $out $in",
            "link(exe) $out",
            &[("LINKER_EXE", compiler), ("LINKER_EXE_FLAGS", "-g")],
            ("object", "exe"),
        ),
        Rule::new(
            "compile_link_cpp_shared",
            "$CXX $CXX_FLAGS $LINKER_SHARED_FLAGS ${opts} -o $out $in",
            "compile+link(shared) $out",
            &[
                ("CXX", compiler),
                ("CXX_FLAGS", compile_flags),
                ("LINKER_SHARED_FLAGS", "-shared -g -fPIC"),
            ],
            ("cpp", "shared"),
        ),
        Rule::new(
            "compile_link_cpp_exe",
            "$CXX $CXX_FLAGS $LINKER_EXE_FLAGS ${opts} -o $out $in",
            "compile+link(exe) $out",
            &[
                ("CXX", compiler),
                ("CXX_FLAGS", compile_flags),
                ("LINKER_EXE_FLAGS", "-g"),
            ],
            ("cpp", "exe"),
        ),
    ];
    let mut by_ext = BTreeMap::new();
    for ext in [".cpp", ".cxx", ".cc"] {
        by_ext.insert(ext.to_string(), "cpp".to_string());
    }
    External {
        name: name.to_string(),
        version,
        projections: Projections::default(),
        rules,
        target_types_by_ext: by_ext,
        required_inputs: pic_required_inputs(),
    }
}

fn compile_only(
    name: &str,
    version: Option<String>,
    rule: Rule,
    exts: &[&str],
    target_type: &str,
) -> External {
    let mut by_ext = BTreeMap::new();
    for ext in exts {
        by_ext.insert(ext.to_string(), target_type.to_string());
    }
    External {
        name: name.to_string(),
        version,
        projections: Projections::default(),
        rules: vec![rule],
        target_types_by_ext: by_ext,
        required_inputs: pic_required_inputs(),
    }
}

fn std_flags(std: Option<&str>, base: &str) -> String {
    match std {
        Some(std) => format!("-std={} {}", std, base),
        None => base.to_string(),
    }
}

fn gcc(args: &ExternalArgs) -> Result<External, ProbeError> {
    let (stdout, _) = run_probe(&["g++", "--version"])?;
    let version = last_token_version(&stdout);
    check_version("g++", version.as_deref(), args.version.as_deref())?;
    let flags = std_flags(args.std.as_deref(), "-Wall -pedantic");
    Ok(cpp_compiler("gcc", "g++", "gcc-ar", version, &flags))
}

fn gcc_c(args: &ExternalArgs) -> Result<External, ProbeError> {
    let (stdout, _) = run_probe(&["gcc", "--version"])?;
    let version = last_token_version(&stdout);
    check_version("gcc", version.as_deref(), args.version.as_deref())?;
    let flags = std_flags(args.std.as_deref(), "-Wall -pedantic");
    let rule = Rule::new(
        "compile_c",
        "$CC $CC_FLAGS ${opts} -MMD -MT $out -MF $out.d -c $in -o $out",
        "compile(c) $out",
        &[("CC", "gcc"), ("CC_FLAGS", &flags)],
        ("c", "object"),
    )
    .with_params(&[("depfile", "$out.d"), ("deps", "gcc")]);
    Ok(compile_only("gcc-c", version, rule, &[".c"], "c"))
}

fn gfortran(args: &ExternalArgs) -> Result<External, ProbeError> {
    let (stdout, _) = run_probe(&["gfortran", "--version"])?;
    let version = last_token_version(&stdout);
    check_version("gfortran", version.as_deref(), args.version.as_deref())?;
    let rule = Rule::new(
        "compile_fortran",
        "$FC $FC_FLAGS ${opts} -c $in -o $out",
        "compile(fortran) $out",
        &[("FC", "gfortran"), ("FC_FLAGS", "-Wall")],
        ("fortran", "object"),
    );
    Ok(compile_only(
        "gfortran",
        version,
        rule,
        &[".f", ".f90", ".f03", ".for"],
        "fortran",
    ))
}

fn clang(args: &ExternalArgs) -> Result<External, ProbeError> {
    let (stdout, stderr) = run_probe(&["clang++", "--version"])?;
    let version = after_version_token(&stdout).or_else(|| after_version_token(&stderr));
    check_version("clang++", version.as_deref(), args.version.as_deref())?;
    let flags = std_flags(args.std.as_deref(), "-Weverything");
    Ok(cpp_compiler("clang", "clang++", "llvm-ar", version, &flags))
}

fn clang_c(args: &ExternalArgs) -> Result<External, ProbeError> {
    let (stdout, stderr) = run_probe(&["clang", "--version"])?;
    let version = after_version_token(&stdout).or_else(|| after_version_token(&stderr));
    check_version("clang", version.as_deref(), args.version.as_deref())?;
    let flags = std_flags(args.std.as_deref(), "-Weverything");
    let rule = Rule::new(
        "compile_c",
        "$CC $CC_FLAGS ${opts} -MMD -MT $out -MF $out.d -c $in -o $out",
        "compile(c) $out",
        &[("CC", "clang"), ("CC_FLAGS", &flags)],
        ("c", "object"),
    )
    .with_params(&[("depfile", "$out.d"), ("deps", "gcc")]);
    Ok(compile_only("clang-c", version, rule, &[".c"], "c"))
}

fn pthread(_args: &ExternalArgs) -> Result<External, ProbeError> {
    let mut projections = Projections::default();
    projections
        .variables
        .insert(Some("compile"), opts_map("-pthread"));
    projections
        .variables
        .insert(Some("link"), opts_map("-pthread"));
    Ok(External {
        name: "pthread".to_string(),
        version: None,
        projections,
        rules: Vec::new(),
        target_types_by_ext: BTreeMap::new(),
        required_inputs: BTreeMap::new(),
    })
}

fn python(args: &ExternalArgs) -> Result<External, ProbeError> {
    let helper = args.build_helper.as_deref().unwrap_or("python3-config");
    let (cflags, _) = run_probe(&[helper, "--cflags"])?;
    let (ldflags, _) = run_probe(&[helper, "--ldflags"])?;
    Ok(External::flag_bundle(
        "python",
        None,
        cflags.trim(),
        ldflags.trim(),
    ))
}

fn swig(args: &ExternalArgs) -> Result<External, ProbeError> {
    let (stdout, _) = run_probe(&["swig", "-version"])?;
    let version = after_version_token(&stdout);
    check_version("swig", version.as_deref(), args.version.as_deref())?;
    let mut by_ext = BTreeMap::new();
    by_ext.insert(".i".to_string(), "swig".to_string());
    Ok(External {
        name: "swig".to_string(),
        version,
        projections: Projections::default(),
        rules: Vec::new(),
        target_types_by_ext: by_ext,
        required_inputs: BTreeMap::new(),
    })
}

fn root(args: &ExternalArgs) -> Result<External, ProbeError> {
    let (version, _) = run_probe(&["root-config", "--version"])?;
    let version = version.trim().to_string();
    check_version("root-config", Some(version.as_str()), args.version.as_deref())?;
    let (cflags, _) = run_probe(&["root-config", "--cflags"])?;
    let (libs, _) = run_probe(&["root-config", "--libs"])?;
    Ok(External::flag_bundle(
        "root",
        Some(version),
        cflags.trim(),
        libs.trim(),
    ))
}

fn pkg_config(name: &str, args: &ExternalArgs) -> Result<External, ProbeError> {
    let (version, _) = run_probe(&["pkg-config", "--modversion", name])?;
    let version = version.trim().to_string();
    check_version(name, Some(version.as_str()), args.version.as_deref())?;
    let (cflags, _) = run_probe(&["pkg-config", "--cflags", name])?;
    let (libs, _) = run_probe(&["pkg-config", "--libs", name])?;
    Ok(External::flag_bundle(
        name,
        Some(version),
        cflags.trim(),
        libs.trim(),
    ))
}

/// A user-defined external backed by a config tool (`create_external`):
/// every entry of `flags` queries the helper once and projects the output
/// under the given rule-name key.
fn config_tool(name: &str, args: &ExternalArgs) -> Result<External, ProbeError> {
    let helper = args
        .build_helper
        .as_deref()
        .ok_or_else(|| ProbeError::MissingHelper {
            name: name.to_string(),
        })?;
    let version = match args.version_query.as_deref() {
        Some(query) => Some(run_probe(&[helper, query])?.0.trim().to_string()),
        None => None,
    };
    check_version(helper, version.as_deref(), args.version.as_deref())?;
    let mut projections = Projections::default();
    for (rule_key, helper_flag) in &args.flags {
        let (stdout, _) = run_probe(&[helper, helper_flag.as_str()])?;
        // schema keys may use kebab-case; rule names never do
        let rule_key = rule_key.replace('-', "_");
        projections
            .variables
            .insert(Some(&rule_key), opts_map(stdout.trim()));
    }
    Ok(External {
        name: name.to_string(),
        version,
        projections,
        rules: Vec::new(),
        target_types_by_ext: BTreeMap::new(),
        required_inputs: BTreeMap::new(),
    })
}

type Factory = fn(&ExternalArgs) -> Result<External, ProbeError>;

fn builtin(name: &str) -> Option<Factory> {
    let factory: Factory = match name {
        "gcc" => gcc,
        "gcc-c" => gcc_c,
        "gfortran" => gfortran,
        "clang" => clang,
        "clang-c" => clang_c,
        "pthread" => pthread,
        "python" => python,
        "swig" => swig,
        "root" => root,
        _ => return None,
    };
    Some(factory)
}

/// Construct an external by name. User-supplied helpers take precedence,
/// then the builtin catalogue, then pkg-config discovery for anything else.
pub fn find_external(name: &str, args: &ExternalArgs) -> Result<External, ProbeError> {
    if args.build_helper.is_some() && !args.flags.is_empty() {
        return config_tool(name, args);
    }
    match builtin(&name.to_lowercase()) {
        Some(factory) => factory(args),
        None => pkg_config(name, args),
    }
}

/// Probe an external, converting failure into absence: the error is
/// reported on standard error and the caller gets `None` to branch on.
pub fn probe_external(name: &str, args: &ExternalArgs) -> Option<Rc<External>> {
    match find_external(name, args) {
        Ok(external) => Some(Rc::new(external)),
        Err(err) => {
            log::warn!("unable to find external {}: {}", name, err);
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// A deterministic stand-in for a probed C++ compiler.
    pub fn toy_cpp() -> External {
        cpp_compiler("gcc", "g++", "gcc-ar", Some("13.2.0".to_string()), "-Wall")
    }

    /// A deterministic stand-in for a probed C compiler.
    pub fn toy_c() -> External {
        let rule = Rule::new(
            "compile_c",
            "$CC $CC_FLAGS ${opts} -MMD -MT $out -MF $out.d -c $in -o $out",
            "compile(c) $out",
            &[("CC", "gcc"), ("CC_FLAGS", "-Wall")],
            ("c", "object"),
        )
        .with_params(&[("depfile", "$out.d"), ("deps", "gcc")]);
        compile_only("gcc-c", Some("13.2.0".to_string()), rule, &[".c"], "c")
    }

    pub fn toy_flag_bundle(name: &str, compile: &str, link: &str) -> External {
        External::flag_bundle(name, None, compile, link)
    }
}
