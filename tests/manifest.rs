/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end tests: a TOML build description evaluated through the
//! library API into a canonicalised, serialised manifest. Tools are
//! constructed directly so nothing probes the host system.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use pyrate::buildfile;
use pyrate::ninja;
use pyrate::BuildSource;
use pyrate::Context;
use pyrate::External;
use pyrate::Platform;
use pyrate::Registry;
use pyrate::Rule;
use pyrate::RuleVariables;
use pyrate::ToolHolder;

fn cpp_external() -> External {
    let rules = vec![
        Rule::new(
            "compile_cpp",
            "$CXX $CXX_FLAGS ${opts} -MMD -MT $out -MF $out.d -c $in -o $out",
            "compile(cpp) $out",
            &[("CXX", "g++"), ("CXX_FLAGS", "-Wall")],
            ("cpp", "object"),
        )
        .with_params(&[("depfile", "$out.d"), ("deps", "gcc")]),
        Rule::new(
            "link_static",
            "rm -f $out && $LINKER_STATIC $LINKER_STATIC_FLAGS ${opts} $out $in",
            "link(static) $out",
            &[("LINKER_STATIC", "gcc-ar"), ("LINKER_STATIC_FLAGS", "rcs")],
            ("object", "static"),
        ),
        Rule::new(
            "link_shared",
            "$LINKER_SHARED $LINKER_SHARED_FLAGS ${opts} -o $out $in",
            "link(shared) $out",
            &[
                ("LINKER_SHARED", "g++"),
                ("LINKER_SHARED_FLAGS", "-shared -g -fPIC"),
            ],
            ("object", "shared"),
        ),
        Rule::new(
            "link_exe",
            "$LINKER_EXE $LINKER_EXE_FLAGS ${opts} -o $out $in",
            "link(exe) $out",
            &[("LINKER_EXE", "g++"), ("LINKER_EXE_FLAGS", "-g")],
            ("object", "exe"),
        ),
    ];
    let mut by_ext = BTreeMap::new();
    for ext in [".cpp", ".cxx", ".cc"] {
        by_ext.insert(ext.to_string(), "cpp".to_string());
    }
    let mut required_inputs = BTreeMap::new();
    required_inputs.insert(
        "shared".to_string(),
        vec![BuildSource::Vars(RuleVariables::opts(
            Some("compile"),
            "-fPIC",
        ))],
    );
    External {
        name: "gcc".to_string(),
        version: Some("13.2.0".to_string()),
        projections: Default::default(),
        rules,
        target_types_by_ext: by_ext,
        required_inputs,
    }
}

fn context_for(dir: &Path) -> Context {
    let registry = Rc::new(RefCell::new(Registry::new()));
    let platform = Rc::new(Platform::linux());
    let mut tools = ToolHolder::new();
    tools.set("cpp", Rc::new(cpp_external()));
    Context::new(registry, platform, tools, dir)
}

/// Mirror of the driver: evaluate, add aggregates, resolve defaults,
/// canonicalise, render.
fn render(dir: &Path) -> String {
    let build = buildfile::read_build_file(&dir.join("build.toml")).unwrap();
    let mut ctx = context_for(dir);
    let outcome = buildfile::evaluate(&mut ctx, &build).unwrap();
    let registry = ctx.registry();
    drop(ctx);
    {
        let mut registry = registry.borrow_mut();
        if !registry.all_targets.is_empty() {
            let members = registry.all_targets.clone();
            registry.add_phony("all", &members);
        }
        if !registry.install_targets.is_empty() {
            let members = registry.install_targets.clone();
            registry.add_phony("install", &members);
        }
    }
    let defaults = {
        let registry = registry.borrow();
        if outcome.default_targets.is_empty() {
            registry.find_internal_opt("all").unwrap().into_iter().collect()
        } else {
            outcome
                .default_targets
                .iter()
                .map(|name| registry.find_internal(name).unwrap())
                .collect()
        }
    };
    let mut registry = Rc::try_unwrap(registry).unwrap().into_inner();
    let manifest = registry.finalise(defaults).unwrap();
    let mut out = Vec::new();
    ninja::write_ninja(&mut out, &registry, &manifest).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn deterministic_emission() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a.cpp", "b.cpp", "main.cpp"] {
        fs::write(dir.path().join(name), "").unwrap();
    }
    fs::write(
        dir.path().join("build.toml"),
        r#"
        [[static-library]]
        name = "libCore"
        sources = "*.cpp -main*"
        compiler-opts = "-O2"

        [[executable]]
        name = "prog"
        sources = ["main.cpp"]
        libs = ["libCore"]
        "#,
    )
    .unwrap();
    let first = render(dir.path());
    let second = render(dir.path());
    assert_eq!(first, second);
    assert!(first.contains("build prog: link_exe main.o libCore.a\n"));
}

#[test]
fn emitted_names_are_unique_and_placeholders_closed() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("build.toml"),
        r#"
        [[executable]]
        name = "ex"
        sources = ["a.cpp", "b.cpp"]

        [[executable]]
        name = "ex"
        sources = ["a.cpp", "b.cpp"]
        compiler-opts = "-O3"
        "#,
    )
    .unwrap();

    let build = buildfile::read_build_file(&dir.path().join("build.toml")).unwrap();
    let mut ctx = context_for(dir.path());
    buildfile::evaluate(&mut ctx, &build).unwrap();
    let registry = ctx.registry();
    drop(ctx);
    let mut registry = Rc::try_unwrap(registry).unwrap().into_inner();
    let manifest = registry.finalise(vec![]).unwrap();

    // name uniqueness over targets and rules
    let mut target_names = std::collections::BTreeSet::new();
    for &id in &manifest.targets {
        assert!(target_names.insert(registry.target(id).name.clone()));
    }
    let mut rule_names = std::collections::BTreeSet::new();
    for rule in &manifest.rules {
        assert!(rule_names.insert(rule.name.clone()));
        // every placeholder is in/out/opts or backed by a default/param
        rule.check_placeholders().unwrap();
    }

    // debug/release: both executables renamed apart, and the release
    // compile rule carries its own fold
    let exe_names: Vec<&String> = target_names
        .iter()
        .filter(|name| name.starts_with("ex_"))
        .collect();
    assert_eq!(exe_names.len(), 2);
    assert!(rule_names.iter().any(|name| name.starts_with("compile_cpp_")));
    assert!(manifest
        .rules
        .iter()
        .any(|rule| rule.cmd.contains("-O3") && !rule.cmd.contains("${opts}")));
}

#[test]
fn invariant_opts_fold_into_the_rule() {
    let dir = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0..20).map(|i| format!("src{:02}.cpp", i)).collect();
    for name in &names {
        fs::write(dir.path().join(name), "").unwrap();
    }
    fs::write(
        dir.path().join("build.toml"),
        r#"
        [[static-library]]
        name = "libBig"
        sources = "*.cpp"
        compiler-opts = "-O3"
        "#,
    )
    .unwrap();
    let text = render(dir.path());
    // the fold: literal opts in the suffixed rule command, no per-target
    // opts variable on any compile edge
    assert!(text.contains("-O3 -MMD"));
    assert!(!text.contains("  opts = -O3\n"));
    let rule_line = text
        .lines()
        .find(|line| line.starts_with("rule compile_cpp_"))
        .expect("folded compile rule");
    assert!(rule_line.len() > "rule compile_cpp_".len());
}

#[test]
fn no_rename_keeps_the_contested_name() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("build.toml"),
        r#"
        [[executable]]
        name = "x.bin"
        sources = ["x.cpp"]

        [[executable]]
        name = "x.bin"
        sources = ["x.cpp"]
        compiler-opts = "-O3"
        no-rename = true
        "#,
    )
    .unwrap();
    let text = render(dir.path());
    assert!(text.contains("build x.bin: link_exe"));
    assert!(text.lines().any(|line| {
        line.starts_with("build x_") && line.contains(".bin: link_exe")
    }));
}

#[test]
fn duplicate_no_rename_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("build.toml"),
        r#"
        [[executable]]
        name = "x.bin"
        sources = ["x.cpp"]
        compiler-opts = "-O2"
        no-rename = true

        [[executable]]
        name = "x.bin"
        sources = ["x.cpp"]
        compiler-opts = "-O3"
        no-rename = true
        "#,
    )
    .unwrap();
    let build = buildfile::read_build_file(&dir.path().join("build.toml")).unwrap();
    let mut ctx = context_for(dir.path());
    buildfile::evaluate(&mut ctx, &build).unwrap();
    let registry = ctx.registry();
    drop(ctx);
    let mut registry = Rc::try_unwrap(registry).unwrap().into_inner();
    assert!(registry.finalise(vec![]).is_err());
}

#[test]
fn include_aggregates_child_targets() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("foo")).unwrap();
    fs::write(dir.path().join("foo/foo.cpp"), "").unwrap();
    fs::write(
        dir.path().join("foo/build.toml"),
        r#"
        [[shared-library]]
        name = "libfoo"
        sources = ["foo.cpp"]
        "#,
    )
    .unwrap();
    fs::write(dir.path().join("main.cpp"), "").unwrap();
    fs::write(
        dir.path().join("build.toml"),
        r#"
        [[include]]
        path = "foo"
        inherit = true
        name = "foo"

        [[executable]]
        name = "prog"
        sources = ["main.cpp"]
        libs = ["libfoo"]
        "#,
    )
    .unwrap();

    let build = buildfile::read_build_file(&dir.path().join("build.toml")).unwrap();
    let mut ctx = context_for(dir.path());
    buildfile::evaluate(&mut ctx, &build).unwrap();
    let registry = ctx.registry();
    let registry = registry.borrow();

    // the child-registered library resolves by its user name
    let lib = registry.find_internal("libfoo").unwrap();
    assert_eq!(registry.target(lib).name, "foo/libfoo.so");

    // a phony aggregate collects everything the child added
    let group = registry.find_internal("foo").unwrap();
    let group_inputs: Vec<String> = registry
        .target(group)
        .build_inputs(&registry)
        .iter()
        .filter_map(|src| registry.source_name(src))
        .collect();
    assert!(group_inputs.contains(&"foo/libfoo.so".to_string()));
    assert!(group_inputs.contains(&"foo/foo.o".to_string()));

    // the parent links against the child library through its flags
    let prog = registry.find_internal("prog").unwrap();
    let vars = registry.target(prog).build_variables(&registry);
    assert_eq!(vars["opts"], "-Lfoo -Wl,-rpath foo -lfoo");
}

#[test]
fn install_targets_and_aggregate() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("build.toml"),
        r#"
        [project]
        default-targets = ["prog"]

        [[executable]]
        name = "prog"
        sources = ["main.cpp"]

        [[install]]
        targets = ["prog"]
        "#,
    )
    .unwrap();
    let text = render(dir.path());
    assert!(text.contains("build /usr/bin/prog: install prog\n"));
    assert!(text.contains("build install: phony /usr/bin/prog\n"));
    assert!(text.ends_with("default prog\n"));
}

#[test]
fn default_all_aggregate_without_explicit_defaults() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("build.toml"),
        r#"
        [[executable]]
        name = "prog"
        sources = ["main.cpp"]
        "#,
    )
    .unwrap();
    let text = render(dir.path());
    assert!(text.contains("build all: phony prog\n"));
    // the lone default being the phony all suppresses the default line
    assert!(!text.contains("\ndefault "));
}

#[test]
fn objects_compile_before_linking() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("build.toml"),
        r#"
        [[executable]]
        name = "prog"
        sources = ["main.cpp", "util.cpp"]
        "#,
    )
    .unwrap();
    let text = render(dir.path());
    assert!(text.contains("build main.o: compile_cpp main.cpp\n"));
    assert!(text.contains("build util.o: compile_cpp util.cpp\n"));
    assert!(text.contains("build prog: link_exe main.o util.o\n"));
}
