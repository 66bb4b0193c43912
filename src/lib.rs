/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! pyrate - generate Ninja or GNU Make build manifests from a declarative
//! C/C++/Fortran project description.
//!
//! A build description (`build.toml`) is evaluated against a [`Context`],
//! producing targets in a [`Registry`]; the canonicalisation pass then
//! deduplicates the graph, resolves name collisions and folds invariant
//! options into rules before one of the writers serialises the result.

use std::cell::RefCell;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context as _;
use anyhow::Result;

pub mod buildfile;
pub mod context;
pub mod external;
pub mod files;
pub mod fingerprint;
pub mod makefile;
pub mod ninja;
pub mod platform;
pub mod registry;
pub mod rule;
pub mod source;
pub mod target;
pub mod toolchain;
pub mod version;

pub use context::Context;
pub use context::LinkMode;
pub use context::LinkOptions;
pub use external::External;
pub use external::ExternalArgs;
pub use platform::Platform;
pub use registry::Manifest;
pub use registry::Registry;
pub use rule::Rule;
pub use source::BuildSource;
pub use source::InputFile;
pub use source::RuleVariables;
pub use target::BuildTarget;
pub use toolchain::ToolHolder;
pub use toolchain::Toolchain;
pub use version::Version;
pub use version::VersionSpec;

/// The generator's own version, exposed to build descriptions and tools.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The finalised result of evaluating a build description.
pub struct Generated {
    pub registry: Registry,
    pub manifest: Manifest,
    /// Back-ends the description asked for (`ninja`, `make`).
    pub outputs: Vec<String>,
    /// Directory of the build description; output files land here.
    pub dir: PathBuf,
}

/// Evaluate a build description through to a canonicalised manifest.
/// `build_path` may name the description file or its directory.
pub fn generate(build_path: &Path) -> Result<Generated> {
    let script = if build_path.is_dir() {
        build_path.join("build.toml")
    } else {
        build_path.to_path_buf()
    };
    let dir = script
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let registry = Rc::new(RefCell::new(Registry::new()));
    let platform = Rc::new(Platform::linux());
    let tools = ToolHolder::with_toolchain(toolchain::find_toolchain("gcc")?);

    let outcome = {
        let build = buildfile::read_build_file(&script)?;
        let mut ctx = Context::new(registry.clone(), platform, tools, &dir);
        buildfile::evaluate(&mut ctx, &build)
            .with_context(|| format!("evaluating {}", script.display()))?
    };

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
            registry.find_internal_opt("all")?.into_iter().collect()
        } else {
            outcome
                .default_targets
                .iter()
                .map(|name| registry.find_internal(name))
                .collect::<Result<Vec<_>>>()?
        }
    };

    let mut registry = Rc::try_unwrap(registry)
        .map_err(|_| anyhow!("registry still shared after evaluation"))?
        .into_inner();
    let manifest = registry.finalise(defaults)?;

    Ok(Generated {
        registry,
        manifest,
        outputs: outcome.outputs,
        dir,
    })
}
