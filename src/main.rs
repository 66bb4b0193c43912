/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context as _;
use anyhow::Result;
use clap::Parser;

use pyrate::makefile;
use pyrate::ninja;

#[derive(Debug, Parser)]
#[command(
    name = "pyrate",
    version,
    about = "Generate Ninja or GNU Make build manifests from a declarative project description"
)]
struct Args {
    /// Generate a Makefile instead of a Ninja build file
    #[arg(short = 'M', long = "makefile")]
    makefile: bool,

    /// Name of the output build file; with several back-ends the
    /// extension is substituted per back-end
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    output: Option<PathBuf>,

    /// Build description file, or a directory containing build.toml
    #[arg(value_name = "BUILD_FILE")]
    build_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Ninja,
    Make,
}

impl Backend {
    fn parse(name: &str) -> Result<Backend> {
        match name {
            "ninja" => Ok(Backend::Ninja),
            "make" | "makefile" => Ok(Backend::Make),
            _ => bail!("unknown build output {:?} (expected \"ninja\" or \"make\")", name),
        }
    }

    fn default_file_name(self) -> &'static str {
        match self {
            Backend::Ninja => "build.ninja",
            Backend::Make => "Makefile",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Backend::Ninja => "ninja",
            Backend::Make => "mk",
        }
    }
}

fn write_if_changed(path: &Path, content: &[u8]) -> Result<()> {
    // avoid watcher churn when nothing changed
    if !matches!(fs::read(path), Ok(existing) if existing == content) {
        fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

fn run() -> Result<()> {
    let args = Args::parse();
    let build_path = args
        .build_file
        .clone()
        .unwrap_or_else(|| PathBuf::from("build.toml"));

    let generated = pyrate::generate(&build_path)?;

    let mut backends = Vec::new();
    if args.makefile {
        backends.push(Backend::Make);
    } else if generated.outputs.is_empty() {
        backends.push(Backend::Ninja);
    } else {
        for name in &generated.outputs {
            let backend = Backend::parse(name)?;
            if !backends.contains(&backend) {
                backends.push(backend);
            }
        }
    }

    let multiple = backends.len() > 1;
    for backend in backends {
        let file = match &args.output {
            Some(path) if multiple => path.with_extension(backend.extension()),
            Some(path) => path.clone(),
            None => PathBuf::from(backend.default_file_name()),
        };
        let path = if file.is_absolute() {
            file
        } else {
            generated.dir.join(file)
        };

        let mut out = Vec::new();
        match backend {
            Backend::Ninja => ninja::write_ninja(&mut out, &generated.registry, &generated.manifest),
            Backend::Make => {
                makefile::write_makefile(&mut out, &generated.registry, &generated.manifest)
            }
        }
        .with_context(|| format!("serialising {}", path.display()))?;

        write_if_changed(&path, &out)?;
        log::info!(
            "{} rules, {} targets written to {}",
            generated.manifest.rules.len(),
            generated.manifest.targets.len(),
            path.display()
        );
    }

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(err) = run() {
        eprintln!("pyrate: {:#}", err);
        std::process::exit(1);
    }
}
