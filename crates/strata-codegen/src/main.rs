//! Command-line front end for strata-codegen.
//!
//! ```bash
//! # Write swap.rs and swap_decls.rs next to the manifest's module
//! strata-codegen manifests/swap.h --out-dir src/generated
//!
//! # Fail if the checked-in files are stale
//! strata-codegen manifests/swap.h --out-dir src/generated --check
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use strata_codegen::{generate, EmitOptions, ModuleManifest};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "strata-codegen", version, about = "Generate strata plugin glue from a symbol manifest")]
struct Cli {
    /// Manifest to read
    manifest: PathBuf,

    /// Module name; defaults to the manifest's file stem
    #[arg(short, long)]
    module: Option<String>,

    /// Directory to write the generated files to
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,

    /// Path through which generated code reaches the strata runtime
    #[arg(long, default_value = "crate")]
    runtime_path: String,

    /// Compare with the existing files instead of writing them
    #[arg(long)]
    check: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let module = match &cli.module {
        Some(module) => module.clone(),
        None => cli
            .manifest
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .context("cannot derive a module name from the manifest path; pass --module")?,
    };

    let manifest = ModuleManifest::from_file(&module, &cli.manifest)
        .with_context(|| format!("failed to parse {}", cli.manifest.display()))?;
    debug!(
        "Module {}: {} exported, {} fixed",
        module,
        manifest.exported().count(),
        manifest.fixed().count()
    );

    let options = EmitOptions {
        runtime_path: cli.runtime_path.clone(),
        source_name: cli
            .manifest
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        ..EmitOptions::default()
    };
    let generated = generate(&manifest, &options);

    if cli.check {
        let source_path = cli.out_dir.join(format!("{module}.rs"));
        let header_path = cli.out_dir.join(format!("{module}_decls.rs"));
        let mut stale = Vec::new();
        for (path, expected) in [(&source_path, &generated.source), (&header_path, &generated.header)] {
            let current = std::fs::read_to_string(path).unwrap_or_default();
            if &current != expected {
                stale.push(path.display().to_string());
            }
        }
        if !stale.is_empty() {
            bail!("generated files are out of date: {}", stale.join(", "));
        }
        info!("Generated files for {} are up to date", module);
        return Ok(());
    }

    std::fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("failed to create {}", cli.out_dir.display()))?;
    let (source, header) = generated
        .write(&cli.out_dir, &module)
        .with_context(|| format!("failed to write into {}", cli.out_dir.display()))?;
    info!("Wrote {} and {}", source.display(), header.display());

    Ok(())
}
