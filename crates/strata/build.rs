//! Generates the ABI glue of every module from `manifests/<module>.h`.

use std::path::PathBuf;
use strata_codegen::{generate, EmitOptions, ModuleManifest};

const MODULES: &[&str] = &["lvm", "fs", "crypto", "mdraid", "swap", "loop"];

fn main() {
    let manifest_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR"));

    for module in MODULES {
        let file_name = format!("{module}.h");
        let path = manifest_dir.join("manifests").join(&file_name);
        println!("cargo:rerun-if-changed={}", path.display());

        let manifest = match ModuleManifest::from_file(module, &path) {
            Ok(manifest) => manifest,
            Err(e) => panic!("{}: {}", path.display(), e),
        };
        let options = EmitOptions {
            source_name: Some(file_name),
            ..EmitOptions::default()
        };
        if let Err(e) = generate(&manifest, &options).write(&out_dir, module) {
            panic!("failed to write generated code for {module}: {e}");
        }
    }
}
