//! Rust source emission.
//!
//! For a module manifest this produces two files:
//!
//! - the **source**, with a stub, a slot and a trampoline per exported
//!   function, the fixed helpers, the module ABI table, its `load`/`unload`
//!   functions, and a `checked` submodule of `Result`-returning wrappers;
//! - the **header**, with symbol names and `extern "C"` signatures that
//!   plugins implement, plus the size constants.
//!
//! The source expects the header to be reachable as `decls` from the module
//! it is included into.

use crate::manifest::{FunctionDecl, ModuleManifest};
use crate::types::{rust_ident, CType};
use std::path::{Path, PathBuf};

/// Options controlling emitted paths.
#[derive(Debug, Clone)]
pub struct EmitOptions {
    /// Path through which generated code reaches the runtime (`crate` when
    /// the output is compiled into `strata` itself).
    pub runtime_path: String,

    /// Path of the header module relative to the source module.
    pub decls_path: String,

    /// Name of the manifest file, quoted in the generated banner.
    pub source_name: Option<String>,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            runtime_path: "crate".to_string(),
            decls_path: "decls".to_string(),
            source_name: None,
        }
    }
}

/// Generated files for one module.
#[derive(Debug, Clone)]
pub struct GeneratedModule {
    /// Stubs, slots, trampolines, helpers and loader.
    pub source: String,

    /// Symbol names, signatures and constants.
    pub header: String,
}

impl GeneratedModule {
    /// Write `<stem>.rs` and `<stem>_decls.rs` into `dir`.
    pub fn write(&self, dir: &Path, stem: &str) -> std::io::Result<(PathBuf, PathBuf)> {
        let source = dir.join(format!("{stem}.rs"));
        let header = dir.join(format!("{stem}_decls.rs"));
        std::fs::write(&source, &self.source)?;
        std::fs::write(&header, &self.header)?;
        Ok((source, header))
    }
}

/// Generate the source and header for a manifest.
pub fn generate(manifest: &ModuleManifest, options: &EmitOptions) -> GeneratedModule {
    GeneratedModule {
        source: emit_source(manifest, options),
        header: emit_header(manifest, options),
    }
}

/// `strata_swap_mkswap` -> `StrataSwapMkswap`.
pub fn camel_case(symbol: &str) -> String {
    symbol
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Name of the `extern "C"` signature alias of a function.
pub fn fn_type_name(function: &FunctionDecl) -> String {
    format!("{}Fn", camel_case(&function.name))
}

/// Name of the symbol-name constant of a function.
pub fn symbol_const_name(function: &FunctionDecl) -> String {
    format!("{}_SYMBOL", function.name.to_ascii_uppercase())
}

fn slot_name(function: &FunctionDecl) -> String {
    format!("{}_SLOT", function.name.to_ascii_uppercase())
}

fn stub_name(function: &FunctionDecl) -> String {
    format!("{}_stub", function.name)
}

/// Line-oriented string builder.
#[derive(Default)]
struct Writer {
    out: String,
}

impl Writer {
    fn line(&mut self, text: impl AsRef<str>) {
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    fn doc(&mut self, indent: &str, doc: &str) {
        for line in doc.lines() {
            if line.is_empty() {
                self.line(format!("{indent}///"));
            } else {
                self.line(format!("{indent}/// {line}"));
            }
        }
    }

    fn banner(&mut self, manifest: &ModuleManifest, options: &EmitOptions) {
        match &options.source_name {
            Some(name) => self.line(format!(
                "// @generated by strata-codegen from `{name}` (module `{}`). Do not edit.",
                manifest.module
            )),
            None => self.line(format!(
                "// @generated by strata-codegen (module `{}`). Do not edit.",
                manifest.module
            )),
        }
        self.blank();
    }

    fn includes(&mut self, manifest: &ModuleManifest) {
        for include in &manifest.includes {
            self.line("#[allow(unused_imports)]");
            self.line(format!("use {include};"));
        }
        if !manifest.includes.is_empty() {
            self.blank();
        }
    }
}

fn ffi_params(function: &FunctionDecl, runtime: &str) -> String {
    function
        .params
        .iter()
        .map(|p| format!("{}: {}", rust_ident(&p.name), p.ty.ffi_type(runtime)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn ret_suffix(ty: &CType, runtime: &str) -> String {
    match ty {
        CType::Void => String::new(),
        other => format!(" -> {}", other.ffi_type(runtime)),
    }
}

fn emit_header(manifest: &ModuleManifest, options: &EmitOptions) -> String {
    let runtime = options.runtime_path.as_str();
    let mut w = Writer::default();
    w.banner(manifest, options);
    w.includes(manifest);

    for constant in &manifest.constants {
        if let Some(doc) = &constant.doc {
            w.doc("", doc);
        }
        w.line(format!("pub const {}: u64 = {};", constant.name, constant.bytes));
        w.blank();
    }

    for function in manifest.exported() {
        w.line(format!("/// Symbol a plugin exports to implement `{}`.", function.name));
        w.line(format!(
            "pub const {}: &str = \"{}\";",
            symbol_const_name(function),
            function.name
        ));
        w.blank();
        w.line(format!("/// Signature of `{}`.", function.name));
        w.line(format!(
            "pub type {} = unsafe extern \"C\" fn({}){};",
            fn_type_name(function),
            ffi_params(function, runtime),
            ret_suffix(&function.ret, runtime)
        ));
        w.blank();
    }

    w.out
}

fn emit_source(manifest: &ModuleManifest, options: &EmitOptions) -> String {
    let runtime = options.runtime_path.as_str();
    let decls = options.decls_path.as_str();
    let mut w = Writer::default();
    w.banner(manifest, options);
    w.includes(manifest);

    if !manifest.constants.is_empty() {
        let names: Vec<&str> = manifest.constants.iter().map(|c| c.name.as_str()).collect();
        w.line("#[allow(unused_imports)]");
        w.line(format!("pub use {decls}::{{{}}};", names.join(", ")));
        w.blank();
    }

    for function in manifest.exported() {
        emit_stub(&mut w, function, runtime);
        emit_slot(&mut w, function, runtime, decls);
        emit_trampoline(&mut w, manifest, function, runtime);
    }

    for function in manifest.fixed() {
        emit_fixed(&mut w, manifest, function, runtime);
    }

    emit_module_table(&mut w, manifest, runtime);
    emit_loader(&mut w, manifest, runtime);
    emit_checked(&mut w, manifest, runtime, decls);

    w.out
}

fn emit_stub(w: &mut Writer, function: &FunctionDecl, runtime: &str) {
    let error_param = function.error_param().map(|p| rust_ident(&p.name).into_owned());
    let params = function
        .params
        .iter()
        .map(|p| {
            let name = if p.ty == CType::ErrorOut {
                rust_ident(&p.name).into_owned()
            } else {
                format!("_{}", p.name)
            };
            format!("{}: {}", name, p.ty.ffi_type(runtime))
        })
        .collect::<Vec<_>>()
        .join(", ");

    w.line(format!(
        "unsafe extern \"C\" fn {}({}){} {{",
        stub_name(function),
        params,
        ret_suffix(&function.ret, runtime)
    ));
    let channel = error_param.unwrap_or_else(|| "::std::ptr::null_mut()".to_string());
    w.line(format!(
        "    unsafe {{ {runtime}::ffi::report_not_implemented({channel}, \"{}\") }};",
        function.name
    ));
    if let Some(value) = function.ret.default_value() {
        w.line(format!("    {value}"));
    }
    w.line("}");
    w.blank();
}

fn emit_slot(w: &mut Writer, function: &FunctionDecl, runtime: &str, decls: &str) {
    w.line(format!(
        "static {}: {runtime}::loader::Slot<{decls}::{}> = unsafe {{",
        slot_name(function),
        fn_type_name(function)
    ));
    w.line(format!(
        "    {runtime}::loader::Slot::<{decls}::{}>::new({decls}::{}, {})",
        fn_type_name(function),
        symbol_const_name(function),
        stub_name(function)
    ));
    w.line("};");
    w.blank();
}

fn trampoline_signature(manifest: &ModuleManifest, function: &FunctionDecl, runtime: &str) -> (bool, String) {
    let is_unsafe = function.params.iter().any(|p| p.ty.is_raw_pointer_param());
    let params = function
        .params
        .iter()
        .map(|p| format!("{}: {}", rust_ident(&p.name), p.ty.param_type(runtime)))
        .collect::<Vec<_>>()
        .join(", ");
    let signature = format!(
        "pub {}fn {}({}){}",
        if is_unsafe { "unsafe " } else { "" },
        rust_ident(manifest.public_name(function)),
        params,
        ret_suffix(&function.ret, runtime)
    );
    (is_unsafe, signature)
}

fn emit_trampoline(w: &mut Writer, manifest: &ModuleManifest, function: &FunctionDecl, runtime: &str) {
    let (is_unsafe, signature) = trampoline_signature(manifest, function, runtime);

    if let Some(doc) = &function.doc {
        w.doc("", doc);
        w.line("///");
    }
    w.line(format!(
        "/// Calls `{}` in the loaded `{}` plugin, or its stub when none is bound.",
        function.name, manifest.module
    ));
    if is_unsafe {
        w.line("///");
        w.line("/// # Safety");
        w.line("///");
        w.line("/// Raw pointer arguments must be valid for the plugin function's contract.");
    }
    w.line(format!("{signature} {{"));
    w.line(format!("    let function = {}.get();", slot_name(function)));
    let args = function
        .params
        .iter()
        .map(|p| p.ty.forward(&rust_ident(&p.name), runtime))
        .collect::<Vec<_>>()
        .join(", ");
    w.line(format!("    unsafe {{ function({args}) }}"));
    w.line("}");
    w.blank();
}

fn emit_fixed(w: &mut Writer, manifest: &ModuleManifest, function: &FunctionDecl, runtime: &str) {
    let (_, signature) = trampoline_signature(manifest, function, runtime);
    if let Some(doc) = &function.doc {
        w.doc("", doc);
    }
    w.line(format!("{signature} {{"));
    if let Some(body) = &function.body {
        w.line(body);
    }
    w.line("}");
    w.blank();
}

fn emit_module_table(w: &mut Writer, manifest: &ModuleManifest, runtime: &str) {
    let quoted = |value: &Option<String>| match value {
        Some(v) => format!("Some(\"{v}\")"),
        None => "None".to_string(),
    };

    w.line(format!("/// ABI table of the `{}` module.", manifest.module));
    w.line(format!("pub static MODULE: {runtime}::loader::ModuleAbi = {runtime}::loader::ModuleAbi {{"));
    w.line(format!("    name: \"{}\",", manifest.module));
    w.line(format!(
        "    prefix: \"{}\",",
        manifest.prefix.as_deref().unwrap_or_default()
    ));
    w.line(format!("    init_symbol: {},", quoted(&manifest.init_symbol)));
    w.line(format!("    close_symbol: {},", quoted(&manifest.close_symbol)));
    w.line("    slots: &[");
    for function in manifest.exported() {
        w.line(format!(
            "        &{} as &dyn {runtime}::loader::SlotBinding,",
            slot_name(function)
        ));
    }
    w.line("    ],");
    w.line("};");
    w.blank();
}

fn emit_loader(w: &mut Writer, manifest: &ModuleManifest, runtime: &str) {
    w.line(format!(
        "/// Opens `path` and binds every `{}` function it exports.",
        manifest.module
    ));
    w.line("pub fn load(");
    w.line(format!("    opener: &dyn {runtime}::loader::ObjectOpener,"));
    w.line("    path: &::std::path::Path,");
    w.line(format!("    diagnostics: &{runtime}::log::Diagnostics,"));
    w.line(format!(
        ") -> ::std::result::Result<{runtime}::loader::LoadedModule, {runtime}::error::LoadError> {{"
    ));
    w.line(format!("    {runtime}::loader::load_module(&MODULE, opener, path, diagnostics)"));
    w.line("}");
    w.blank();

    w.line(format!(
        "/// Reverts every `{}` slot to its stub, runs the finalizer and closes the object.",
        manifest.module
    ));
    w.line(format!(
        "pub fn unload(module: {runtime}::loader::LoadedModule, diagnostics: &{runtime}::log::Diagnostics) -> bool {{"
    ));
    w.line(format!("    {runtime}::loader::unload_module(module, diagnostics)"));
    w.line("}");
}

fn emit_checked(w: &mut Writer, manifest: &ModuleManifest, runtime: &str, decls: &str) {
    w.blank();
    w.line(format!(
        "/// `{}` calls returning errors translated by a [`{runtime}::dispatch::DispatchProxy`].",
        manifest.module
    ));
    w.line("///");
    w.line("/// Each wrapper resolves its own member, so the proxy must belong to this module.");
    w.line("pub mod checked {");
    w.line("    #[allow(unused_imports)]");
    w.line("    use super::*;");
    for function in manifest.exported() {
        w.blank();
        emit_checked_wrapper(w, manifest, function, runtime, decls);
    }
    w.line("}");
}

fn emit_checked_wrapper(w: &mut Writer, manifest: &ModuleManifest, function: &FunctionDecl, runtime: &str, decls: &str) {
    let is_unsafe = function.params.iter().any(|p| p.ty.is_raw_pointer_param());
    let public = rust_ident(manifest.public_name(function));
    let proxy = if function.params.iter().any(|p| p.name == "proxy") {
        "dispatch_proxy"
    } else {
        "proxy"
    };

    let mut params = vec![format!("{proxy}: &{runtime}::dispatch::DispatchProxy")];
    params.extend(
        function
            .params
            .iter()
            .filter(|p| p.ty != CType::ErrorOut)
            .map(|p| format!("{}: {}", rust_ident(&p.name), p.ty.param_type(runtime))),
    );
    let ret = match &function.ret {
        CType::Void => "()".to_string(),
        other => other.ffi_type(runtime),
    };

    let channel = function
        .error_param()
        .map(|p| rust_ident(&p.name).into_owned())
        .unwrap_or_else(|| "_".to_string());
    let args = function
        .params
        .iter()
        .map(|p| rust_ident(&p.name).into_owned())
        .collect::<Vec<_>>()
        .join(", ");
    let call = if is_unsafe {
        format!("unsafe {{ super::{public}({args}) }}")
    } else {
        format!("super::{public}({args})")
    };

    w.line(format!(
        "    /// [`super::{public}`], with its error translated by `{proxy}`."
    ));
    if is_unsafe {
        w.line("    ///");
        w.line("    /// # Safety");
        w.line("    ///");
        w.line(format!("    /// Same contract as [`super::{public}`]."));
    }
    w.line(format!(
        "    pub {}fn {public}({}) -> ::std::result::Result<{ret}, {runtime}::dispatch::DispatchError> {{",
        if is_unsafe { "unsafe " } else { "" },
        params.join(", ")
    ));
    w.line(format!(
        "        {proxy}.call({decls}::{}, |{channel}| {call})",
        symbol_const_name(function)
    ));
    w.line("    }");
}
