//! Symbol manifest parsing.
//!
//! A manifest is a C-header flavoured description of the functions one
//! module exports:
//!
//! ```text
//! #include <crate::ffi::StrataLuksVersion>
//! #pragma strata prefix strata_crypto_
//! #pragma strata init strata_crypto_init
//!
//! #define STRATA_CRYPTO_LUKS2_METADATA 16 MiB
//!
//! /**
//!  * Opens the LUKS device @device as @name.
//!  */
//! bool strata_crypto_luks_open(const char *device, const char *name, StrataError *error);
//!
//! uint64_t strata_crypto_metadata_size(void) {
//!     STRATA_CRYPTO_LUKS2_METADATA
//! }
//! ```
//!
//! Declarations ending in `;` are part of the dynamically bound ABI.
//! Declarations with a body are fixed helpers whose (Rust) body is compiled
//! in verbatim. Names that are Rust keywords are emitted as raw identifiers
//! (`r#type`), and helper bodies must spell them that way.
//!
//! `#define`s whose value is not a size (hex literals, macro calls,
//! expressions) are ignored.

use crate::error::{ManifestError, ManifestResult};
use crate::types::{is_identifier, CType};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// A function parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub ty: CType,
}

/// One function declared by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDecl {
    /// Exported symbol name.
    pub name: String,

    /// Return type.
    pub ret: CType,

    /// Ordered parameters.
    pub params: Vec<Param>,

    /// Documentation block preceding the declaration.
    pub doc: Option<String>,

    /// Body of a fixed helper; `None` for dynamically bound functions.
    pub body: Option<String>,

    /// Line the declaration starts on.
    pub line: usize,
}

impl FunctionDecl {
    /// Whether this function is bound at runtime through a slot.
    pub fn is_exported(&self) -> bool {
        self.body.is_none()
    }

    /// The parameter carrying the error channel, if any.
    pub fn error_param(&self) -> Option<&Param> {
        self.params.iter().find(|p| p.ty == CType::ErrorOut)
    }
}

/// A `#define` size constant, expanded to bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeConstant {
    pub name: String,
    pub bytes: u64,
    pub doc: Option<String>,
}

/// Parsed manifest for one module.
#[derive(Debug, Clone, Default)]
pub struct ModuleManifest {
    /// Module name (e.g. `swap`).
    pub module: String,

    /// Symbol prefix stripped from trampoline names.
    pub prefix: Option<String>,

    /// Items imported with `#include`, in order.
    pub includes: Vec<String>,

    /// Size constants, in order.
    pub constants: Vec<SizeConstant>,

    /// Functions, in declaration order.
    pub functions: Vec<FunctionDecl>,

    /// Module initializer symbol.
    pub init_symbol: Option<String>,

    /// Module finalizer symbol.
    pub close_symbol: Option<String>,
}

impl ModuleManifest {
    /// Load a manifest from a file.
    pub fn from_file(module: &str, path: &Path) -> ManifestResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(module, &content)
    }

    /// Parse a manifest from a string.
    pub fn parse(module: &str, source: &str) -> ManifestResult<Self> {
        let mut manifest = ModuleManifest {
            module: module.to_string(),
            ..Default::default()
        };
        Parser::new(source).run(&mut manifest)?;
        manifest.validate()?;
        debug!(
            "Parsed manifest for {}: {} functions, {} constants",
            module,
            manifest.functions.len(),
            manifest.constants.len()
        );
        Ok(manifest)
    }

    /// Functions bound dynamically through slots.
    pub fn exported(&self) -> impl Iterator<Item = &FunctionDecl> {
        self.functions.iter().filter(|f| f.is_exported())
    }

    /// Fixed helpers compiled in verbatim.
    pub fn fixed(&self) -> impl Iterator<Item = &FunctionDecl> {
        self.functions.iter().filter(|f| !f.is_exported())
    }

    /// Public name of a function: its symbol without the module prefix.
    pub fn public_name<'a>(&self, function: &'a FunctionDecl) -> &'a str {
        match &self.prefix {
            Some(prefix) => match function.name.strip_prefix(prefix.as_str()) {
                Some(rest) if is_identifier(rest) => rest,
                _ => &function.name,
            },
            None => &function.name,
        }
    }

    fn validate(&self) -> ManifestResult<()> {
        let mut seen: HashMap<&str, usize> = HashMap::new();

        let names = self
            .functions
            .iter()
            .map(|f| (f.name.as_str(), f.line))
            .chain(self.constants.iter().map(|c| (c.name.as_str(), 0)));

        for (name, line) in names {
            if let Some(first_line) = seen.insert(name, line) {
                return Err(ManifestError::Duplicate {
                    name: name.to_string(),
                    line,
                    first_line,
                });
            }
        }

        for function in &self.functions {
            if function.ret == CType::ErrorOut {
                return Err(ManifestError::UnsupportedType {
                    line: function.line,
                    ty: "StrataError * as a return type".to_string(),
                });
            }
            if function.params.iter().filter(|p| p.ty == CType::ErrorOut).count() > 1 {
                return Err(ManifestError::malformed(
                    function.line,
                    format!("'{}' takes more than one error parameter", function.name),
                ));
            }
        }

        Ok(())
    }
}

/// Parse a size expression such as `4 MiB`, `(16 KiB)` or `512`.
pub fn parse_size(text: &str) -> Result<u64, SizeError> {
    let cleaned: String = text.chars().filter(|c| *c != '(' && *c != ')').collect();
    let cleaned = cleaned.trim();

    let split = cleaned
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(cleaned.len());
    let (digits, unit) = cleaned.split_at(split);
    let value: u64 = digits.parse().map_err(|_| SizeError::NotANumber)?;
    let multiplier = unit_multiplier(unit.trim()).ok_or_else(|| SizeError::UnknownUnit(unit.trim().to_string()))?;

    value.checked_mul(multiplier).ok_or(SizeError::Overflow)
}

/// Why a size expression was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeError {
    NotANumber,
    UnknownUnit(String),
    Overflow,
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    let multiplier = match unit {
        "" | "B" => 1,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1 << 40,
        "PiB" => 1 << 50,
        "EiB" => 1 << 60,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        "PB" => 1_000_000_000_000_000,
        "EB" => 1_000_000_000_000_000_000,
        _ => return None,
    };
    Some(multiplier)
}

/// Cursor over manifest text that keeps track of line numbers.
struct Parser<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
    pending_doc: Option<String>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            pending_doc: None,
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn advance(&mut self, len: usize) -> &'a str {
        let taken = &self.src[self.pos..self.pos + len];
        self.line += taken.matches('\n').count();
        self.pos += len;
        taken
    }

    fn skip_whitespace(&mut self) {
        let len = self.rest().len() - self.rest().trim_start().len();
        self.advance(len);
    }

    /// Consume up to and including `pat`, returning the text before it.
    fn take_until(&mut self, pat: &str, what: &'static str) -> ManifestResult<&'a str> {
        let start_line = self.line;
        match self.rest().find(pat) {
            Some(idx) => {
                let text = self.advance(idx);
                self.advance(pat.len());
                Ok(text)
            }
            None => Err(ManifestError::Unterminated {
                line: start_line,
                what,
            }),
        }
    }

    fn take_line(&mut self) -> &'a str {
        let len = self.rest().find('\n').unwrap_or(self.rest().len());
        self.advance(len)
    }

    fn run(&mut self, manifest: &mut ModuleManifest) -> ManifestResult<()> {
        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.is_empty() {
                return Ok(());
            }

            if rest.starts_with("/**") && !rest.starts_with("/**/") {
                self.advance(3);
                let text = self.take_until("*/", "documentation block")?;
                self.pending_doc = clean_doc(text);
            } else if rest.starts_with("/*") {
                self.advance(2);
                self.take_until("*/", "comment")?;
            } else if rest.starts_with("//") {
                self.take_line();
            } else if rest.starts_with('#') {
                let line = self.line;
                let text = self.take_line();
                self.directive(text, line, manifest)?;
            } else {
                let function = self.declaration()?;
                manifest.functions.push(function);
            }
        }
    }

    fn directive(&mut self, text: &str, line: usize, manifest: &mut ModuleManifest) -> ManifestResult<()> {
        let text = text.trim_start_matches('#').trim();
        let (keyword, args) = match text.split_once(char::is_whitespace) {
            Some((keyword, args)) => (keyword, args.trim()),
            None => (text, ""),
        };

        match keyword {
            "include" => {
                let item = args
                    .strip_prefix('<')
                    .and_then(|s| s.strip_suffix('>'))
                    .or_else(|| args.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                    .ok_or_else(|| ManifestError::malformed(line, format!("bad include '{args}'")))?;
                manifest.includes.push(item.trim().to_string());
                self.pending_doc = None;
            }
            "define" => {
                let (name, value) = match args.split_once(char::is_whitespace) {
                    Some((name, value)) => (name, value.trim()),
                    None => (args, ""),
                };
                if name.contains('(') {
                    debug!("Ignoring function-like macro on line {}", line);
                    self.pending_doc = None;
                    return Ok(());
                }
                if !is_identifier(name) {
                    return Err(ManifestError::malformed(line, format!("bad constant name '{name}'")));
                }
                if value.is_empty() {
                    // Include guards and feature flags carry no value.
                    debug!("Ignoring valueless define {} on line {}", name, line);
                    self.pending_doc = None;
                    return Ok(());
                }
                let bytes = match parse_size(value) {
                    Ok(bytes) => bytes,
                    Err(SizeError::Overflow) => {
                        return Err(ManifestError::ConstantOverflow {
                            line,
                            name: name.to_string(),
                        })
                    }
                    Err(SizeError::UnknownUnit(unit)) if unit.chars().all(|c| c.is_ascii_alphabetic()) => {
                        return Err(ManifestError::UnknownUnit { line, unit });
                    }
                    Err(_) => {
                        // Hex values, macros and expressions are not sizes.
                        debug!("Ignoring non-size define {} = '{}' on line {}", name, value, line);
                        self.pending_doc = None;
                        return Ok(());
                    }
                };
                manifest.constants.push(SizeConstant {
                    name: name.to_string(),
                    bytes,
                    doc: self.pending_doc.take(),
                });
            }
            "pragma" => {
                let mut words = args.split_whitespace();
                if words.next() == Some("strata") {
                    let key = words.next();
                    let value = words.next().map(str::to_string);
                    match (key, value) {
                        (Some("prefix"), Some(v)) => manifest.prefix = Some(v),
                        (Some("init"), Some(v)) if is_identifier(&v) => manifest.init_symbol = Some(v),
                        (Some("close"), Some(v)) if is_identifier(&v) => manifest.close_symbol = Some(v),
                        _ => {
                            return Err(ManifestError::malformed(line, format!("bad pragma '{args}'")));
                        }
                    }
                }
                self.pending_doc = None;
            }
            other => {
                debug!("Ignoring directive #{} on line {}", other, line);
                self.pending_doc = None;
            }
        }

        Ok(())
    }

    fn declaration(&mut self) -> ManifestResult<FunctionDecl> {
        let line = self.line;
        let rest = self.rest();
        let end = rest.find(&[';', '{'][..]).ok_or(ManifestError::Unterminated {
            line,
            what: "declaration",
        })?;
        let head = self.advance(end);
        let terminator = self.advance(1);

        let body = if terminator == "{" {
            Some(self.body(line)?)
        } else {
            None
        };

        let (name, ret, params) = parse_head(head, line)?;
        Ok(FunctionDecl {
            name,
            ret,
            params,
            doc: self.pending_doc.take(),
            body,
            line,
        })
    }

    /// Consume a brace-balanced body; the opening brace is already consumed.
    ///
    /// Braces inside string and character literals and line comments do
    /// not count.
    fn body(&mut self, line: usize) -> ManifestResult<String> {
        let rest = self.rest();
        let bytes = rest.as_bytes();
        let mut depth = 1usize;
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'"' => {
                    i += 1;
                    while i < bytes.len() && bytes[i] != b'"' {
                        if bytes[i] == b'\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                }
                b'\'' => {
                    // A lifetime has no closing quote and is left alone.
                    if bytes.get(i + 1) == Some(&b'\\') {
                        if let Some(close) = rest.get(i + 3..).and_then(|r| r.find('\'')) {
                            i += 3 + close;
                        }
                    } else if bytes.get(i + 2) == Some(&b'\'') {
                        i += 2;
                    }
                }
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                    continue;
                }
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let body = self.advance(i);
                        self.advance(1);
                        return Ok(trim_blank_lines(body));
                    }
                }
                _ => {}
            }
            i += 1;
        }
        Err(ManifestError::Unterminated { line, what: "function body" })
    }
}

fn parse_head(head: &str, line: usize) -> ManifestResult<(String, CType, Vec<Param>)> {
    let head = head.trim();
    let open = head
        .find('(')
        .ok_or_else(|| ManifestError::malformed(line, format!("expected '(' in '{head}'")))?;
    let close = head
        .rfind(')')
        .filter(|&close| close > open && head[close + 1..].trim().is_empty())
        .ok_or_else(|| ManifestError::malformed(line, format!("expected ')' at the end of '{head}'")))?;

    let (ret_text, name) = split_trailing_identifier(&head[..open]);
    if name.is_empty() {
        return Err(ManifestError::malformed(line, "missing function name"));
    }
    if ret_text.is_empty() {
        return Err(ManifestError::malformed(line, format!("'{name}' has no return type")));
    }
    let ret = CType::parse(ret_text).ok_or_else(|| ManifestError::UnsupportedType {
        line,
        ty: ret_text.to_string(),
    })?;

    let params_text = head[open + 1..close].trim();
    let mut params = Vec::new();
    if !params_text.is_empty() && params_text != "void" {
        for param in params_text.split(',') {
            let (ty_text, param_name) = split_trailing_identifier(param);
            if param_name.is_empty() || ty_text.is_empty() {
                return Err(ManifestError::malformed(
                    line,
                    format!("parameter '{}' of '{name}' needs a type and a name", param.trim()),
                ));
            }
            let ty = match CType::parse(ty_text) {
                Some(CType::Void) | None => {
                    return Err(ManifestError::UnsupportedType {
                        line,
                        ty: ty_text.to_string(),
                    })
                }
                Some(ty) => ty,
            };
            params.push(Param {
                name: param_name.to_string(),
                ty,
            });
        }
    }

    Ok((name.to_string(), ret, params))
}

/// Split `const char *name` into (`const char *`, `name`).
fn split_trailing_identifier(text: &str) -> (&str, &str) {
    let text = text.trim();
    let start = text
        .rfind(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .map(|idx| idx + 1)
        .unwrap_or(0);
    let name = &text[start..];
    if !is_identifier(name) {
        return (text, "");
    }
    (text[..start].trim(), name)
}

fn clean_doc(text: &str) -> Option<String> {
    let lines: Vec<&str> = text
        .lines()
        .map(|line| {
            let line = line.trim();
            let line = line.strip_prefix('*').unwrap_or(line);
            line.strip_prefix(' ').unwrap_or(line).trim_end()
        })
        .collect();

    let first = lines.iter().position(|l| !l.is_empty())?;
    let last = lines.iter().rposition(|l| !l.is_empty())?;
    Some(lines[first..=last].join("\n"))
}

fn trim_blank_lines(body: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let first = lines.iter().position(|l| !l.trim().is_empty());
    let last = lines.iter().rposition(|l| !l.trim().is_empty());
    match (first, last) {
        (Some(first), Some(last)) => lines[first..=last].join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntKind;

    const SWAP: &str = r#"
#pragma once
#include <crate::ffi::StrataTech>
#pragma strata prefix strata_swap_
#pragma strata init strata_swap_init
#pragma strata close strata_swap_close

/**
 * Size reserved for the swap signature.
 */
#define STRATA_SWAP_SIGNATURE_AREA (4 KiB)

/* not a doc comment */

/**
 * Creates a swap signature on @device.
 *
 * Returns whether the signature was written.
 */
bool strata_swap_mkswap(const char *device,
                        const char *label,
                        StrataError *error);

bool strata_swap_swapoff(const char *device, StrataError *error);

uint64_t strata_swap_min_size(void) {
    STRATA_SWAP_SIGNATURE_AREA * 10
}
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = ModuleManifest::parse("swap", SWAP).unwrap();
        assert_eq!(manifest.module, "swap");
        assert_eq!(manifest.prefix.as_deref(), Some("strata_swap_"));
        assert_eq!(manifest.init_symbol.as_deref(), Some("strata_swap_init"));
        assert_eq!(manifest.close_symbol.as_deref(), Some("strata_swap_close"));
        assert_eq!(manifest.includes, vec!["crate::ffi::StrataTech".to_string()]);
        assert_eq!(manifest.functions.len(), 3);
        assert_eq!(manifest.exported().count(), 2);
        assert_eq!(manifest.fixed().count(), 1);
    }

    #[test]
    fn test_parse_function_details() {
        let manifest = ModuleManifest::parse("swap", SWAP).unwrap();
        let mkswap = &manifest.functions[0];
        assert_eq!(mkswap.name, "strata_swap_mkswap");
        assert_eq!(mkswap.ret, CType::Bool);
        assert_eq!(mkswap.params.len(), 3);
        assert_eq!(mkswap.params[0].name, "device");
        assert_eq!(mkswap.params[0].ty, CType::ConstStr);
        assert_eq!(mkswap.params[2].ty, CType::ErrorOut);
        assert_eq!(
            mkswap.doc.as_deref(),
            Some("Creates a swap signature on @device.\n\nReturns whether the signature was written.")
        );
        assert_eq!(manifest.public_name(mkswap), "mkswap");

        let swapoff = &manifest.functions[1];
        assert_eq!(swapoff.doc, None);

        let min_size = &manifest.functions[2];
        assert_eq!(min_size.ret, CType::Int(IntKind::U64));
        assert!(min_size.params.is_empty());
        assert_eq!(min_size.body.as_deref(), Some("    STRATA_SWAP_SIGNATURE_AREA * 10"));
    }

    #[test]
    fn test_size_constant_expanded() {
        let manifest = ModuleManifest::parse("swap", SWAP).unwrap();
        assert_eq!(manifest.constants.len(), 1);
        assert_eq!(manifest.constants[0].name, "STRATA_SWAP_SIGNATURE_AREA");
        assert_eq!(manifest.constants[0].bytes, 4096);
        assert_eq!(
            manifest.constants[0].doc.as_deref(),
            Some("Size reserved for the swap signature.")
        );
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("512"), Ok(512));
        assert_eq!(parse_size("4 MiB"), Ok(4 * 1024 * 1024));
        assert_eq!(parse_size("(1 GB)"), Ok(1_000_000_000));
        assert_eq!(parse_size("2TiB"), Ok(2 << 40));
        assert_eq!(parse_size("8 EiB"), Ok(1 << 63));
        assert_eq!(parse_size("16 EiB"), Err(SizeError::Overflow));
        assert_eq!(parse_size("3 XiB"), Err(SizeError::UnknownUnit("XiB".to_string())));
        assert_eq!(parse_size("MiB"), Err(SizeError::NotANumber));
    }

    #[test]
    fn test_duplicate_function_rejected() {
        let source = "bool strata_a(void);\nbool strata_a(StrataError *error);\n";
        let err = ModuleManifest::parse("a", source).unwrap_err();
        match err {
            ManifestError::Duplicate {
                name,
                line,
                first_line,
            } => {
                assert_eq!(name, "strata_a");
                assert_eq!(line, 2);
                assert_eq!(first_line, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_declarations() {
        assert!(matches!(
            ModuleManifest::parse("a", "bool strata_a;"),
            Err(ManifestError::Malformed { .. })
        ));
        assert!(matches!(
            ModuleManifest::parse("a", "strata_a(void);"),
            Err(ManifestError::Malformed { .. })
        ));
        assert!(matches!(
            ModuleManifest::parse("a", "bool strata_a(int);"),
            Err(ManifestError::Malformed { .. })
        ));
        assert!(matches!(
            ModuleManifest::parse("a", "GList *strata_a(void);"),
            Err(ManifestError::UnsupportedType { .. })
        ));
        assert!(matches!(
            ModuleManifest::parse("a", "bool strata_a(void) { true"),
            Err(ManifestError::Unterminated { .. })
        ));
        assert!(matches!(
            ModuleManifest::parse("a", "#define BIG 20 EiB\n"),
            Err(ManifestError::ConstantOverflow { .. })
        ));
        assert!(matches!(
            ModuleManifest::parse("a", "#define ODD 2 QiB\n"),
            Err(ManifestError::UnknownUnit { .. })
        ));
    }

    #[test]
    fn test_nested_braces_in_body() {
        let source = "bool strata_a_check(uint64_t size) {\n    if size > 0 { true } else { false }\n}\n";
        let manifest = ModuleManifest::parse("a", source).unwrap();
        assert_eq!(
            manifest.functions[0].body.as_deref(),
            Some("    if size > 0 { true } else { false }")
        );
    }

    #[test]
    fn test_line_numbers_survive_comments() {
        let source = "/* one\n two */\n// three\nbool strata_a(void);\n";
        let manifest = ModuleManifest::parse("a", source).unwrap();
        assert_eq!(manifest.functions[0].line, 4);
    }

    #[test]
    fn test_non_size_defines_are_skipped() {
        let source = "#define STRATA_LVM_ERROR strata_lvm_error_quark ()\n\
                      #define STRATA_LVM_FLAGS 0x10\n\
                      #define STRATA_LVM_SHIFTED (1 << 4)\n\
                      #define STRATA_LVM_MB(n) ((n) * 1024 * 1024)\n\
                      #define STRATA_LVM_PE 4 MiB\n\
                      bool strata_lvm_a(void);\n";
        let manifest = ModuleManifest::parse("lvm", source).unwrap();
        assert_eq!(manifest.constants.len(), 1);
        assert_eq!(manifest.constants[0].name, "STRATA_LVM_PE");
        assert_eq!(manifest.functions.len(), 1);
    }

    #[test]
    fn test_braces_in_literals_do_not_close_body() {
        let source = "bool strata_a_check(const char *name) {\n    let open = '{';\n    let close = \"}}\";\n    // }\n    name.to_bytes().len() > 0 && open != close.chars().next().unwrap_or('\\'')\n}\nbool strata_a_next(void);\n";
        let manifest = ModuleManifest::parse("a", source).unwrap();
        assert_eq!(manifest.functions.len(), 2);
        let body = manifest.functions[0].body.as_deref().unwrap();
        assert!(body.starts_with("    let open = '{';"));
        assert!(body.ends_with("unwrap_or('\\'')"));
        assert_eq!(manifest.functions[1].name, "strata_a_next");
    }
}
