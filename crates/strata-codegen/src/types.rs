//! Manifest types and their Rust FFI mapping.
//!
//! Manifests spell types the way a C header would. Each type belongs to a
//! category that decides how it crosses the plugin boundary, how the public
//! trampoline exposes it, and which default value a stub returns.

use std::borrow::Cow;

/// Integer widths understood by the manifest parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntKind {
    CInt,
    CUint,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Isize,
    Usize,
}

impl IntKind {
    /// Rust spelling of the integer type.
    pub fn rust_name(&self) -> &'static str {
        match self {
            IntKind::CInt => "::std::os::raw::c_int",
            IntKind::CUint => "::std::os::raw::c_uint",
            IntKind::I8 => "i8",
            IntKind::I16 => "i16",
            IntKind::I32 => "i32",
            IntKind::I64 => "i64",
            IntKind::U8 => "u8",
            IntKind::U16 => "u16",
            IntKind::U32 => "u32",
            IntKind::U64 => "u64",
            IntKind::Isize => "isize",
            IntKind::Usize => "usize",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "int" | "gint" | "signed" | "signed int" => IntKind::CInt,
            "unsigned" | "unsigned int" | "guint" => IntKind::CUint,
            "int8_t" | "gint8" => IntKind::I8,
            "int16_t" | "gint16" => IntKind::I16,
            "int32_t" | "gint32" => IntKind::I32,
            "int64_t" | "gint64" => IntKind::I64,
            "uint8_t" | "guint8" => IntKind::U8,
            "uint16_t" | "guint16" => IntKind::U16,
            "uint32_t" | "guint32" => IntKind::U32,
            "uint64_t" | "guint64" => IntKind::U64,
            "ssize_t" | "gssize" => IntKind::Isize,
            "size_t" | "gsize" => IntKind::Usize,
            _ => return None,
        };
        Some(kind)
    }
}

/// A type as written in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CType {
    /// `void`, only valid as a return type.
    Void,
    /// `bool` / `gboolean`.
    Bool,
    /// Any fixed or platform integer.
    Int(IntKind),
    /// `float`.
    F32,
    /// `double`.
    F64,
    /// `const char *`, a borrowed NUL-terminated string.
    ConstStr,
    /// `char *`, a mutable string buffer.
    MutStr,
    /// `void *`, opaque caller data.
    Opaque,
    /// `StrataError *`, the error reporting channel.
    ErrorOut,
    /// `enum Name`, a `#[repr(C)]` enum imported through `#include`.
    Enum(String),
}

impl CType {
    /// Parse a type from its manifest spelling.
    ///
    /// Returns `None` for types with no FFI mapping.
    pub fn parse(text: &str) -> Option<Self> {
        let stars = text.matches('*').count();
        let words: Vec<&str> = text
            .split(|c: char| c.is_whitespace() || c == '*')
            .filter(|w| !w.is_empty())
            .collect();

        match (stars, words.as_slice()) {
            (0, ["void"]) => Some(CType::Void),
            (0, ["bool"]) | (0, ["_Bool"]) | (0, ["gboolean"]) => Some(CType::Bool),
            (0, ["float"]) | (0, ["gfloat"]) => Some(CType::F32),
            (0, ["double"]) | (0, ["gdouble"]) => Some(CType::F64),
            (0, ["enum", name]) if is_identifier(name) => Some(CType::Enum(name.to_string())),
            (0, words) => IntKind::parse(&words.join(" ")).map(CType::Int),
            (1, ["const", "char"]) | (1, ["const", "gchar"]) => Some(CType::ConstStr),
            (1, ["char"]) | (1, ["gchar"]) => Some(CType::MutStr),
            (1, ["void"]) | (1, ["gpointer"]) => Some(CType::Opaque),
            (1, ["StrataError"]) => Some(CType::ErrorOut),
            _ => None,
        }
    }

    /// Type used in the `extern "C"` signature shared with plugins.
    pub fn ffi_type(&self, runtime: &str) -> String {
        match self {
            CType::Void => "()".to_string(),
            CType::Bool => "bool".to_string(),
            CType::Int(kind) => kind.rust_name().to_string(),
            CType::F32 => "f32".to_string(),
            CType::F64 => "f64".to_string(),
            CType::ConstStr => "*const ::std::os::raw::c_char".to_string(),
            CType::MutStr => "*mut ::std::os::raw::c_char".to_string(),
            CType::Opaque => "*mut ::std::ffi::c_void".to_string(),
            CType::ErrorOut => format!("*mut {runtime}::ffi::RawError"),
            CType::Enum(name) => name.clone(),
        }
    }

    /// Type a public trampoline takes for a parameter of this type.
    pub fn param_type(&self, runtime: &str) -> String {
        match self {
            CType::ConstStr => "&::std::ffi::CStr".to_string(),
            CType::ErrorOut => format!("&mut {runtime}::ffi::RawError"),
            other => other.ffi_type(runtime),
        }
    }

    /// Expression that forwards a trampoline parameter to the slot.
    pub fn forward(&self, name: &str, runtime: &str) -> String {
        match self {
            CType::ConstStr => format!("{name}.as_ptr()"),
            CType::ErrorOut => format!("{name} as *mut {runtime}::ffi::RawError"),
            _ => name.to_string(),
        }
    }

    /// Value a stub returns, `None` for `void`.
    pub fn default_value(&self) -> Option<String> {
        let value = match self {
            CType::Void => return None,
            CType::Bool => "false".to_string(),
            CType::Int(_) => "0".to_string(),
            CType::F32 | CType::F64 => "0.0".to_string(),
            CType::ConstStr => "::std::ptr::null()".to_string(),
            CType::MutStr | CType::Opaque | CType::ErrorOut => "::std::ptr::null_mut()".to_string(),
            CType::Enum(name) => format!("<{name} as ::std::default::Default>::default()"),
        };
        Some(value)
    }

    /// Whether a trampoline taking this type must be `unsafe`.
    ///
    /// Raw pointers the trampoline cannot check make the call unsafe.
    pub fn is_raw_pointer_param(&self) -> bool {
        matches!(self, CType::MutStr | CType::Opaque)
    }
}

/// Rust keywords, strict and reserved, as of the 2021 edition.
const KEYWORDS: &[&str] = &[
    "abstract", "as", "async", "await", "become", "box", "break", "const", "continue", "do", "dyn", "else",
    "enum", "extern", "false", "final", "fn", "for", "if", "impl", "in", "let", "loop", "macro", "match",
    "mod", "move", "mut", "override", "priv", "pub", "ref", "return", "static", "struct", "trait", "true",
    "try", "type", "typeof", "unsafe", "unsized", "use", "virtual", "where", "while", "yield",
];

/// Spell a manifest name as a Rust identifier.
///
/// Keywords become raw identifiers (`type` -> `r#type`). The few that
/// cannot be raw, and a lone `_`, get a trailing underscore.
pub fn rust_ident(name: &str) -> Cow<'_, str> {
    match name {
        "self" | "Self" | "super" | "crate" | "_" => Cow::Owned(format!("{name}_")),
        _ if KEYWORDS.contains(&name) => Cow::Owned(format!("r#{name}")),
        _ => Cow::Borrowed(name),
    }
}

/// Whether `s` is a valid identifier.
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalars() {
        assert_eq!(CType::parse("void"), Some(CType::Void));
        assert_eq!(CType::parse("gboolean"), Some(CType::Bool));
        assert_eq!(CType::parse("uint64_t"), Some(CType::Int(IntKind::U64)));
        assert_eq!(CType::parse("unsigned int"), Some(CType::Int(IntKind::CUint)));
        assert_eq!(CType::parse("double"), Some(CType::F64));
    }

    #[test]
    fn test_parse_pointers() {
        assert_eq!(CType::parse("const char *"), Some(CType::ConstStr));
        assert_eq!(CType::parse("const char*"), Some(CType::ConstStr));
        assert_eq!(CType::parse("char *"), Some(CType::MutStr));
        assert_eq!(CType::parse("void *"), Some(CType::Opaque));
        assert_eq!(CType::parse("StrataError *"), Some(CType::ErrorOut));
        assert_eq!(CType::parse("const char **"), None);
    }

    #[test]
    fn test_parse_enum() {
        assert_eq!(
            CType::parse("enum StrataLuksVersion"),
            Some(CType::Enum("StrataLuksVersion".to_string()))
        );
        assert_eq!(CType::parse("enum 9lives"), None);
    }

    #[test]
    fn test_default_values_follow_category() {
        assert_eq!(CType::Void.default_value(), None);
        assert_eq!(CType::Bool.default_value().as_deref(), Some("false"));
        assert_eq!(CType::Int(IntKind::I64).default_value().as_deref(), Some("0"));
        assert_eq!(CType::F32.default_value().as_deref(), Some("0.0"));
        assert_eq!(
            CType::ConstStr.default_value().as_deref(),
            Some("::std::ptr::null()")
        );
        assert_eq!(
            CType::Enum("Mode".to_string()).default_value().as_deref(),
            Some("<Mode as ::std::default::Default>::default()")
        );
    }

    #[test]
    fn test_param_mapping() {
        assert_eq!(CType::ConstStr.param_type("crate"), "&::std::ffi::CStr");
        assert_eq!(CType::ConstStr.forward("device", "crate"), "device.as_ptr()");
        assert_eq!(
            CType::ErrorOut.param_type("::strata"),
            "&mut ::strata::ffi::RawError"
        );
        assert!(CType::Opaque.is_raw_pointer_param());
        assert!(!CType::ConstStr.is_raw_pointer_param());
    }

    #[test]
    fn test_keywords_become_raw_identifiers() {
        assert_eq!(rust_ident("device"), "device");
        assert_eq!(rust_ident("loop"), "r#loop");
        assert_eq!(rust_ident("type"), "r#type");
        assert_eq!(rust_ident("move"), "r#move");
        assert_eq!(rust_ident("self"), "self_");
        assert_eq!(rust_ident("crate"), "crate_");
        assert_eq!(rust_ident("_"), "__");
    }
}
