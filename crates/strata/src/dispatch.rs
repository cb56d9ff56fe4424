//! Typed errors for plugin calls.
//!
//! Plugins report failures as a [`GenericError`] (domain, code, message).
//! A [`DispatchProxy`] wraps a module's functions and turns those into a
//! [`DispatchError`]:
//!
//! 1. A stub's "called, but not implemented" message always becomes
//!    [`DispatchError::NotImplemented`], which is both a not-implemented
//!    error and an error of the calling module.
//! 2. Otherwise the module's [`TranslationRule`]s are tried in order; the
//!    first match decides the [`ErrorKind`].
//! 3. Otherwise errors from a domain the module declares become its base
//!    error ([`ErrorKind::Base`]).
//! 4. Anything else passes through as [`DispatchError::Engine`].
//!
//! A call to a function no loaded plugin implements is always
//! [`DispatchError::NotImplemented`], whether or not it has an error channel.
//! Each generated module has a `checked` submodule pairing every function
//! with its member:
//!
//! ```
//! use std::ffi::CString;
//! use strata::abi::{fs, swap};
//! use strata::dispatch::DispatchProxy;
//! use strata::PluginName;
//!
//! let proxy = DispatchProxy::new(PluginName::Swap);
//! let device = CString::new("/dev/vdb").unwrap();
//! let err = swap::checked::swapoff(&proxy, &device).unwrap_err();
//! assert!(err.is_not_implemented());
//! assert_eq!(err.module(), Some(PluginName::Swap));
//!
//! let err = fs::checked::tech_name(&DispatchProxy::new(PluginName::Fs), 0).unwrap_err();
//! assert!(err.is_not_implemented());
//! ```

use crate::abi;
use crate::ffi::{code, ErrorDomain, GenericError, RawError};
use crate::loader::SlotBinding;
use crate::log;
use crate::plugin::PluginName;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;

/// Category of a module error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The module's base error.
    Base,
    TechUnavailable,
    AuthFailed,
    DeviceBusy,
    NoDevice,
    InvalidArgument,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Base => "error",
            ErrorKind::TechUnavailable => "technology unavailable",
            ErrorKind::AuthFailed => "authentication failed",
            ErrorKind::DeviceBusy => "device busy",
            ErrorKind::NoDevice => "no such device",
            ErrorKind::InvalidArgument => "invalid argument",
        };
        f.write_str(name)
    }
}

/// An error raised by one module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{module} {kind}: {message}")]
pub struct ModuleError {
    pub module: PluginName,
    pub kind: ErrorKind,
    pub domain: ErrorDomain,
    pub code: i32,
    pub message: String,
}

/// Error returned by calls through a [`DispatchProxy`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No loaded plugin implements the function.
    #[error("{message}")]
    NotImplemented {
        module: PluginName,
        function: String,
        message: String,
    },

    /// A module error.
    #[error(transparent)]
    Translated(ModuleError),

    /// An error no rule of the module claims.
    #[error(transparent)]
    Engine(GenericError),

    /// The module has no function of that name.
    #[error("The {module} module has no function '{name}'")]
    UnknownFunction { module: PluginName, name: String },
}

impl DispatchError {
    /// Whether this is the not-implemented error.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, DispatchError::NotImplemented { .. })
    }

    /// Module the error belongs to; `None` for untranslated engine errors.
    pub fn module(&self) -> Option<PluginName> {
        match self {
            DispatchError::NotImplemented { module, .. } => Some(*module),
            DispatchError::Translated(error) => Some(error.module),
            DispatchError::UnknownFunction { module, .. } => Some(*module),
            DispatchError::Engine(_) => None,
        }
    }

    /// Kind of the module error. Not-implemented errors are base errors of
    /// their module.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            DispatchError::NotImplemented { .. } => Some(ErrorKind::Base),
            DispatchError::Translated(error) => Some(error.kind),
            _ => None,
        }
    }

    /// The error as the generic channel reported it, when there was one.
    pub fn generic(&self) -> Option<GenericError> {
        match self {
            DispatchError::NotImplemented { message, .. } => Some(GenericError {
                domain: ErrorDomain::RUNTIME,
                code: code::NOT_IMPLEMENTED,
                message: message.clone(),
            }),
            DispatchError::Translated(error) => Some(GenericError {
                domain: error.domain,
                code: error.code,
                message: error.message.clone(),
            }),
            DispatchError::Engine(error) => Some(error.clone()),
            DispatchError::UnknownFunction { .. } => None,
        }
    }
}

/// Maps a matching generic error to an [`ErrorKind`].
///
/// Every predicate that is set must hold.
#[derive(Debug, Clone)]
pub struct TranslationRule {
    pub source_domain: Option<ErrorDomain>,
    pub code: Option<i32>,
    pub message_pattern: Option<Regex>,
    pub target: ErrorKind,
}

impl TranslationRule {
    /// A rule matching every error of a declared domain.
    pub fn new(target: ErrorKind) -> Self {
        Self {
            source_domain: None,
            code: None,
            message_pattern: None,
            target,
        }
    }

    pub fn domain(mut self, domain: ErrorDomain) -> Self {
        self.source_domain = Some(domain);
        self
    }

    pub fn code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn message(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.message_pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn matches(&self, error: &GenericError) -> bool {
        self.source_domain.map_or(true, |d| d == error.domain)
            && self.code.map_or(true, |c| c == error.code)
            && self
                .message_pattern
                .as_ref()
                .map_or(true, |p| p.is_match(&error.message))
    }
}

fn not_implemented_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"The function '(?P<function>[^']*)' called, but not implemented").expect("valid built-in pattern")
    })
}

/// Rule for a built-in message pattern.
fn builtin(pattern: &str, target: ErrorKind) -> TranslationRule {
    TranslationRule {
        message_pattern: Some(Regex::new(pattern).expect("valid built-in pattern")),
        ..TranslationRule::new(target)
    }
}

/// Ordered translation rules of one module.
#[derive(Debug, Clone)]
pub struct RuleSet {
    module: PluginName,
    domains: Vec<ErrorDomain>,
    rules: Vec<TranslationRule>,
}

impl RuleSet {
    /// An empty rule set; errors of `domains` become base errors.
    pub fn new(module: PluginName, domains: Vec<ErrorDomain>) -> Self {
        Self {
            module,
            domains,
            rules: Vec::new(),
        }
    }

    /// The built-in rules of `module`.
    pub fn for_module(module: PluginName) -> Self {
        let mut set = RuleSet::new(module, vec![module.error_domain(), ErrorDomain::EXEC]);

        set.push(TranslationRule::new(ErrorKind::TechUnavailable).code(code::TECH_UNAVAILABLE));
        set.push(TranslationRule::new(ErrorKind::InvalidArgument).code(code::INVALID_ARGUMENT));
        set.push(TranslationRule::new(ErrorKind::DeviceBusy).code(code::DEVICE_BUSY));
        set.push(TranslationRule::new(ErrorKind::NoDevice).code(code::NO_DEVICE));
        if module == PluginName::Crypto {
            set.push(TranslationRule::new(ErrorKind::AuthFailed).code(code::AUTH_FAILED));
            set.push(builtin(
                r"(?i)(no key available|incorrect passphrase|wrong passphrase)",
                ErrorKind::AuthFailed,
            ));
        }
        set.push(builtin(r"(?i)\b(device or resource busy|is busy|in use)\b", ErrorKind::DeviceBusy));
        set.push(builtin(r"(?i)\bno such (device|file)\b", ErrorKind::NoDevice));
        set
    }

    pub fn module(&self) -> PluginName {
        self.module
    }

    /// Append a rule; earlier rules take precedence.
    pub fn push(&mut self, rule: TranslationRule) {
        self.rules.push(rule);
    }

    /// Also translate errors of `domain`.
    pub fn declare_domain(&mut self, domain: ErrorDomain) {
        if !self.domains.contains(&domain) {
            self.domains.push(domain);
        }
    }

    pub fn declares(&self, domain: ErrorDomain) -> bool {
        self.domains.contains(&domain)
    }

    /// Translate an error raised by `function`.
    pub fn translate(&self, function: &str, error: GenericError) -> DispatchError {
        if let Some(captures) = not_implemented_pattern().captures(&error.message) {
            let function = captures
                .name("function")
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| function.to_string());
            return DispatchError::NotImplemented {
                module: self.module,
                function,
                message: error.message,
            };
        }

        if !self.declares(error.domain) {
            return DispatchError::Engine(error);
        }

        let kind = self
            .rules
            .iter()
            .find(|rule| rule.matches(&error))
            .map(|rule| rule.target)
            .unwrap_or(ErrorKind::Base);

        DispatchError::Translated(ModuleError {
            module: self.module,
            kind,
            domain: error.domain,
            code: error.code,
            message: error.message,
        })
    }
}

/// A resolved member of a module.
pub struct Member {
    pub module: PluginName,
    /// Name the member was requested by.
    pub name: String,
    pub symbol: &'static str,
    slot: &'static dyn SlotBinding,
}

impl Member {
    /// Whether a plugin implementation is currently bound.
    pub fn is_bound(&self) -> bool {
        self.slot.is_bound()
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("symbol", &self.symbol)
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Calls a module's functions and translates their errors.
#[derive(Debug)]
pub struct DispatchProxy {
    rules: RuleSet,
    members: Mutex<HashMap<String, Arc<Member>>>,
}

impl DispatchProxy {
    /// A proxy with the module's built-in rules.
    pub fn new(module: PluginName) -> Self {
        Self::with_rules(RuleSet::for_module(module))
    }

    pub fn with_rules(rules: RuleSet) -> Self {
        Self {
            rules,
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn module(&self) -> PluginName {
        self.rules.module()
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Resolve `name`, with or without the module's symbol prefix.
    ///
    /// Resolutions are cached for the life of the proxy.
    pub fn member(&self, name: &str) -> Result<Arc<Member>, DispatchError> {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(member) = members.get(name) {
            return Ok(Arc::clone(member));
        }

        let module = self.module();
        let abi = abi::module_abi(module);
        let slot = abi
            .slot(&format!("{}{}", abi.prefix, name))
            .or_else(|| abi.slot(name))
            .ok_or_else(|| DispatchError::UnknownFunction {
                module,
                name: name.to_string(),
            })?;

        let member = Arc::new(Member {
            module,
            name: name.to_string(),
            symbol: slot.symbol(),
            slot,
        });
        members.insert(name.to_string(), Arc::clone(&member));
        drop(members);

        log::process().debug(&format!("Resolved {}.{} to {}", module, name, member.symbol));
        Ok(member)
    }

    /// Call member `name` through `f`, translating any error it reports.
    ///
    /// `f` receives the error channel to pass to the generated function.
    /// When no plugin implements the member the call fails with
    /// [`DispatchError::NotImplemented`], even if `f` never used the
    /// channel. The generated `checked` wrappers pair each function with
    /// its member.
    pub fn call<R>(&self, name: &str, f: impl FnOnce(&mut RawError) -> R) -> Result<R, DispatchError> {
        let member = self.member(name)?;
        let mut error = RawError::new();
        let value = f(&mut error);
        match error.take() {
            Some(generic) => Err(self.rules.translate(member.symbol, generic)),
            None if !member.is_bound() => {
                let message = format!("The function '{}' called, but not implemented!", member.symbol);
                log::process().warning(&message);
                let generic = GenericError {
                    domain: ErrorDomain::RUNTIME,
                    code: code::NOT_IMPLEMENTED,
                    message,
                };
                Err(self.rules.translate(member.symbol, generic))
            }
            None => Ok(value),
        }
    }

    /// Translate an error reported outside [`DispatchProxy::call`].
    pub fn translate(&self, function: &str, error: GenericError) -> DispatchError {
        self.rules.translate(function, error)
    }
}
