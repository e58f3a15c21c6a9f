//! Host environment: the globals capabilities are reached through.
//!
//! The embedder registers globals on a [`HostEnvironment`]. Some logical
//! names have several spellings depending on the host (`globalThis` versus
//! `self` versus `window`, `crypto` versus `msCrypto`); the probes in
//! [`EnvironmentConfig`] list them in order of preference and the first one
//! present wins. A missing capability is only an error when something
//! actually asks for it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::builtins;
use crate::scope::Scope;
use crate::value::{HostObject, HostValue, Thrown};

/// Alternative global names per logical name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Logical name to candidate globals, most preferred first
    pub probes: BTreeMap<String, Vec<String>>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        let probes = [
            ("global", &["globalThis", "self", "window", "global"][..]),
            ("crypto", &["crypto", "msCrypto"][..]),
            ("AudioContext", &["AudioContext", "webkitAudioContext"][..]),
        ]
        .into_iter()
        .map(|(name, candidates)| {
            (
                name.to_string(),
                candidates.iter().map(|c| c.to_string()).collect(),
            )
        })
        .collect();
        Self { probes }
    }
}

impl EnvironmentConfig {
    /// No probes: every name resolves only to itself.
    pub fn empty() -> Self {
        Self {
            probes: BTreeMap::new(),
        }
    }

    /// Builder: set the candidates for a logical name.
    pub fn probe(mut self, name: &str, candidates: &[&str]) -> Self {
        self.probes.insert(
            name.to_string(),
            candidates.iter().map(|c| c.to_string()).collect(),
        );
        self
    }
}

/// Globals registered by the embedder.
#[derive(Debug, Clone, Default)]
pub struct HostEnvironment {
    globals: BTreeMap<String, HostValue>,
}

impl HostEnvironment {
    /// Empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register a global value.
    pub fn global(mut self, name: &str, value: impl Into<HostValue>) -> Self {
        self.globals.insert(name.to_string(), value.into());
        self
    }

    /// Builder: register a global object.
    pub fn object(self, name: &str, object: impl HostObject) -> Self {
        self.global(name, HostValue::object(object))
    }

    /// Builder: register a global function.
    pub fn function<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>, &[HostValue]) -> Result<HostValue, Thrown> + Send + Sync + 'static,
    {
        self.global(name, HostValue::function(name, f))
    }

    /// Register a global in place.
    pub fn insert(&mut self, name: &str, value: HostValue) {
        self.globals.insert(name.to_string(), value);
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    /// Registered names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.globals.keys().map(String::as_str)
    }
}

/// Globals plus probes, resolved for one instance.
#[derive(Debug, Clone)]
pub struct Environment {
    globals: BTreeMap<String, HostValue>,
    config: EnvironmentConfig,
}

impl Environment {
    /// Resolve `host` against `config`, adding the builtins if requested.
    pub fn new(mut host: HostEnvironment, config: EnvironmentConfig, install_builtins: bool) -> Self {
        if install_builtins {
            builtins::install(&mut host, &config);
        }
        let env = Self {
            globals: host.globals,
            config,
        };
        for name in env.config.probes.keys() {
            match env.detect(name) {
                Some(found) => tracing::debug!(name = %name, found, "environment probe resolved"),
                None => tracing::debug!(name = %name, "environment probe found nothing"),
            }
        }
        env
    }

    /// Which candidate global satisfies logical `name`, if any.
    pub fn detect(&self, name: &str) -> Option<&str> {
        match self.config.probes.get(name) {
            Some(candidates) => candidates
                .iter()
                .find(|c| self.globals.get(c.as_str()).is_some_and(|v| !v.is_like_none()))
                .map(String::as_str),
            None => self
                .globals
                .get_key_value(name)
                .filter(|(_, v)| !v.is_like_none())
                .map(|(k, _)| k.as_str()),
        }
    }

    /// Value of logical `name`; `None` when absent.
    pub fn resolve(&self, name: &str) -> Option<HostValue> {
        self.detect(name).and_then(|found| self.globals.get(found)).cloned()
    }

    /// Value of a dotted path such as `console.log`.
    ///
    /// The first segment is resolved through the probes, the rest are
    /// property reads. `None` only when the root is absent.
    pub fn resolve_path(&self, path: &str) -> Option<HostValue> {
        let mut segments = path.split('.');
        let root = self.resolve(segments.next()?)?;
        Some(segments.fold(root, |value, prop| value.get(prop)))
    }

    /// Like [`Environment::resolve`], throwing a `ReferenceError` when absent.
    pub fn require(&self, name: &str) -> Result<HostValue, Thrown> {
        self.resolve(name)
            .ok_or_else(|| Thrown::reference_error(format!("{name} is not defined")))
    }

    /// The probes in use.
    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Registered global names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.globals.keys().map(String::as_str)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(HostEnvironment::new(), EnvironmentConfig::default(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::PlainObject;

    #[test]
    fn test_probe_prefers_first_candidate() {
        let host = HostEnvironment::new()
            .object("window", PlainObject::with_class("Window"))
            .object("self", PlainObject::with_class("Worker"));
        let env = Environment::new(host, EnvironmentConfig::default(), false);
        assert_eq!(env.detect("global"), Some("self"));
        assert_eq!(env.resolve("global").unwrap().class_name(), "Worker");
    }

    #[test]
    fn test_vendor_prefixed_fallback() {
        let host = HostEnvironment::new()
            .object("webkitAudioContext", PlainObject::with_class("AudioContext"));
        let env = Environment::new(host, EnvironmentConfig::default(), false);
        assert_eq!(env.detect("AudioContext"), Some("webkitAudioContext"));
    }

    #[test]
    fn test_absent_and_null_globals() {
        let host = HostEnvironment::new().global("window", HostValue::Null);
        let env = Environment::new(host, EnvironmentConfig::default(), false);
        assert!(env.resolve("global").is_none());
        assert!(env.resolve("document").is_none());
        let err = env.require("document").unwrap_err();
        assert_eq!(err.to_string(), "ReferenceError: document is not defined");
    }

    #[test]
    fn test_resolve_path() {
        let host = HostEnvironment::new().object(
            "performance",
            PlainObject::new().prop("timeOrigin", 12.5),
        );
        let env = Environment::new(host, EnvironmentConfig::empty(), false);
        assert_eq!(
            env.resolve_path("performance.timeOrigin"),
            Some(HostValue::Number(12.5))
        );
        assert_eq!(
            env.resolve_path("performance.missing"),
            Some(HostValue::Undefined)
        );
        assert!(env.resolve_path("nope.x").is_none());
    }

    #[test]
    fn test_builtins_installed_when_absent() {
        let env = Environment::new(HostEnvironment::new(), EnvironmentConfig::default(), true);
        assert!(env.resolve("console").is_some());
        assert_eq!(env.detect("crypto"), Some("crypto"));

        let custom = HostEnvironment::new().object("msCrypto", PlainObject::with_class("Crypto"));
        let env = Environment::new(custom, EnvironmentConfig::default(), true);
        assert_eq!(env.detect("crypto"), Some("msCrypto"));
    }

    #[test]
    fn test_config_json() {
        let config: EnvironmentConfig =
            serde_json::from_str(r#"{"probes": {"global": ["window"]}}"#).unwrap();
        assert_eq!(config.probes["global"], vec!["window".to_string()]);
        assert!(!config.probes.contains_key("crypto"));
    }
}
