//! The host realm: the bindings and modules a sandbox may borrow from the host.
//!
//! Nothing in here touches V8. Host values are plain Rust data, host functions
//! are Rust closures, and the realm factory / module linker translate them into
//! something the sandboxed realm can see.

pub mod builtins;

use crate::realm::Capability;
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

pub type SyncHostFn = dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync;
pub type AsyncHostFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// A host function callable from sandboxed code.
///
/// Arguments and return values cross the realm boundary as JSON. An `Err`
/// surfaces as a thrown `Error` inside the sandbox.
#[derive(Clone)]
pub enum HostFunction {
    Sync(Arc<SyncHostFn>),
    Async(Arc<AsyncHostFn>),
}

impl HostFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        HostFunction::Sync(Arc::new(f))
    }

    /// Host function whose result is a promise inside the sandbox.
    pub fn new_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        HostFunction::Async(Arc::new(move |args| f(args).boxed()))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, HostFunction::Async(_))
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostFunction::Sync(_) => f.write_str("HostFunction::Sync"),
            HostFunction::Async(_) => f.write_str("HostFunction::Async"),
        }
    }
}

/// Bindings implemented by the realm itself rather than by a host closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeBinding {
    /// `console.*`, captured per realm.
    Console,
    /// `fetch()`, gated by the origin allow-list.
    Fetch,
    /// Synchronous host module loader.
    Require,
    SetTimeout,
    ClearTimeout,
    SetInterval,
    ClearInterval,
    QueueMicrotask,
    StructuredClone,
    /// `URL`, parsed on the host with the `url` crate.
    Url,
    UrlSearchParams,
    TextEncoder,
    TextDecoder,
    Atob,
    Btoa,
    /// `crypto.randomUUID`, `crypto.getRandomValues`, `crypto.subtle.digest`.
    Crypto,
}

impl NativeBinding {
    /// The web platform globals every realm may share, with their global names.
    pub const WEB: &'static [(&'static str, NativeBinding)] = &[
        ("setTimeout", NativeBinding::SetTimeout),
        ("clearTimeout", NativeBinding::ClearTimeout),
        ("setInterval", NativeBinding::SetInterval),
        ("clearInterval", NativeBinding::ClearInterval),
        ("queueMicrotask", NativeBinding::QueueMicrotask),
        ("structuredClone", NativeBinding::StructuredClone),
        ("URL", NativeBinding::Url),
        ("URLSearchParams", NativeBinding::UrlSearchParams),
        ("TextEncoder", NativeBinding::TextEncoder),
        ("TextDecoder", NativeBinding::TextDecoder),
        ("atob", NativeBinding::Atob),
        ("btoa", NativeBinding::Btoa),
        ("crypto", NativeBinding::Crypto),
    ];
}

/// A value owned by the host realm.
#[derive(Debug, Clone)]
pub enum HostValue {
    Data(Value),
    Function(HostFunction),
    Object(Vec<(String, PropertyDescriptor)>),
    Native(NativeBinding),
}

impl From<Value> for HostValue {
    fn from(value: Value) -> Self {
        HostValue::Data(value)
    }
}

impl From<HostFunction> for HostValue {
    fn from(function: HostFunction) -> Self {
        HostValue::Function(function)
    }
}

#[derive(Debug, Clone)]
pub enum Slot {
    Value { value: HostValue, writable: bool },
    Accessor {
        get: Option<HostFunction>,
        set: Option<HostFunction>,
    },
}

/// Mirror of a JavaScript property descriptor.
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub slot: Slot,
    pub enumerable: bool,
    pub configurable: bool,
}

impl PropertyDescriptor {
    /// Writable, enumerable, configurable data property.
    pub fn value(value: impl Into<HostValue>) -> Self {
        Self {
            slot: Slot::Value {
                value: value.into(),
                writable: true,
            },
            enumerable: true,
            configurable: true,
        }
    }

    pub fn accessor(get: Option<HostFunction>, set: Option<HostFunction>) -> Self {
        Self {
            slot: Slot::Accessor { get, set },
            enumerable: true,
            configurable: true,
        }
    }

    /// Same descriptor, but skipped by `Object.keys` and `for..in`.
    pub fn hidden(mut self) -> Self {
        self.enumerable = false;
        self
    }

    pub fn read_only(mut self) -> Self {
        if let Slot::Value { writable, .. } = &mut self.slot {
            *writable = false;
        }
        self
    }
}

// ============================================================================
// Host globals
// ============================================================================

/// One own property of the host's global object.
#[derive(Debug, Clone)]
pub struct HostGlobal {
    pub name: String,
    pub descriptor: PropertyDescriptor,
    pub capability: Capability,
}

/// The host's global binding table, in definition order.
#[derive(Debug, Clone, Default)]
pub struct HostGlobals {
    entries: Vec<HostGlobal>,
}

impl HostGlobals {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `console`, `fetch`, the web platform globals and the process-control
    /// object.
    pub fn standard() -> Self {
        let mut globals = Self::empty();
        for (name, native) in NativeBinding::WEB {
            globals.define(
                *name,
                PropertyDescriptor::value(HostValue::Native(*native)).hidden(),
                Capability::Shared,
            );
        }
        globals
            .define(
                "console",
                PropertyDescriptor::value(HostValue::Native(NativeBinding::Console)).hidden(),
                Capability::Shared,
            )
            .define(
                "fetch",
                PropertyDescriptor::value(HostValue::Native(NativeBinding::Fetch)),
                Capability::Shared,
            )
            .define(
                "process",
                PropertyDescriptor::value(builtins::process_object()),
                Capability::ProcessControl,
            );
        globals
    }

    /// Define (or redefine) a global. Redefinition keeps the original position.
    pub fn define(
        &mut self,
        name: impl Into<String>,
        descriptor: PropertyDescriptor,
        capability: Capability,
    ) -> &mut Self {
        let name = name.into();
        let global = HostGlobal {
            name: name.clone(),
            descriptor,
            capability,
        };
        match self.entries.iter_mut().find(|g| g.name == name) {
            Some(existing) => *existing = global,
            None => self.entries.push(global),
        }
        self
    }

    pub fn define_value(&mut self, name: impl Into<String>, value: impl Into<HostValue>) -> &mut Self {
        self.define(name, PropertyDescriptor::value(value), Capability::Shared)
    }

    pub fn define_function(&mut self, name: impl Into<String>, function: HostFunction) -> &mut Self {
        self.define(name, PropertyDescriptor::value(function), Capability::Shared)
    }

    /// Computed global: `get` runs on the host every time the sandbox reads it.
    pub fn define_accessor(
        &mut self,
        name: impl Into<String>,
        get: Option<HostFunction>,
        set: Option<HostFunction>,
    ) -> &mut Self {
        self.define(name, PropertyDescriptor::accessor(get, set), Capability::Shared)
    }

    pub fn get(&self, name: &str) -> Option<&HostGlobal> {
        self.entries.iter().find(|g| g.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostGlobal> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Host modules
// ============================================================================

/// A module living in the host realm.
///
/// Exports are live on the host side: [`HostModule::set`] changes what the
/// *next* link sees, never what an already-linked sandbox sees.
#[derive(Debug, Default)]
pub struct HostModule {
    exports: RwLock<Vec<(String, HostValue)>>,
}

impl HostModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_export(self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_default(self, value: impl Into<HostValue>) -> Self {
        self.with_export("default", value)
    }

    /// Insert or replace an export. New names go to the end.
    pub fn set(&self, name: impl Into<String>, value: impl Into<HostValue>) {
        let name = name.into();
        let value = value.into();
        let mut exports = self.exports.write().unwrap_or_else(|e| e.into_inner());
        match exports.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => exports.push((name, value)),
        }
    }

    pub fn has_default(&self) -> bool {
        self.exports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|(n, _)| n == "default")
    }

    /// Copy of the current exports, in insertion order.
    pub fn exports(&self) -> Vec<(String, HostValue)> {
        self.exports.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Lazily produces a host module the first time it is imported.
///
/// Returning `Ok(None)` means the module resolved to nothing, which fails the
/// link for that specifier.
pub trait HostModuleProvider: Send + Sync {
    fn load(&self) -> Result<Option<HostModule>>;
}

impl<F> HostModuleProvider for F
where
    F: Fn() -> Result<Option<HostModule>> + Send + Sync,
{
    fn load(&self) -> Result<Option<HostModule>> {
        self()
    }
}

enum Registered {
    Ready(Arc<HostModule>),
    Lazy(Arc<dyn HostModuleProvider>),
}

/// Where a specifier points inside the host realm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostSpecifier {
    /// A registered host module, by bare name.
    Registered(String),
    /// A host data file.
    File(PathBuf),
}

impl HostSpecifier {
    pub fn cache_key(&self) -> String {
        match self {
            HostSpecifier::Registered(name) => format!("module:{}", name),
            HostSpecifier::File(path) => format!("file:{}", path.display()),
        }
    }
}

impl fmt::Display for HostSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostSpecifier::Registered(name) => f.write_str(name),
            HostSpecifier::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Module resolution and loading for the host realm.
///
/// Cheap to clone; clones share the registry and the module cache.
#[derive(Clone, Default)]
pub struct HostRealm {
    registry: Arc<RwLock<HashMap<String, Registered>>>,
    cache: Arc<Mutex<HashMap<String, Arc<HostModule>>>>,
}

impl HostRealm {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Host realm with the built-in `path`, `crypto` and `encoding` modules.
    pub fn standard() -> Self {
        let realm = Self::empty();
        realm.register("path", builtins::path_module());
        realm.register("crypto", builtins::crypto_module());
        realm.register("encoding", builtins::encoding_module());
        realm
    }

    pub fn register(&self, name: impl Into<String>, module: HostModule) -> Arc<HostModule> {
        let module = Arc::new(module);
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), Registered::Ready(module.clone()));
        module
    }

    pub fn register_provider(&self, name: impl Into<String>, provider: impl HostModuleProvider + 'static) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), Registered::Lazy(Arc::new(provider)));
    }

    /// A registered module that has already been produced, for host-side updates.
    pub fn module(&self, name: &str) -> Option<Arc<HostModule>> {
        let key = HostSpecifier::Registered(name.to_string()).cache_key();
        if let Some(module) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return Some(module.clone());
        }
        match self.registry.read().unwrap_or_else(|e| e.into_inner()).get(name) {
            Some(Registered::Ready(module)) => Some(module.clone()),
            _ => None,
        }
    }

    /// Resolve a specifier against `base`.
    ///
    /// Relative specifiers are joined onto `base`; bare specifiers name
    /// registered modules; absolute paths and `file://` URLs name host files.
    pub fn resolve(&self, specifier: &str, base: &Path) -> Result<HostSpecifier> {
        if specifier.starts_with("http://")
            || specifier.starts_with("https://")
            || specifier.starts_with("data:")
            || specifier.starts_with("blob:")
        {
            return Err(anyhow!("Remote imports are forbidden: {}", specifier));
        }

        if specifier.starts_with("./")
            || specifier.starts_with("../")
            || specifier == "."
            || specifier == ".."
        {
            return Ok(HostSpecifier::File(normalize(&base.join(specifier))));
        }

        if specifier.starts_with("file://") {
            let url = url::Url::parse(specifier)
                .map_err(|e| anyhow!("Invalid file URL '{}': {}", specifier, e))?;
            let path = url
                .to_file_path()
                .map_err(|_| anyhow!("Failed to convert URL to path: {}", specifier))?;
            return Ok(HostSpecifier::File(normalize(&path)));
        }

        if Path::new(specifier).is_absolute() {
            return Ok(HostSpecifier::File(normalize(Path::new(specifier))));
        }

        if specifier.is_empty() {
            return Err(anyhow!("Empty module specifier"));
        }

        Ok(HostSpecifier::Registered(specifier.to_string()))
    }

    /// Asynchronous import, used while linking.
    ///
    /// `Ok(None)` means the specifier resolved to nothing.
    pub async fn import(&self, specifier: &HostSpecifier) -> Result<Option<Arc<HostModule>>> {
        if let Some(module) = self.cached(specifier) {
            return Ok(Some(module));
        }

        let module = match specifier {
            HostSpecifier::Registered(name) => self.load_registered(name)?,
            HostSpecifier::File(path) => {
                check_file_extension(path)?;
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))?;
                Some(file_module(path, &text)?)
            }
        };

        Ok(module.map(|m| self.remember(specifier, m)))
    }

    /// Synchronous import, used by the `require` binding.
    pub fn require(&self, specifier: &str, base: &Path) -> Result<Arc<HostModule>> {
        let resolved = self.resolve(specifier, base)?;
        if let Some(module) = self.cached(&resolved) {
            return Ok(module);
        }

        let module = match &resolved {
            HostSpecifier::Registered(name) => self.load_registered(name)?,
            HostSpecifier::File(path) => {
                check_file_extension(path)?;
                let text = std::fs::read_to_string(path)
                    .map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))?;
                Some(file_module(path, &text)?)
            }
        };

        module
            .map(|m| self.remember(&resolved, m))
            .ok_or_else(|| anyhow!("Host module '{}' resolved to nothing", specifier))
    }

    fn cached(&self, specifier: &HostSpecifier) -> Option<Arc<HostModule>> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&specifier.cache_key())
            .cloned()
    }

    fn remember(&self, specifier: &HostSpecifier, module: Arc<HostModule>) -> Arc<HostModule> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(specifier.cache_key())
            .or_insert(module)
            .clone()
    }

    fn load_registered(&self, name: &str) -> Result<Option<Arc<HostModule>>> {
        let provider = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            match registry.get(name) {
                Some(Registered::Ready(module)) => return Ok(Some(module.clone())),
                Some(Registered::Lazy(provider)) => provider.clone(),
                None => return Err(anyhow!("Cannot find host module '{}'", name)),
            }
        };
        tracing::debug!(module = name, "loading lazy host module");
        Ok(provider.load()?.map(Arc::new))
    }
}

fn check_file_extension(path: &Path) -> Result<()> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") | Some("txt") => Ok(()),
        _ => Err(anyhow!(
            "Host realm only imports .json and .txt files, got: {}",
            path.display()
        )),
    }
}

/// Turn a host data file into a module.
///
/// JSON files export the parsed value as `default` plus one named export per
/// top-level key; text files export their contents as `default`.
fn file_module(path: &Path, text: &str) -> Result<Arc<HostModule>> {
    let module = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let value: Value = serde_json::from_str(text)
                .map_err(|e| anyhow!("Invalid JSON in '{}': {}", path.display(), e))?;
            let mut module = HostModule::new().with_default(value.clone());
            if let Value::Object(map) = value {
                for (key, val) in map {
                    if key != "default" {
                        module = module.with_export(key, val);
                    }
                }
            }
            module
        }
        _ => HostModule::new().with_default(Value::String(text.to_string())),
    };
    Ok(Arc::new(module))
}

/// Lexically normalize `.` and `..` without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_blocks_remote_specifiers() {
        let realm = HostRealm::empty();
        let result = realm.resolve("https://evil.com/payload.js", Path::new("/tmp"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Remote imports are forbidden"));
    }

    #[test]
    fn test_relative_specifiers_join_base() {
        let realm = HostRealm::empty();
        let resolved = realm.resolve("../shared/data.json", Path::new("/srv/app/scripts")).unwrap();
        assert_eq!(resolved, HostSpecifier::File(PathBuf::from("/srv/app/shared/data.json")));
    }

    #[test]
    fn test_bare_specifiers_are_registered_names() {
        let realm = HostRealm::empty();
        let resolved = realm.resolve("path", Path::new("/")).unwrap();
        assert_eq!(resolved, HostSpecifier::Registered("path".into()));
    }

    #[tokio::test]
    async fn test_unknown_module_fails() {
        let realm = HostRealm::empty();
        let err = realm
            .import(&HostSpecifier::Registered("left-pad".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Cannot find host module"));
    }

    #[tokio::test]
    async fn test_provider_returning_none_resolves_to_nothing() {
        let realm = HostRealm::empty();
        realm.register_provider("ghost", || -> Result<Option<HostModule>> { Ok(None) });
        let module = realm
            .import(&HostSpecifier::Registered("ghost".into()))
            .await
            .unwrap();
        assert!(module.is_none());
    }

    #[tokio::test]
    async fn test_json_file_module_exports_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"name":"demo","port":8080}"#).unwrap();

        let realm = HostRealm::empty();
        let module = realm
            .import(&HostSpecifier::File(path))
            .await
            .unwrap()
            .unwrap();

        let names: Vec<String> = module.exports().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["default", "name", "port"]);
    }

    #[test]
    fn test_require_rejects_script_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("helper.js"), "export default 1;").unwrap();

        let realm = HostRealm::empty();
        let err = realm.require("./helper.js", dir.path()).unwrap_err();
        assert!(err.to_string().contains("only imports .json and .txt"));
    }

    #[test]
    fn test_modules_are_cached_per_resolution() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let realm = HostRealm::empty();
        let first = realm.require("./notes.txt", dir.path()).unwrap();
        let second = realm.require("./notes.txt", dir.path()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_host_module_set_replaces_in_place() {
        let module = HostModule::new()
            .with_export("a", json!(1))
            .with_export("b", json!(2));
        module.set("a", json!(10));

        let exports = module.exports();
        assert_eq!(exports[0].0, "a");
        assert!(matches!(&exports[0].1, HostValue::Data(v) if *v == json!(10)));
        assert!(!module.has_default());
    }

    #[test]
    fn test_globals_redefinition_keeps_position() {
        let mut globals = HostGlobals::empty();
        globals.define_value("first", json!(1)).define_value("second", json!(2));
        globals.define_value("first", json!(3));

        let names: Vec<&str> = globals.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_standard_globals_share_web_platform() {
        let globals = HostGlobals::standard();
        for name in ["setTimeout", "URL", "TextEncoder", "atob", "crypto", "structuredClone"] {
            let global = globals.get(name).unwrap();
            assert_eq!(global.capability, Capability::Shared);
            assert!(!global.descriptor.enumerable);
        }
        assert_eq!(globals.get("process").unwrap().capability, Capability::ProcessControl);
    }
}
