//! Module linker: every import of a sandboxed module is resolved in the host
//! realm and surfaces in the sandbox as a synthetic module.
//!
//! Nothing from disk is ever compiled inside the realm except the main module.
//! Host modules are snapshotted into an [`ExportTable`] at link time and the
//! synthetic module copies its bindings out of that table once, when it is
//! evaluated.

use crate::error::SandboxError;
use crate::host::{HostModule, HostRealm, HostSpecifier, HostValue};
use crate::realm::SharedTable;
use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};
use futures::FutureExt;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use url::form_urlencoded;

/// Symbol registry key of the realm's link bridge.
pub const LINK_KEY: &str = "realm-sandbox.link";

/// URL scheme of synthetic modules.
const HOST_SCHEME: &str = "host";

/// Immutable snapshot of a host module's exports, taken at link time.
///
/// This is not a live view: later [`HostModule::set`] calls are not seen by
/// modules that were already linked.
#[derive(Debug)]
pub struct ExportTable {
    entries: Vec<(String, HostValue)>,
}

impl ExportTable {
    /// `default` first if present, then every other export in insertion order.
    pub fn snapshot(module: &HostModule) -> Self {
        let mut entries = module.exports();
        if let Some(pos) = entries.iter().position(|(name, _)| name == "default") {
            let default = entries.remove(pos);
            entries.insert(0, default);
        }
        Self { entries }
    }

    /// The synthetic export set.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn entries(&self) -> &[(String, HostValue)] {
        &self.entries
    }
}

fn js_string(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

/// Source text of the synthetic module for the export table registered as `id`.
pub fn synthetic_source(id: u32, table: &ExportTable) -> String {
    let mut src = format!(
        "const ns = globalThis[Symbol.for({})]({});\n",
        js_string(LINK_KEY),
        id
    );
    for (index, name) in table.names().into_iter().enumerate() {
        if name == "default" {
            src.push_str("export default ns[\"default\"];\n");
            continue;
        }
        let literal = js_string(name);
        // writeln! into a String cannot fail
        let _ = writeln!(src, "const e{index} = ns[{literal}];");
        let _ = writeln!(src, "export {{ e{index} as {literal} }};");
    }
    src
}

/// Loader that sends every import through the host realm.
pub struct HostModuleLoader {
    host: HostRealm,
    base_dir: PathBuf,
    main: ModuleSpecifier,
    main_source: String,
    table: SharedTable,
    resolved: RefCell<HashMap<ModuleSpecifier, (String, HostSpecifier)>>,
    failure: Rc<RefCell<Option<SandboxError>>>,
}

impl HostModuleLoader {
    pub(crate) fn new(
        host: HostRealm,
        main: ModuleSpecifier,
        main_source: String,
        base_dir: PathBuf,
        table: SharedTable,
    ) -> Self {
        Self {
            host,
            base_dir,
            main,
            main_source,
            table,
            resolved: RefCell::new(HashMap::new()),
            failure: Rc::new(RefCell::new(None)),
        }
    }

    /// First link failure recorded since the last call.
    pub(crate) fn failure_slot(&self) -> Rc<RefCell<Option<SandboxError>>> {
        self.failure.clone()
    }

    fn record(failure: &RefCell<Option<SandboxError>>, specifier: &str, message: String) {
        let mut slot = failure.borrow_mut();
        if slot.is_none() {
            *slot = Some(SandboxError::Link {
                specifier: specifier.to_string(),
                message,
            });
        }
    }

    fn host_url(resolved: &HostSpecifier) -> Result<ModuleSpecifier, Error> {
        let key: String = form_urlencoded::byte_serialize(resolved.cache_key().as_bytes()).collect();
        ModuleSpecifier::parse(&format!("{}:{}", HOST_SCHEME, key))
            .map_err(|e| anyhow!("Failed to build module URL for '{}': {}", resolved, e))
    }
}

impl ModuleLoader for HostModuleLoader {
    fn resolve(
        &self,
        specifier: &str,
        _referrer: &str,
        kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        if matches!(kind, ResolutionKind::MainModule) {
            return ModuleSpecifier::parse(specifier)
                .map_err(|e| anyhow!("Invalid main module '{}': {}", specifier, e));
        }

        let resolved = match self.host.resolve(specifier, &self.base_dir) {
            Ok(resolved) => resolved,
            Err(e) => {
                Self::record(&self.failure, specifier, e.to_string());
                return Err(e);
            }
        };
        let url = Self::host_url(&resolved)?;
        tracing::debug!(specifier, resolved = %resolved, "resolved import in host realm");
        self.resolved
            .borrow_mut()
            .insert(url.clone(), (specifier.to_string(), resolved));
        Ok(url)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let url = module_specifier.clone();

        if url == self.main {
            return ModuleLoadResponse::Sync(Ok(ModuleSource::new(
                ModuleType::JavaScript,
                ModuleSourceCode::String(self.main_source.clone().into()),
                &url,
                None,
            )));
        }

        let Some((specifier, resolved)) = self.resolved.borrow().get(&url).cloned() else {
            return ModuleLoadResponse::Sync(Err(anyhow!("Module was not resolved by the host realm: {}", url)));
        };

        let host = self.host.clone();
        let table = self.table.clone();
        let failure = self.failure.clone();

        let fut = async move {
            let module = match host.import(&resolved).await {
                Ok(Some(module)) => module,
                Ok(None) => {
                    let message = format!("'{}' resolved to nothing in the host realm", resolved);
                    Self::record(&failure, &specifier, message.clone());
                    return Err(anyhow!(message));
                }
                Err(e) => {
                    Self::record(&failure, &specifier, e.to_string());
                    return Err(e);
                }
            };

            let exports = Arc::new(ExportTable::snapshot(&module));
            tracing::debug!(specifier = %specifier, exports = ?exports.names(), "linked host module");
            let id = table.borrow_mut().register_exports(exports.clone());
            let code = synthetic_source(id, &exports);

            Ok(ModuleSource::new(
                ModuleType::JavaScript,
                ModuleSourceCode::String(code.into()),
                &url,
                None,
            ))
        };

        ModuleLoadResponse::Async(fut.boxed_local())
    }
}
