//! Realm factory: turns the host's global table into the binding set of a new realm.
//!
//! Nothing is copied and then deleted. Each insulation mode has an explicit
//! allow-list of capabilities, and only host globals whose capability is on
//! the list make it into the set.

use crate::host::{HostFunction, HostGlobals, HostValue, NativeBinding, PropertyDescriptor, Slot};
use crate::linker::ExportTable;
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::Arc;

/// Name under which the host module loader is injected.
///
/// `require` is the host's loader, not the sandboxed module's: relative
/// specifiers resolve against [`SandboxConfig::host_base_dir`], the same way
/// for every sandbox regardless of where its file lives. Static and dynamic
/// `import` belong to the sandboxed module and resolve against its own
/// directory.
///
/// [`SandboxConfig::host_base_dir`]: crate::config::SandboxConfig::host_base_dir
pub const REQUIRE_BINDING: &str = "require";

/// Engine globals that are not part of the host table and are removed from
/// every realm before user code runs.
pub const REMOVED_ENGINE_GLOBALS: &[&str] = &["Deno"];

/// What a host global grants to the code that can see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Harmless to share with any realm (console, fetch, plain data).
    Shared,
    /// Exit, signals, environment: the `process` object.
    ProcessControl,
    /// The injected `require` host module loader.
    ModuleLoader,
}

/// Allow-list of capabilities for one realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    allowed: BTreeSet<Capability>,
}

impl CapabilitySet {
    pub fn for_insulation(insulated: bool) -> Self {
        let mut allowed = BTreeSet::from([Capability::Shared, Capability::ModuleLoader]);
        if !insulated {
            allowed.insert(Capability::ProcessControl);
        }
        Self { allowed }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.allowed.contains(&capability)
    }
}

/// The global bindings of one realm, in installation order.
///
/// Each call to [`RealmFactory::create`] yields a fresh set; sets are never
/// shared between sandboxes.
#[derive(Debug, Clone)]
pub struct BindingSet {
    entries: Vec<(String, PropertyDescriptor)>,
    capabilities: CapabilitySet,
}

impl BindingSet {
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub(crate) fn to_wire(&self, table: &mut RealmTable) -> Vec<(String, WireDescriptor)> {
        self.entries
            .iter()
            .map(|(name, descriptor)| (name.clone(), table.wire_descriptor(descriptor)))
            .collect()
    }
}

/// Builds binding sets from the host's global table.
#[derive(Debug, Clone)]
pub struct RealmFactory {
    globals: Arc<HostGlobals>,
}

impl RealmFactory {
    pub fn new(globals: HostGlobals) -> Self {
        Self {
            globals: Arc::new(globals),
        }
    }

    /// Duplicate every allowed host descriptor, then inject `require`.
    pub fn create(&self, insulation: bool) -> BindingSet {
        let capabilities = CapabilitySet::for_insulation(insulation);

        let mut entries: Vec<(String, PropertyDescriptor)> = self
            .globals
            .iter()
            .filter(|global| {
                let allowed = capabilities.allows(global.capability);
                if !allowed {
                    tracing::debug!(global = %global.name, "withheld from insulated realm");
                }
                allowed
            })
            .map(|global| (global.name.clone(), global.descriptor.clone()))
            .collect();

        if capabilities.allows(Capability::ModuleLoader) {
            entries.retain(|(name, _)| name != REQUIRE_BINDING);
            entries.push((
                REQUIRE_BINDING.to_string(),
                PropertyDescriptor::value(HostValue::Native(NativeBinding::Require)),
            ));
        }

        BindingSet {
            entries,
            capabilities,
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

/// How a host value travels into the realm's bootstrap code.
///
/// Functions travel as ids into the realm's [`RealmTable`]; the realm calls
/// them back through ops.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireValue {
    Data { value: Value },
    Function { id: u32, is_async: bool },
    Object { properties: Vec<(String, WireDescriptor)> },
    Native { native: NativeBinding },
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireDescriptor {
    Value {
        value: WireValue,
        writable: bool,
        enumerable: bool,
        configurable: bool,
    },
    Accessor {
        get: Option<u32>,
        set: Option<u32>,
        enumerable: bool,
        configurable: bool,
    },
}

/// Per-realm registry of everything the realm may call back into.
///
/// Ops only dispatch to ids registered here, so a realm can never reach a
/// host function that was not placed in its binding set or linked into it.
#[derive(Debug, Default)]
pub struct RealmTable {
    functions: Vec<HostFunction>,
    exports: Vec<Arc<ExportTable>>,
}

pub(crate) type SharedTable = Rc<RefCell<RealmTable>>;

impl RealmTable {
    pub fn register_function(&mut self, function: HostFunction) -> u32 {
        self.functions.push(function);
        (self.functions.len() - 1) as u32
    }

    pub fn function(&self, id: u32) -> Option<HostFunction> {
        self.functions.get(id as usize).cloned()
    }

    pub fn register_exports(&mut self, exports: Arc<ExportTable>) -> u32 {
        self.exports.push(exports);
        (self.exports.len() - 1) as u32
    }

    pub fn exports(&self, id: u32) -> Option<Arc<ExportTable>> {
        self.exports.get(id as usize).cloned()
    }

    pub fn wire_value(&mut self, value: &HostValue) -> WireValue {
        match value {
            HostValue::Data(value) => WireValue::Data {
                value: value.clone(),
            },
            HostValue::Function(function) => WireValue::Function {
                is_async: function.is_async(),
                id: self.register_function(function.clone()),
            },
            HostValue::Object(properties) => WireValue::Object {
                properties: properties
                    .iter()
                    .map(|(name, descriptor)| (name.clone(), self.wire_descriptor(descriptor)))
                    .collect(),
            },
            HostValue::Native(native) => WireValue::Native { native: *native },
        }
    }

    pub fn wire_descriptor(&mut self, descriptor: &PropertyDescriptor) -> WireDescriptor {
        match &descriptor.slot {
            Slot::Value { value, writable } => WireDescriptor::Value {
                value: self.wire_value(value),
                writable: *writable,
                enumerable: descriptor.enumerable,
                configurable: descriptor.configurable,
            },
            Slot::Accessor { get, set } => WireDescriptor::Accessor {
                get: get.clone().map(|f| self.register_function(f)),
                set: set.clone().map(|f| self.register_function(f)),
                enumerable: descriptor.enumerable,
                configurable: descriptor.configurable,
            },
        }
    }

    pub fn wire_exports(&mut self, exports: &ExportTable) -> Vec<(String, WireValue)> {
        exports
            .entries()
            .iter()
            .map(|(name, value)| (name.clone(), self.wire_value(value)))
            .collect()
    }
}
