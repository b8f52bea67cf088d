//! Ops exposed to the realm's bootstrap code, and the extension bundling them.
//!
//! Everything crosses the boundary as JSON text. The bootstrap closes over
//! these ops and then removes `Deno` from the realm, so sandboxed code can
//! only reach them through the bindings it was given.

use crate::fetch::op_realm_fetch;
use crate::host::{HostFunction, HostRealm};
use crate::realm::{SharedTable, WireValue};
use crate::web::{
    op_web_atob, op_web_btoa, op_web_digest, op_web_get_random_values, op_web_random_uuid,
    op_web_url_parse, op_web_url_set,
};
use deno_core::error::AnyError;
use deno_core::{op2, OpState};
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

// ============================================================================
// Console Output Capture
// ============================================================================

/// Captured console output from the sandboxed realm
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

impl ConsoleOutput {
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.warns.is_empty() && self.errors.is_empty()
    }
}

/// Mirror console output to stderr as it is captured.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleEcho(pub bool);

fn echo(state: &OpState, level: &str, msg: &str) {
    if state.try_borrow::<ConsoleEcho>().is_some_and(|e| e.0) {
        eprintln!("[{}] {}", level, msg);
    }
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    tracing::debug!(target: "realm_sandbox::console", "{}", msg);
    echo(state, "LOG", msg);
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.logs.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    tracing::warn!(target: "realm_sandbox::console", "{}", msg);
    echo(state, "WARN", msg);
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.warns.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    tracing::error!(target: "realm_sandbox::console", "{}", msg);
    echo(state, "ERROR", msg);
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.errors.push(msg.to_string());
    }
}

// ============================================================================
// Host Calls
// ============================================================================

fn lookup(state: &OpState, id: u32) -> Result<HostFunction, AnyError> {
    state
        .borrow::<SharedTable>()
        .borrow()
        .function(id)
        .ok_or_else(|| anyhow::anyhow!("Unknown host function #{}", id))
}

fn parse_args(args: &str) -> Result<Vec<Value>, AnyError> {
    serde_json::from_str(args).map_err(|e| anyhow::anyhow!("Invalid host call arguments: {}", e))
}

#[op2]
#[string]
pub fn op_realm_host_call(
    state: &mut OpState,
    id: u32,
    #[string] args: String,
) -> Result<String, AnyError> {
    let args = parse_args(&args)?;
    let value = match lookup(state, id)? {
        HostFunction::Sync(f) => f(args)?,
        HostFunction::Async(_) => {
            return Err(anyhow::anyhow!("Host function #{} is async", id));
        }
    };
    Ok(serde_json::to_string(&value)?)
}

#[op2(async)]
#[string]
pub async fn op_realm_host_call_async(
    state: Rc<RefCell<OpState>>,
    id: u32,
    #[string] args: String,
) -> Result<String, AnyError> {
    let args = parse_args(&args)?;
    let function = lookup(&state.borrow(), id)?;
    let value = match function {
        HostFunction::Async(f) => f(args).await?,
        HostFunction::Sync(f) => f(args)?,
    };
    Ok(serde_json::to_string(&value)?)
}

// ============================================================================
// Host Modules
// ============================================================================

/// What `require` resolves against.
#[derive(Clone)]
pub struct RequireContext {
    pub host: HostRealm,
    pub base_dir: PathBuf,
}

/// Synchronous host import for the `require` binding. Returns the module's
/// exports in wire form.
#[op2]
#[string]
pub fn op_realm_require(state: &mut OpState, #[string] specifier: String) -> Result<String, AnyError> {
    let context = state.borrow::<RequireContext>().clone();
    let module = context.host.require(&specifier, &context.base_dir)?;
    let exports = crate::linker::ExportTable::snapshot(&module);
    let wire: Vec<(String, WireValue)> = state.borrow::<SharedTable>().borrow_mut().wire_exports(&exports);
    tracing::debug!(specifier = %specifier, "required host module");
    Ok(serde_json::to_string(&wire)?)
}

/// Exports of a linked synthetic module, read once when it evaluates.
#[op2]
#[string]
pub fn op_realm_module_exports(state: &mut OpState, id: u32) -> Result<String, AnyError> {
    let table = state.borrow::<SharedTable>().clone();
    let exports = table
        .borrow()
        .exports(id)
        .ok_or_else(|| anyhow::anyhow!("Unknown export table #{}", id))?;
    let wire = table.borrow_mut().wire_exports(&exports);
    Ok(serde_json::to_string(&wire)?)
}

// ============================================================================
// Invocation Results
// ============================================================================

/// How an invoked sandboxed function finished.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Settlement {
    Returned {
        #[serde(default)]
        value: Value,
    },
    Threw {
        message: String,
    },
    Missing,
}

#[op2(fast)]
pub fn op_realm_settle(state: &mut OpState, #[string] settlement: &str) -> Result<(), AnyError> {
    let settlement: Settlement = serde_json::from_str(settlement)
        .map_err(|e| anyhow::anyhow!("Invalid settlement: {}", e))?;
    state.put(settlement);
    Ok(())
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    sandbox_realm,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_realm_host_call,
        op_realm_host_call_async,
        op_realm_require,
        op_realm_module_exports,
        op_realm_settle,
        op_realm_fetch,
        op_web_random_uuid,
        op_web_get_random_values,
        op_web_digest,
        op_web_btoa,
        op_web_atob,
        op_web_url_parse,
        op_web_url_set,
    ],
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settlement_wire_format() {
        let returned: Settlement = serde_json::from_str(r#"{"status":"returned","value":[1,2]}"#).unwrap();
        assert_eq!(returned, Settlement::Returned { value: json!([1, 2]) });

        let missing: Settlement = serde_json::from_str(r#"{"status":"missing"}"#).unwrap();
        assert_eq!(missing, Settlement::Missing);

        let threw: Settlement = serde_json::from_str(r#"{"status":"threw","message":"Error: x"}"#).unwrap();
        assert_eq!(threw, Settlement::Threw { message: "Error: x".into() });
    }

    #[test]
    fn test_returned_without_value_is_null() {
        let returned: Settlement = serde_json::from_str(r#"{"status":"returned"}"#).unwrap();
        assert_eq!(returned, Settlement::Returned { value: Value::Null });
    }

    #[test]
    fn test_console_output_empty() {
        let mut output = ConsoleOutput::default();
        assert!(output.is_empty());
        output.warns.push("careful".into());
        assert!(!output.is_empty());
    }
}
