//! # Realm Sandbox
//!
//! Run an untrusted ES module inside its own V8 realm, sharing almost nothing
//! with the host.
//!
//! ## Guarantees
//!
//! - **Explicit globals**: the realm only sees host globals whose capability is
//!   allowed for its insulation mode. Insulated realms never see `process`.
//! - **Host-linked imports**: every `import` is resolved in the host realm and
//!   appears in the sandbox as a synthetic module holding a link-time snapshot.
//! - **No engine leaks**: `Deno` and the raw ops are removed before user code
//!   runs.
//! - **Routed errors**: uncaught errors from sandboxed code go to the caller's
//!   callback. Without one, the host terminates unless the embedder registered
//!   its own listener.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use realm_sandbox::{enable_module_realms, ErrorCallback, Sandbox};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> realm_sandbox::Result<()> {
//!     enable_module_realms();
//!
//!     let on_error: ErrorCallback = Arc::new(|err| eprintln!("sandbox: {}", err));
//!     let mut sandbox = Sandbox::new("./plugins/render.js")?;
//!     if sandbox.initialize(Some(on_error.clone())).await? {
//!         let html = sandbox
//!             .run(Some(on_error), "render", vec![serde_json::json!({ "page": "home" })])
//!             .await?;
//!         println!("{}", html);
//!     }
//!     sandbox.destroy().await;
//!     Ok(())
//! }
//! ```

pub mod capability;
pub mod config;
pub mod error;
mod fetch;
pub mod host;
pub mod linker;
mod ops;
pub mod realm;
pub mod routing;
mod runtime;
mod sandbox;
mod web;

pub use capability::{enable_module_realms, module_realms_enabled, MODULE_REALMS_FLAG};
pub use config::SandboxConfig;
pub use error::{ErrorCallback, Result, SandboxError};
pub use fetch::FetchPolicy;
pub use host::{HostFunction, HostGlobals, HostModule, HostRealm, HostValue, PropertyDescriptor};
pub use ops::ConsoleOutput;
pub use realm::{BindingSet, Capability, RealmFactory};
pub use sandbox::{Lifecycle, Sandbox, SandboxBuilder};
