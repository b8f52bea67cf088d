//! Execution facade: construct, initialize, run, destroy.

use crate::capability;
use crate::config::SandboxConfig;
use crate::error::{ErrorCallback, Result, SandboxError};
use crate::host::{HostGlobals, HostRealm};
use crate::ops::{ConsoleOutput, Settlement};
use crate::realm::RealmFactory;
use crate::routing::{self, CallKind, Disposition, RoutingScope, UncaughtKind};
use crate::runtime::{Evaluation, RealmHandle, RealmSetup, Uncaught};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

type WeakCallback = Weak<dyn Fn(&SandboxError) + Send + Sync>;

/// Where a sandbox is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Constructed,
    Evaluated,
    EvaluationFailed,
    LinkFailed,
    Destroyed,
}

/// Builder for [`Sandbox`] with a custom host environment.
pub struct SandboxBuilder {
    filepath: PathBuf,
    insulation: bool,
    config: Option<SandboxConfig>,
    globals: Option<HostGlobals>,
    host: Option<HostRealm>,
}

impl SandboxBuilder {
    pub fn insulation(mut self, insulation: bool) -> Self {
        self.insulation = insulation;
        self
    }

    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Host global table the realm is cloned from.
    pub fn globals(mut self, globals: HostGlobals) -> Self {
        self.globals = Some(globals);
        self
    }

    /// Host realm imports are resolved against.
    pub fn host_realm(mut self, host: HostRealm) -> Self {
        self.host = Some(host);
        self
    }

    pub fn build(self) -> Result<Sandbox> {
        if !capability::module_realms_enabled() {
            return Err(SandboxError::CapabilityUnavailable);
        }
        if self.filepath.as_os_str().is_empty() {
            return Err(SandboxError::MissingPath);
        }
        if !self.filepath.is_file() {
            return Err(SandboxError::FileNotFound(self.filepath));
        }
        let filepath = self
            .filepath
            .canonicalize()
            .map_err(|_| SandboxError::FileNotFound(self.filepath.clone()))?;

        Ok(Sandbox {
            filepath,
            insulation: self.insulation,
            config: self.config.unwrap_or_default(),
            factory: RealmFactory::new(self.globals.unwrap_or_else(HostGlobals::standard)),
            host: self.host.unwrap_or_else(HostRealm::standard),
            realm: None,
            state: Lifecycle::Constructed,
            pending_callback: None,
        })
    }
}

/// One sandboxed ES module and the realm it runs in.
///
/// # Example
///
/// ```rust,ignore
/// use realm_sandbox::{enable_module_realms, Sandbox};
///
/// enable_module_realms();
/// let mut sandbox = Sandbox::new("./plugins/greet.js")?;
/// sandbox.initialize(None).await?;
/// let greeting = sandbox.run(None, "greet", vec!["world".into()]).await?;
/// sandbox.destroy().await;
/// ```
pub struct Sandbox {
    filepath: PathBuf,
    insulation: bool,
    config: SandboxConfig,
    factory: RealmFactory,
    host: HostRealm,
    realm: Option<RealmHandle>,
    state: Lifecycle,
    pending_callback: Option<WeakCallback>,
}

impl Sandbox {
    /// Insulated sandbox with the standard host environment.
    pub fn new(filepath: impl AsRef<Path>) -> Result<Self> {
        Self::builder(filepath).build()
    }

    pub fn with_insulation(filepath: impl AsRef<Path>, insulation: bool) -> Result<Self> {
        Self::builder(filepath).insulation(insulation).build()
    }

    pub fn builder(filepath: impl AsRef<Path>) -> SandboxBuilder {
        SandboxBuilder {
            filepath: filepath.as_ref().to_path_buf(),
            insulation: true,
            config: None,
            globals: None,
            host: None,
        }
    }

    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    pub fn insulation(&self) -> bool {
        self.insulation
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    /// Build the realm, then link and evaluate the module.
    ///
    /// Returns `Ok(true)` when evaluation completed and `Ok(false)` when it
    /// threw and the error went to `callback`. Link and compile failures are
    /// always returned.
    pub async fn initialize(&mut self, callback: Option<ErrorCallback>) -> Result<bool> {
        match self.state {
            Lifecycle::Constructed => {}
            Lifecycle::Destroyed => return Err(SandboxError::Destroyed),
            _ => return Err(SandboxError::AlreadyInitialized),
        }

        self.pending_callback = callback.as_ref().map(Arc::downgrade);
        let scope = RoutingScope::enter(CallKind::Initialize, callback);
        tracing::info!(file = %self.filepath.display(), insulation = self.insulation, "initializing sandbox");

        let source = tokio::fs::read_to_string(&self.filepath)
            .await
            .map_err(|e| SandboxError::Io {
                path: self.filepath.clone(),
                message: e.to_string(),
            })?;

        let setup = RealmSetup {
            filepath: self.filepath.clone(),
            source,
            bindings: self.factory.create(self.insulation),
            host: self.host.clone(),
            config: self.config.clone(),
        };

        let (realm, report) = match RealmHandle::spawn(setup).await {
            Ok(started) => started,
            Err(e) => {
                if matches!(e, SandboxError::Link { .. } | SandboxError::Compile { .. }) {
                    self.state = Lifecycle::LinkFailed;
                }
                tracing::warn!(error = %e, "sandbox failed to link");
                return Err(e);
            }
        };

        route_uncaught(&scope, report.uncaught);

        match report.value {
            Evaluation::Completed => {
                self.realm = Some(realm);
                self.state = Lifecycle::Evaluated;
                tracing::info!(file = %self.filepath.display(), "sandbox evaluated");
                Ok(true)
            }
            Evaluation::Threw { message } => {
                realm.shutdown().await;
                self.state = Lifecycle::EvaluationFailed;
                let err = SandboxError::Evaluation { message };
                match routing::dispatch(UncaughtKind::Exception, scope.origin(), &err) {
                    Disposition::Delivered => Ok(false),
                    _ => Err(err),
                }
            }
        }
    }

    /// Call an exported function by name.
    ///
    /// Without an explicit `callback`, the one given to `initialize` is used
    /// if it is still alive.
    pub async fn run(
        &self,
        callback: Option<ErrorCallback>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let realm = match (self.state, &self.realm) {
            (Lifecycle::Destroyed, _) => return Err(SandboxError::Destroyed),
            (Lifecycle::Evaluated, Some(realm)) => realm,
            _ => return Err(SandboxError::NotEvaluated),
        };

        let callback = callback.or_else(|| self.pending_callback.as_ref().and_then(Weak::upgrade));
        let scope = RoutingScope::enter(CallKind::Run, callback);
        tracing::info!(function = name, "running sandboxed function");

        let report = realm.invoke(name, args).await?;
        route_uncaught(&scope, report.uncaught);

        let err = match report.value {
            Settlement::Returned { value } => return Ok(value),
            Settlement::Missing => SandboxError::FunctionNotFound {
                name: name.to_string(),
            },
            Settlement::Threw { message } => SandboxError::Invocation { message },
        };

        match scope.callback() {
            Some(callback) => {
                tracing::debug!(function = name, error = %err, "delivering to error callback");
                callback(&err);
                Ok(Value::Null)
            }
            None => Err(err),
        }
    }

    /// Release the realm. The instance is inert afterwards.
    pub async fn destroy(&mut self) -> bool {
        if let Some(realm) = self.realm.take() {
            realm.shutdown().await;
        }
        self.pending_callback = None;
        if self.state != Lifecycle::Destroyed {
            tracing::info!(file = %self.filepath.display(), "sandbox destroyed");
        }
        self.state = Lifecycle::Destroyed;
        true
    }

    /// Initialize if needed, then run `main` if it is exported. Without a
    /// `main`, the sandbox is destroyed and `true` is returned.
    pub async fn execute(&mut self, callback: Option<ErrorCallback>, args: Vec<Value>) -> Result<Value> {
        if self.state == Lifecycle::Destroyed {
            return Err(SandboxError::Destroyed);
        }
        if self.state == Lifecycle::Constructed {
            self.initialize(callback.clone()).await?;
        }

        let has_main = match (&self.realm, self.state) {
            (Some(realm), Lifecycle::Evaluated) => realm.has_export("main").await?,
            _ => false,
        };

        if has_main {
            self.run(callback, "main", args).await
        } else {
            self.destroy().await;
            Ok(Value::Bool(true))
        }
    }

    /// Drain the console output captured since the last call.
    pub async fn take_console(&self) -> Result<ConsoleOutput> {
        match (&self.realm, self.state) {
            (_, Lifecycle::Destroyed) => Err(SandboxError::Destroyed),
            (Some(realm), _) => realm.take_console().await,
            (None, _) => Ok(ConsoleOutput::default()),
        }
    }
}

fn route_uncaught(scope: &RoutingScope, uncaught: Vec<Uncaught>) {
    for stray in uncaught {
        let kind = stray.kind;
        routing::dispatch(kind, scope.origin(), &stray.into_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_construct_validates_path() {
        capability::enable_module_realms();

        assert_eq!(Sandbox::new("").err(), Some(SandboxError::MissingPath));

        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.js");
        assert_eq!(
            Sandbox::new(&missing).err(),
            Some(SandboxError::FileNotFound(missing))
        );

        // A directory is not a file
        assert!(matches!(
            Sandbox::new(dir.path()).err(),
            Some(SandboxError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_builder_defaults_to_insulated() {
        capability::enable_module_realms();
        let dir = tempdir().unwrap();
        let file = dir.path().join("mod.js");
        fs::write(&file, "export const x = 1;").unwrap();

        let sandbox = Sandbox::new(&file).unwrap();
        assert!(sandbox.insulation());
        assert_eq!(sandbox.state(), Lifecycle::Constructed);
        assert!(sandbox.filepath().is_absolute());

        let open = Sandbox::with_insulation(&file, false).unwrap();
        assert!(!open.insulation());
    }

    #[tokio::test]
    async fn test_run_before_initialize_fails() {
        capability::enable_module_realms();
        let dir = tempdir().unwrap();
        let file = dir.path().join("mod.js");
        fs::write(&file, "export const x = 1;").unwrap();

        let mut sandbox = Sandbox::new(&file).unwrap();
        let err = sandbox.run(None, "x", vec![]).await.unwrap_err();
        assert_eq!(err, SandboxError::NotEvaluated);

        assert!(sandbox.destroy().await);
        let err = sandbox.run(None, "x", vec![]).await.unwrap_err();
        assert_eq!(err, SandboxError::Destroyed);
        assert_eq!(sandbox.initialize(None).await.unwrap_err(), SandboxError::Destroyed);
    }
}
