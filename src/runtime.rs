//! Realm worker - owns one sandboxed JsRuntime.
//!
//! V8 isolates are `!Send` and must be dropped in reverse creation order on
//! the thread that made them, so every realm lives on a dedicated thread with
//! its own current-thread tokio runtime. [`RealmHandle`] is the `Send` side:
//! it talks to the worker over channels.

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::fetch::FetchPolicy;
use crate::host::HostRealm;
use crate::linker::{HostModuleLoader, LINK_KEY};
use crate::ops::{sandbox_realm, ConsoleEcho, ConsoleOutput, RequireContext, Settlement};
use crate::realm::{BindingSet, RealmTable, SharedTable, REMOVED_ENGINE_GLOBALS};
use crate::routing::UncaughtKind;
use deno_core::{v8, JsRuntime, ModuleSpecifier, PollEventLoopOptions, RuntimeOptions};
use futures::FutureExt;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tokio::sync::{mpsc, oneshot};

const BOOTSTRAP: &str = include_str!("bootstrap.js");

/// Stray errors collected per evaluation or invocation before the worker
/// stops draining the event loop.
const MAX_UNCAUGHT_PER_CALL: usize = 16;

fn unavailable(e: impl Display) -> SandboxError {
    SandboxError::RealmUnavailable(e.to_string())
}

/// Everything a worker needs to build, link and evaluate one realm.
pub struct RealmSetup {
    /// Canonical path of the sandboxed module
    pub filepath: PathBuf,
    pub source: String,
    pub bindings: BindingSet,
    pub host: HostRealm,
    pub config: SandboxConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Completed,
    Threw { message: String },
}

/// An error that surfaced from the event loop rather than from the call
/// itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uncaught {
    pub kind: UncaughtKind,
    pub message: String,
}

impl Uncaught {
    /// Classify an error the event loop surfaced.
    fn from_loop_error(e: &deno_core::error::AnyError) -> Self {
        let message = e.to_string();
        let kind = if message.contains("(in promise)") {
            UncaughtKind::Rejection
        } else {
            UncaughtKind::Exception
        };
        Self { kind, message }
    }

    pub fn into_error(self) -> SandboxError {
        match self.kind {
            UncaughtKind::Exception => SandboxError::UncaughtException { message: self.message },
            UncaughtKind::Rejection => SandboxError::UncaughtRejection { message: self.message },
        }
    }
}

/// A call's result together with the stray errors it produced.
#[derive(Debug)]
pub struct Report<T> {
    pub value: T,
    pub uncaught: Vec<Uncaught>,
}

enum Command {
    Invoke {
        name: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<Report<Settlement>>>,
    },
    HasExport {
        name: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    TakeConsole {
        reply: oneshot::Sender<ConsoleOutput>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running realm worker. Dropping it shuts the worker down.
#[derive(Debug)]
pub struct RealmHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl RealmHandle {
    /// Start a worker, then link and evaluate the module inside it.
    ///
    /// Link and compile failures are returned as errors and the worker exits.
    /// An evaluation that throws still yields a handle; the report says so.
    pub async fn spawn(setup: RealmSetup) -> Result<(Self, Report<Evaluation>)> {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("realm-sandbox-worker".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        if ready_tx.send(Err(unavailable(e))).is_err() {
                            tracing::warn!("realm startup receiver dropped");
                        }
                        return;
                    }
                };
                rt.block_on(serve(setup, ready_tx, inbox));
            })
            .map_err(unavailable)?;

        let report = ready_rx
            .await
            .map_err(|_| unavailable("realm worker exited during startup"))??;

        Ok((Self { commands }, report))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| unavailable("realm worker is gone"))?;
        response
            .await
            .map_err(|_| unavailable("realm worker dropped the request"))
    }

    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Report<Settlement>> {
        let name = name.to_string();
        self.request(|reply| Command::Invoke { name, args, reply }).await?
    }

    /// Whether the namespace has a truthy export called `name`.
    pub async fn has_export(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.request(|reply| Command::HasExport { name, reply }).await?
    }

    pub async fn take_console(&self) -> Result<ConsoleOutput> {
        self.request(|reply| Command::TakeConsole { reply }).await
    }

    /// Release the realm and wait until the isolate is gone.
    pub async fn shutdown(self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            tracing::debug!("realm worker already stopped");
        }
    }
}

async fn serve(
    setup: RealmSetup,
    ready: oneshot::Sender<Result<Report<Evaluation>>>,
    mut inbox: mpsc::UnboundedReceiver<Command>,
) {
    let mut realm = match Realm::start(setup).await {
        Ok((realm, report)) => {
            if ready.send(Ok(report)).is_err() {
                tracing::warn!("realm startup receiver dropped");
                realm.release();
                return;
            }
            realm
        }
        Err(e) => {
            if ready.send(Err(e)).is_err() {
                tracing::warn!("realm startup receiver dropped");
            }
            return;
        }
    };

    let mut shutdown = None;
    while let Some(command) = inbox.recv().await {
        match command {
            Command::Invoke { name, args, reply } => {
                let result = realm.invoke(&name, args).await;
                if reply.send(result).is_err() {
                    tracing::warn!(function = %name, "invocation receiver dropped");
                }
            }
            Command::HasExport { name, reply } => {
                if reply.send(realm.has_export(&name)).is_err() {
                    tracing::warn!("lookup receiver dropped");
                }
            }
            Command::TakeConsole { reply } => {
                if reply.send(realm.take_console()).is_err() {
                    tracing::warn!("console receiver dropped");
                }
            }
            Command::Shutdown { reply } => {
                shutdown = Some(reply);
                break;
            }
        }
    }

    realm.release();
    if let Some(reply) = shutdown {
        if reply.send(()).is_err() {
            tracing::debug!("shutdown receiver dropped");
        }
    }
}

// ============================================================================
// Worker side
// ============================================================================

// Globals are declared before the runtime so they drop first.
struct Realm {
    invoker: v8::Global<v8::Function>,
    namespace: Option<v8::Global<v8::Object>>,
    runtime: JsRuntime,
}

impl Realm {
    async fn start(setup: RealmSetup) -> Result<(Self, Report<Evaluation>)> {
        let RealmSetup {
            filepath,
            source,
            bindings,
            host,
            config,
        } = setup;

        let main = ModuleSpecifier::from_file_path(&filepath).map_err(|_| {
            SandboxError::InvalidArgument(format!("not an absolute path: {}", filepath.display()))
        })?;
        let base_dir = filepath.parent().map(Path::to_path_buf).unwrap_or_default();

        let table: SharedTable = Rc::new(RefCell::new(RealmTable::default()));
        let loader = HostModuleLoader::new(host.clone(), main.clone(), source.clone(), base_dir, table.clone());
        let link_failure = loader.failure_slot();

        let mut runtime = JsRuntime::new(RuntimeOptions {
            module_loader: Some(Rc::new(loader)),
            extensions: vec![sandbox_realm::init_ops_and_esm()],
            ..Default::default()
        });

        {
            let state = runtime.op_state();
            let mut state = state.borrow_mut();
            state.put(table.clone());
            state.put(ConsoleOutput::default());
            state.put(ConsoleEcho(config.echo_console));
            state.put(FetchPolicy {
                allowed_origins: config.allowed_origins.clone(),
            });
            state.put(RequireContext {
                host,
                base_dir: config.host_base_dir.clone(),
            });
        }

        let mut realm = Self::bootstrap(runtime, &bindings, &table)?;
        tracing::debug!(module = %main, bindings = ?bindings.names(), "realm created");

        let module_id = match realm.runtime.load_main_es_module_from_code(&main, source).await {
            Ok(id) => id,
            Err(e) => {
                if let Some(link) = link_failure.borrow_mut().take() {
                    return Err(link);
                }
                return Err(SandboxError::Compile {
                    message: e.to_string(),
                });
            }
        };
        link_failure.borrow_mut().take();

        // While evaluation is unresolved, the first event-loop error ends it.
        let evaluation = realm.runtime.mod_evaluate(module_id);
        let drained = realm.runtime.run_event_loop(PollEventLoopOptions::default()).await;
        let mut uncaught = Vec::new();

        let value = match evaluation.now_or_never() {
            Some(Ok(())) => {
                if let Err(e) = drained {
                    uncaught.push(Uncaught::from_loop_error(&e));
                    uncaught.extend(realm.drive().await);
                }
                let namespace = realm
                    .runtime
                    .get_module_namespace(module_id)
                    .map_err(unavailable)?;
                realm.namespace = Some(namespace);
                Evaluation::Completed
            }
            Some(Err(e)) => {
                let message = e.to_string();
                if let Err(stray) = drained {
                    let stray = Uncaught::from_loop_error(&stray);
                    if !stray.message.contains(&message) && !message.contains(&stray.message) {
                        uncaught.push(stray);
                    }
                }
                Evaluation::Threw { message }
            }
            None => Evaluation::Threw {
                message: match drained {
                    Err(e) => format!("module evaluation never settled: {}", e),
                    Ok(()) => "module evaluation never settled: top-level await is still pending".into(),
                },
            },
        };

        Ok((realm, Report { value, uncaught }))
    }

    /// Install the binding set and return the realm's invoker.
    fn bootstrap(mut runtime: JsRuntime, bindings: &BindingSet, table: &SharedTable) -> Result<Self> {
        let wire = bindings.to_wire(&mut table.borrow_mut());
        let script = format!(
            "({})(Deno.core, {}, {}, {})",
            BOOTSTRAP.trim(),
            serde_json::to_string(&wire).map_err(unavailable)?,
            serde_json::to_string(LINK_KEY).map_err(unavailable)?,
            serde_json::to_string(REMOVED_ENGINE_GLOBALS).map_err(unavailable)?,
        );

        let invoker = runtime
            .execute_script("[realm-sandbox:bootstrap]", script)
            .map_err(unavailable)?;

        let invoker = {
            let scope = &mut runtime.handle_scope();
            let local = v8::Local::new(scope, invoker);
            let function = v8::Local::<v8::Function>::try_from(local)
                .map_err(|_| unavailable("realm bootstrap did not return a function"))?;
            v8::Global::new(scope, function)
        };

        Ok(Self {
            runtime,
            invoker,
            namespace: None,
        })
    }

    /// Run the event loop to completion, collecting the errors that surface.
    async fn drive(&mut self) -> Vec<Uncaught> {
        let mut uncaught = Vec::new();
        while let Err(e) = self.runtime.run_event_loop(PollEventLoopOptions::default()).await {
            let stray = Uncaught::from_loop_error(&e);
            tracing::debug!(kind = ?stray.kind, message = %stray.message, "uncaught error in realm");
            uncaught.push(stray);
            if uncaught.len() >= MAX_UNCAUGHT_PER_CALL {
                tracing::warn!("too many uncaught errors, no longer draining event loop");
                break;
            }
        }
        uncaught
    }

    async fn invoke(&mut self, name: &str, args: Vec<Value>) -> Result<Report<Settlement>> {
        let namespace = self.namespace.clone().ok_or(SandboxError::NotEvaluated)?;
        self.runtime.op_state().borrow_mut().try_take::<Settlement>();

        let thrown = {
            let scope = &mut self.runtime.handle_scope();
            let invoker = v8::Local::new(scope, &self.invoker);
            let namespace = v8::Local::new(scope, &namespace);
            let name = v8::String::new(scope, name)
                .ok_or_else(|| unavailable("function name is too long"))?;
            let args = deno_core::serde_v8::to_v8(scope, &args).map_err(unavailable)?;
            let recv: v8::Local<v8::Value> = v8::undefined(scope).into();

            let tc = &mut v8::TryCatch::new(scope);
            match invoker.call(tc, recv, &[namespace.into(), name.into(), args]) {
                Some(_) => None,
                None => {
                    let exception = tc.exception();
                    Some(match exception {
                        Some(exception) => exception.to_rust_string_lossy(tc),
                        None => "execution terminated".to_string(),
                    })
                }
            }
        };

        let uncaught = self.drive().await;

        let value = match thrown {
            Some(message) => Settlement::Threw { message },
            None => self
                .runtime
                .op_state()
                .borrow_mut()
                .try_take::<Settlement>()
                .unwrap_or_else(|| Settlement::Threw {
                    message: "sandboxed function never settled".into(),
                }),
        };

        Ok(Report { value, uncaught })
    }

    fn has_export(&mut self, name: &str) -> Result<bool> {
        let namespace = self.namespace.clone().ok_or(SandboxError::NotEvaluated)?;
        let scope = &mut self.runtime.handle_scope();
        let namespace = v8::Local::new(scope, &namespace);
        let key = v8::String::new(scope, name).ok_or_else(|| unavailable("export name is too long"))?;
        let truthy = match namespace.get(scope, key.into()) {
            Some(value) => value.boolean_value(scope),
            None => false,
        };
        Ok(truthy)
    }

    fn take_console(&mut self) -> ConsoleOutput {
        let state = self.runtime.op_state();
        let mut state = state.borrow_mut();
        let output = state
            .try_borrow_mut::<ConsoleOutput>()
            .map(std::mem::take)
            .unwrap_or_default();
        output
    }

    fn release(self) {
        let Self {
            invoker,
            namespace,
            mut runtime,
        } = self;
        drop(namespace);
        drop(invoker);
        runtime.v8_isolate().low_memory_notification();
        drop(runtime);
        tracing::debug!("realm released");
    }
}
