//! Error routing channel.
//!
//! Every `initialize()` and `run()` call enters a [`RoutingScope`], which
//! registers a [`RoutingContext`] under a fresh [`RoutingToken`]. Uncaught
//! errors surfacing from a realm carry the token of the call that was driving
//! the realm, so concurrent and nested calls never see each other's callbacks.
//!
//! The routing listener itself counts as one listener per [`UncaughtKind`].
//! With no usable callback and no embedder listeners, the host terminates.

use crate::error::{ErrorCallback, SandboxError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

type WeakCallback = Weak<dyn Fn(&SandboxError) + Send + Sync>;

/// Embedder hook for uncaught events, see [`add_listener`].
pub type Listener = Arc<dyn Fn(UncaughtKind, &SandboxError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UncaughtKind {
    Exception,
    Rejection,
}

/// Which facade call a routing context belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Initialize,
    Run,
}

/// Identifies one routing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingToken(u64);

/// Where an uncaught error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Sandboxed code, running under the given routing context.
    Sandboxed(RoutingToken),
    Host,
}

impl Origin {
    fn is_sandboxed(&self) -> bool {
        matches!(self, Origin::Sandboxed(_))
    }
}

/// What the channel did with an uncaught error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handed to the caller's callback; the host keeps running.
    Delivered,
    /// Left to the other listeners of that kind.
    Deferred,
    /// No one else is listening: print and exit with status 1.
    Terminate,
}

#[derive(Clone)]
pub struct RoutingContext {
    pub kind: CallKind,
    callback: Option<WeakCallback>,
}

impl RoutingContext {
    fn usable_callback(&self) -> Option<ErrorCallback> {
        self.callback.as_ref().and_then(Weak::upgrade)
    }
}

#[derive(Default)]
struct Registry {
    contexts: HashMap<RoutingToken, RoutingContext>,
    listeners: Vec<(ListenerId, UncaughtKind, Listener)>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> MutexGuard<'static, Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| Mutex::new(Registry::default()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Registers a routing context for its own lifetime.
///
/// Holds a strong reference to the callback while the call is in flight; the
/// registry itself only keeps a weak one.
pub struct RoutingScope {
    token: RoutingToken,
    _callback: Option<ErrorCallback>,
}

impl RoutingScope {
    pub fn enter(kind: CallKind, callback: Option<ErrorCallback>) -> Self {
        let token = RoutingToken(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        let context = RoutingContext {
            kind,
            callback: callback.as_ref().map(Arc::downgrade),
        };
        registry().contexts.insert(token, context);
        tracing::trace!(token = token.0, ?kind, "routing scope entered");
        Self {
            token,
            _callback: callback,
        }
    }

    pub fn token(&self) -> RoutingToken {
        self.token
    }

    pub fn origin(&self) -> Origin {
        Origin::Sandboxed(self.token)
    }

    /// The scope's callback, if one was given.
    pub fn callback(&self) -> Option<ErrorCallback> {
        context(self.token).and_then(|c| c.usable_callback())
    }
}

impl Drop for RoutingScope {
    fn drop(&mut self) {
        registry().contexts.remove(&self.token);
    }
}

/// The live context registered under `token`, if its scope is still open.
pub fn context(token: RoutingToken) -> Option<RoutingContext> {
    registry().contexts.get(&token).cloned()
}

// ============================================================================
// Listeners
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Register an embedder listener. While any is registered for a kind, the
/// channel defers instead of terminating.
pub fn add_listener(kind: UncaughtKind, listener: Listener) -> ListenerId {
    let id = ListenerId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
    registry().listeners.push((id, kind, listener));
    id
}

pub fn remove_listener(id: ListenerId) -> bool {
    let mut registry = registry();
    let before = registry.listeners.len();
    registry.listeners.retain(|(lid, _, _)| *lid != id);
    registry.listeners.len() != before
}

/// Number of listeners for `kind`, the routing listener included.
pub fn listener_count(kind: UncaughtKind) -> usize {
    1 + registry()
        .listeners
        .iter()
        .filter(|(_, k, _)| *k == kind)
        .count()
}

// ============================================================================
// Dispatch
// ============================================================================

pub fn decide(origin_is_sandbox: bool, callback_usable: bool, listener_count: usize) -> Disposition {
    if origin_is_sandbox && callback_usable {
        Disposition::Delivered
    } else if listener_count <= 1 {
        Disposition::Terminate
    } else {
        Disposition::Deferred
    }
}

/// Route one uncaught error. Never returns [`Disposition::Terminate`]: that
/// outcome exits the process.
pub fn dispatch(kind: UncaughtKind, origin: Origin, err: &SandboxError) -> Disposition {
    let callback = match origin {
        Origin::Sandboxed(token) => context(token).and_then(|c| c.usable_callback()),
        Origin::Host => None,
    };

    let listeners: Vec<Listener> = registry()
        .listeners
        .iter()
        .filter(|(_, k, _)| *k == kind)
        .map(|(_, _, l)| l.clone())
        .collect();
    for listener in &listeners {
        listener(kind, err);
    }

    match decide(origin.is_sandboxed(), callback.is_some(), listeners.len() + 1) {
        Disposition::Delivered => {
            tracing::debug!(?kind, error = %err, "delivering to error callback");
            if let Some(callback) = callback {
                callback(err);
            }
            Disposition::Delivered
        }
        Disposition::Deferred => {
            tracing::warn!(?kind, error = %err, "no usable callback, deferring to listeners");
            Disposition::Deferred
        }
        Disposition::Terminate => terminate(kind, err),
    }
}

fn terminate(kind: UncaughtKind, err: &SandboxError) -> ! {
    tracing::error!(?kind, error = %err, "uncaught error with no handler, terminating");
    eprintln!("Uncaught {}", err);
    std::process::exit(1)
}
