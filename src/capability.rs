//! Process-level switch that must be on before any module realm is created.
//!
//! The host opts in either at launch (`--experimental-vm-modules` on the
//! command line, or `REALM_SANDBOX_MODULE_REALMS=1` in the environment) or
//! programmatically through [`enable_module_realms`].

use std::sync::atomic::{AtomicBool, Ordering};

/// Launch flag that enables module realms.
pub const MODULE_REALMS_FLAG: &str = "--experimental-vm-modules";

/// Environment variable that enables module realms when set to `1` or `true`.
pub const MODULE_REALMS_ENV: &str = "REALM_SANDBOX_MODULE_REALMS";

static ENABLED: AtomicBool = AtomicBool::new(false);

/// Turn module realms on for the rest of the process lifetime.
pub fn enable_module_realms() {
    ENABLED.store(true, Ordering::SeqCst);
}

/// Whether the host was started (or later configured) with module realms.
pub fn module_realms_enabled() -> bool {
    if ENABLED.load(Ordering::SeqCst) {
        return true;
    }

    let from_env = std::env::var(MODULE_REALMS_ENV)
        .map(|v| matches!(v.trim(), "1" | "true"))
        .unwrap_or(false);

    from_env || std::env::args().any(|arg| arg == MODULE_REALMS_FLAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_is_sticky() {
        enable_module_realms();
        assert!(module_realms_enabled());
        assert!(module_realms_enabled());
    }
}
