//! Realm Sandbox CLI
//!
//! Single-shot mode:
//!   realm-sandbox [flags] <file> [function] [args-json]
//!
//! Server mode (persistent process, reads from stdin):
//!   realm-sandbox [flags] --server <file>
//!
//! Flags:
//!   --experimental-vm-modules   enable module realms (required)
//!   --insulation=true|false     hide host process control (default true)
//!   --no-error-callback         let uncaught sandbox errors terminate the host
//!
//! Protocol (server mode):
//!   Request (stdin):
//!     render
//!     [{"page":"home"}]
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:1234
//!
//!     "<!DOCTYPE html>..."
//!
//!   Error response:
//!     Status:Error
//!     Length:42
//!
//!     sandboxed function threw: TypeError: ...

use anyhow::{anyhow, Result};
use realm_sandbox::config::parse_bool;
use realm_sandbox::routing::{self, UncaughtKind};
use realm_sandbox::{ErrorCallback, Sandbox, SandboxConfig, SandboxError, MODULE_REALMS_FLAG};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn print_usage() {
    eprintln!("Realm Sandbox - run an untrusted ES module in an isolated realm");
    eprintln!();
    eprintln!("Single-shot mode:");
    eprintln!("  realm-sandbox {} [--insulation=true|false] [--no-error-callback] <file> [function] [args-json]", MODULE_REALMS_FLAG);
    eprintln!();
    eprintln!("Server mode (persistent process):");
    eprintln!("  realm-sandbox {} [--insulation=true|false] --server <file>", MODULE_REALMS_FLAG);
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  realm-sandbox {} ./plugin.js render '[{{\"page\":\"home\"}}]'", MODULE_REALMS_FLAG);
    eprintln!("  realm-sandbox {} --server ./plugin.js", MODULE_REALMS_FLAG);
}

#[derive(Debug, Default)]
struct Options {
    insulation: bool,
    error_callback: bool,
    server: bool,
    positional: Vec<String>,
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut options = Options {
        insulation: true,
        error_callback: true,
        ..Default::default()
    };

    for arg in args {
        if arg == MODULE_REALMS_FLAG {
            // read by realm_sandbox::capability
        } else if let Some(value) = arg.strip_prefix("--insulation=") {
            options.insulation = parse_bool("--insulation", value)?;
        } else if arg == "--no-error-callback" {
            options.error_callback = false;
        } else if arg == "--server" {
            options.server = true;
        } else if arg.starts_with("--") {
            return Err(anyhow!("Unknown flag: {}", arg));
        } else {
            options.positional.push(arg.clone());
        }
    }

    Ok(options)
}

/// A JSON array is the argument list; any other value is a single argument.
fn parse_args_json(json: Option<&str>) -> Result<Vec<Value>> {
    match json.map(str::trim) {
        None | Some("") => Ok(vec![]),
        Some(json) => match serde_json::from_str(json).map_err(|e| anyhow!("Invalid args JSON: {}", e))? {
            Value::Array(args) => Ok(args),
            other => Ok(vec![other]),
        },
    }
}

async fn print_console(sandbox: &Sandbox, config: &SandboxConfig) {
    if config.echo_console {
        return;
    }
    if let Ok(console) = sandbox.take_console().await {
        for log in &console.logs {
            eprintln!("[LOG] {}", log);
        }
        for warn in &console.warns {
            eprintln!("[WARN] {}", warn);
        }
        for err in &console.errors {
            eprintln!("[ERROR] {}", err);
        }
    }
}

/// Run in single-shot mode
async fn run_single_shot(options: &Options, config: SandboxConfig) -> Result<bool> {
    let file = options
        .positional
        .first()
        .ok_or_else(|| anyhow!("Missing file argument"))?;
    let function = options.positional.get(1);
    let args = parse_args_json(options.positional.get(2).map(String::as_str))?;

    let failed = Arc::new(AtomicBool::new(false));
    let callback: Option<ErrorCallback> = if options.error_callback {
        let failed = failed.clone();
        Some(Arc::new(move |err: &SandboxError| {
            eprintln!("Error: {}", err);
            failed.store(true, Ordering::SeqCst);
        }))
    } else {
        None
    };

    let mut sandbox = Sandbox::builder(file)
        .insulation(options.insulation)
        .config(config.clone())
        .build()?;

    sandbox.initialize(callback.clone()).await?;
    print_console(&sandbox, &config).await;

    let result = match function {
        Some(name) => sandbox.run(callback, name, args).await?,
        None => sandbox.execute(callback, args).await?,
    };
    print_console(&sandbox, &config).await;
    sandbox.destroy().await;

    if failed.load(Ordering::SeqCst) {
        return Ok(false);
    }
    println!("{}", result);
    Ok(true)
}

/// Run in server mode (persistent process, reads requests from stdin)
async fn run_server(options: &Options, config: SandboxConfig) -> Result<bool> {
    let file = options
        .positional
        .first()
        .ok_or_else(|| anyhow!("Server mode requires a file argument"))?;

    // Strays between requests are logged rather than fatal.
    for kind in [UncaughtKind::Exception, UncaughtKind::Rejection] {
        routing::add_listener(
            kind,
            Arc::new(|kind, err| tracing::error!(?kind, error = %err, "uncaught sandbox error")),
        );
    }

    let mut sandbox = Sandbox::builder(file)
        .insulation(options.insulation)
        .config(config.clone())
        .build()?;

    // Initialize ONCE at startup; requests reuse the evaluated module
    if !sandbox.initialize(None).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "initialization failed");
        false
    }) {
        return Ok(false);
    }
    print_console(&sandbox, &config).await;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    eprintln!("[realm-sandbox] Server ready, reading from stdin...");

    loop {
        let mut function_line = String::new();
        let mut args_line = String::new();

        if reader.read_line(&mut function_line)? == 0 {
            // EOF - stdin closed
            break;
        }
        reader.read_line(&mut args_line)?;

        let args = match parse_args_json(Some(args_line.as_str())) {
            Ok(args) => args,
            Err(e) => {
                write_response(&mut stdout, false, &e.to_string())?;
                continue;
            }
        };

        match sandbox.run(None, function_line.trim(), args).await {
            Ok(value) => write_response(&mut stdout, true, &value.to_string())?,
            Err(e) => write_response(&mut stdout, false, &e.to_string())?,
        }
        print_console(&sandbox, &config).await;
    }

    sandbox.destroy().await;
    eprintln!("[realm-sandbox] Server shutting down");
    Ok(true)
}

/// Write response in length-prefixed protocol
fn write_response(stdout: &mut std::io::Stdout, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };

    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Length:{}", body.len())?;
    writeln!(stdout)?;
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realm_sandbox=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = parse_options(&args)?;

    if options.positional.is_empty() {
        print_usage();
        return Err(anyhow!("Missing required arguments"));
    }

    let config = SandboxConfig::from_env()?;

    let succeeded = if options.server {
        run_server(&options, config).await?
    } else {
        run_single_shot(&options, config).await?
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
