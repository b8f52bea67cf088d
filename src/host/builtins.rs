//! Built-in host modules and the process-control object.

use super::{HostFunction, HostModule, HostValue, PropertyDescriptor};
use crate::host::normalize;
use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

/// Upper bound for `crypto.randomBytes`.
const MAX_RANDOM_BYTES: usize = 64 * 1024;

fn arg_str<'a>(args: &'a [Value], index: usize, function: &str) -> Result<&'a str> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("{}: argument {} must be a string", function, index))
}

// ============================================================================
// path
// ============================================================================

/// Join segments the way Node's `path.join` does: later absolute segments
/// are appended, never substituted for what came before.
pub fn join_segments(segments: &[&str]) -> String {
    let mut joined = std::path::PathBuf::new();
    for (i, segment) in segments.iter().enumerate() {
        let segment = if i == 0 {
            *segment
        } else {
            segment.trim_start_matches('/')
        };
        if !segment.is_empty() {
            joined.push(segment);
        }
    }
    let out = normalize(&joined).to_string_lossy().into_owned();
    if out.is_empty() {
        ".".into()
    } else {
        out
    }
}

pub fn path_module() -> HostModule {
    let join = HostFunction::new(|args| {
        let segments = (0..args.len())
            .map(|i| arg_str(&args, i, "join"))
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::String(join_segments(&segments)))
    });

    let dirname = HostFunction::new(|args| {
        let path = Path::new(arg_str(&args, 0, "dirname")?);
        let parent = match path.parent() {
            Some(p) if p.as_os_str().is_empty() => ".".to_string(),
            Some(p) => p.to_string_lossy().into_owned(),
            None => path.to_string_lossy().into_owned(),
        };
        Ok(Value::String(parent))
    });

    let basename = HostFunction::new(|args| {
        let path = Path::new(arg_str(&args, 0, "basename")?);
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(ext) = args.get(1).and_then(Value::as_str) {
            if name.len() > ext.len() && name.ends_with(ext) {
                name.truncate(name.len() - ext.len());
            }
        }
        Ok(Value::String(name))
    });

    let extname = HostFunction::new(|args| {
        let path = Path::new(arg_str(&args, 0, "extname")?);
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        Ok(Value::String(ext))
    });

    let is_absolute = HostFunction::new(|args| {
        Ok(Value::Bool(Path::new(arg_str(&args, 0, "isAbsolute")?).is_absolute()))
    });

    let sep = Value::String(std::path::MAIN_SEPARATOR.to_string());

    let namespace = HostValue::Object(vec![
        ("join".into(), PropertyDescriptor::value(join.clone())),
        ("dirname".into(), PropertyDescriptor::value(dirname.clone())),
        ("basename".into(), PropertyDescriptor::value(basename.clone())),
        ("extname".into(), PropertyDescriptor::value(extname.clone())),
        ("isAbsolute".into(), PropertyDescriptor::value(is_absolute.clone())),
        ("sep".into(), PropertyDescriptor::value(sep.clone())),
    ]);

    HostModule::new()
        .with_default(namespace)
        .with_export("join", join)
        .with_export("dirname", dirname)
        .with_export("basename", basename)
        .with_export("extname", extname)
        .with_export("isAbsolute", is_absolute)
        .with_export("sep", sep)
}

// ============================================================================
// crypto
// ============================================================================

/// Raw digest of `data` with one of SHA-256, SHA-384 or SHA-512.
pub fn digest(algorithm: &str, data: &[u8]) -> Result<Vec<u8>> {
    use sha2::{Digest, Sha256, Sha384, Sha512};

    let bytes = match algorithm.to_uppercase().replace('-', "").as_str() {
        "SHA256" => Sha256::digest(data).to_vec(),
        "SHA384" => Sha384::digest(data).to_vec(),
        "SHA512" => Sha512::digest(data).to_vec(),
        _ => {
            return Err(anyhow!(
                "Unsupported algorithm: {}. Supported: SHA-256, SHA-384, SHA-512",
                algorithm
            ))
        }
    };

    Ok(bytes)
}

/// Hex digest of `data`, see [`digest`].
pub fn digest_hex(algorithm: &str, data: &[u8]) -> Result<String> {
    Ok(digest(algorithm, data)?.iter().map(|b| format!("{:02x}", b)).collect())
}

pub fn crypto_module() -> HostModule {
    let random_uuid = HostFunction::new(|_| Ok(Value::String(uuid::Uuid::new_v4().to_string())));

    let random_bytes = HostFunction::new(|args| {
        use rand::RngCore;

        let len = args.first().and_then(Value::as_u64).unwrap_or(16) as usize;
        if len > MAX_RANDOM_BYTES {
            return Err(anyhow!("randomBytes: at most {} bytes per call", MAX_RANDOM_BYTES));
        }
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        Ok(json!(buf))
    });

    let digest = HostFunction::new(|args| {
        let algorithm = arg_str(&args, 0, "digest")?;
        let data = arg_str(&args, 1, "digest")?;
        Ok(Value::String(digest_hex(algorithm, data.as_bytes())?))
    });

    HostModule::new()
        .with_export("randomUUID", random_uuid)
        .with_export("randomBytes", random_bytes)
        .with_export("digest", digest)
}

// ============================================================================
// encoding
// ============================================================================

pub fn encoding_module() -> HostModule {
    use base64::Engine;

    let to_base64 = HostFunction::new(|args| {
        let data = arg_str(&args, 0, "toBase64")?;
        Ok(Value::String(
            base64::engine::general_purpose::STANDARD.encode(data.as_bytes()),
        ))
    });

    let from_base64 = HostFunction::new(|args| {
        let data = arg_str(&args, 0, "fromBase64")?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| anyhow!("Invalid base64: {}", e))?;
        String::from_utf8(bytes)
            .map(Value::String)
            .map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
    });

    HostModule::new()
        .with_export("toBase64", to_base64)
        .with_export("fromBase64", from_base64)
}

// ============================================================================
// process
// ============================================================================

fn started_at() -> Instant {
    static STARTED: OnceLock<Instant> = OnceLock::new();
    *STARTED.get_or_init(Instant::now)
}

fn platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

fn arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    }
}

/// The process-control object. Only realms created without insulation see it.
pub fn process_object() -> HostValue {
    started_at();

    let exit = HostFunction::new(|args| {
        let code = match args.first() {
            None | Some(Value::Null) => 0,
            Some(value) => value
                .as_i64()
                .and_then(|code| i32::try_from(code).ok())
                .ok_or_else(|| anyhow!("exit: code must be a 32-bit integer, got {}", value))?,
        };
        tracing::warn!(code, "sandboxed code called process.exit");
        std::process::exit(code)
    });

    let cwd = HostFunction::new(|_| {
        let dir = std::env::current_dir().map_err(|e| anyhow!("cwd: {}", e))?;
        Ok(Value::String(dir.to_string_lossy().into_owned()))
    });

    let uptime = HostFunction::new(|_| Ok(json!(started_at().elapsed().as_secs_f64())));

    // Computed on every read so the sandbox sees the host's current environment.
    let env = HostFunction::new(|_| {
        let vars: Map<String, Value> = std::env::vars()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        Ok(Value::Object(vars))
    });

    let argv: Vec<String> = std::env::args().collect();

    HostValue::Object(vec![
        ("exit".into(), PropertyDescriptor::value(exit)),
        ("cwd".into(), PropertyDescriptor::value(cwd)),
        ("uptime".into(), PropertyDescriptor::value(uptime)),
        ("env".into(), PropertyDescriptor::accessor(Some(env), None)),
        ("argv".into(), PropertyDescriptor::value(json!(argv))),
        ("pid".into(), PropertyDescriptor::value(json!(std::process::id()))),
        ("platform".into(), PropertyDescriptor::value(json!(platform()))),
        ("arch".into(), PropertyDescriptor::value(json!(arch()))),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(module: &HostModule, name: &str, args: Vec<Value>) -> Result<Value> {
        let exports = module.exports();
        let (_, value) = exports
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| anyhow!("no export {}", name))?;
        match value {
            HostValue::Function(HostFunction::Sync(f)) => f(args),
            other => Err(anyhow!("{} is not a sync function: {:?}", name, other)),
        }
    }

    #[test]
    fn test_path_functions() {
        let path = path_module();
        assert_eq!(call(&path, "join", vec![json!("/a/b"), json!("../c")]).unwrap(), json!("/a/c"));
        assert_eq!(call(&path, "dirname", vec![json!("/a/b/c.txt")]).unwrap(), json!("/a/b"));
        assert_eq!(call(&path, "dirname", vec![json!("file.txt")]).unwrap(), json!("."));
        assert_eq!(
            call(&path, "basename", vec![json!("/a/b/c.txt"), json!(".txt")]).unwrap(),
            json!("c")
        );
        assert_eq!(call(&path, "extname", vec![json!("index.html")]).unwrap(), json!(".html"));
        assert!(path.has_default());
    }

    #[test]
    fn test_digest_known_vector() {
        assert_eq!(
            digest_hex("SHA-256", b"abc").unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(digest_hex("MD5", b"abc").is_err());
    }

    #[test]
    fn test_random_bytes_limit() {
        let crypto = crypto_module();
        let bytes = call(&crypto, "randomBytes", vec![json!(8)]).unwrap();
        assert_eq!(bytes.as_array().map(Vec::len), Some(8));
        assert!(call(&crypto, "randomBytes", vec![json!(MAX_RANDOM_BYTES + 1)]).is_err());
    }

    #[test]
    fn test_base64_roundtrip_rejects_garbage() {
        let encoding = encoding_module();
        let encoded = call(&encoding, "toBase64", vec![json!("héllo")]).unwrap();
        assert_eq!(call(&encoding, "fromBase64", vec![encoded]).unwrap(), json!("héllo"));
        assert!(call(&encoding, "fromBase64", vec![json!("%%%")]).is_err());
    }

    #[test]
    fn test_process_object_shape() {
        let HostValue::Object(props) = process_object() else {
            panic!("process must be an object");
        };
        let names: Vec<&str> = props.iter().map(|(n, _)| n.as_str()).collect();
        for expected in ["exit", "cwd", "env", "pid", "platform"] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_join_appends_absolute_segments() {
        assert_eq!(join_segments(&["/srv", "/static", "app.js"]), "/srv/static/app.js");
        assert_eq!(join_segments(&["a", "", "b"]), "a/b");
        assert_eq!(join_segments(&[]), ".");

        let path = path_module();
        assert_eq!(call(&path, "join", vec![json!("a"), json!("/b")]).unwrap(), json!("a/b"));
    }

    #[test]
    fn test_exit_rejects_codes_outside_i32() {
        let HostValue::Object(props) = process_object() else {
            panic!("process must be an object");
        };
        let (_, exit) = props.iter().find(|(n, _)| n == "exit").unwrap();
        let crate::host::Slot::Value {
            value: HostValue::Function(HostFunction::Sync(exit)),
            ..
        } = &exit.slot
        else {
            panic!("exit must be a sync function");
        };
        assert!(exit(vec![json!(1u64 << 40)]).is_err());
        assert!(exit(vec![json!("1")]).is_err());
    }
}
