use anyhow::{bail, Context, Result};
use clap::Parser;
use kiln_core::{builtin, Service, ServiceOptions, UnitRef};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "kiln.toml";

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "kiln - pluggable build orchestration")]
struct Args {
    /// Command to run
    #[arg(default_value = "help")]
    command: String,

    /// Arguments passed to the command (`--flag`, `--key=value`, positionals)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Project root (defaults to $APP_ROOT, then the current directory)
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Environment name (defaults to $NODE_ENV, then development)
    #[arg(long, value_name = "NAME")]
    env: Option<String>,
}

fn main() -> Result<()> {
    setup_tracing()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    if let Err(e) = runtime.block_on(async_main()) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();
    let cwd = resolve_cwd(args.cwd)?;
    info!("CLI startup: command={}, cwd={}", args.command, cwd.display());

    let mut opts = ServiceOptions::new(&cwd)
        .with_process_env()
        .user_config(load_user_config(&cwd)?);
    if let Some(env) = args.env.or_else(|| std::env::var("NODE_ENV").ok()) {
        opts = opts.env(env);
    }
    let service = Service::new(opts.presets(vec![UnitRef::from(builtin::preset())]))?;

    let out = service
        .run(&args.command, command_args(&args.command, &args.args))
        .await?;
    print_output(&out)?;
    Ok(())
}

fn resolve_cwd(explicit: Option<PathBuf>) -> Result<PathBuf> {
    let cwd = match explicit.or_else(|| std::env::var_os("APP_ROOT").map(PathBuf::from)) {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    cwd.canonicalize()
        .with_context(|| format!("Failed to canonicalize project root {}", cwd.display()))
}

/// Reads `kiln.toml` from the project root. A missing file is an empty
/// config.
fn load_user_config(cwd: &Path) -> Result<Map<String, Value>> {
    let path = cwd.join(CONFIG_FILE);
    if !path.is_file() {
        return Ok(Map::new());
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let table: toml::Table = toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))?;
    match serde_json::to_value(table)? {
        Value::Object(map) => Ok(map),
        other => bail!("{} must contain a table, got {other}", path.display()),
    }
}

/// `{ "_": [command, positionals..], flag: value.. }`.
///
/// Flags belong to plugin commands and are unknown to clap, so the tail is
/// parsed here.
fn command_args(command: &str, raw: &[String]) -> Value {
    let mut positional = vec![Value::from(command)];
    let mut named = Map::new();
    let mut iter = raw.iter().peekable();
    while let Some(arg) = iter.next() {
        let Some(flag) = arg.strip_prefix("--") else {
            positional.push(Value::from(arg.as_str()));
            continue;
        };
        if let Some((key, value)) = flag.split_once('=') {
            named.insert(key.to_string(), Value::from(value));
        } else if let Some(value) = iter.next_if(|next| !next.starts_with("--")) {
            named.insert(flag.to_string(), Value::from(value.as_str()));
        } else {
            named.insert(flag.to_string(), Value::Bool(true));
        }
    }
    named.insert("_".to_string(), Value::Array(positional));
    Value::Object(named)
}

fn print_output(out: &Value) -> Result<()> {
    match out {
        Value::Null => {}
        Value::String(s) => println!("{s}"),
        Value::Array(items) if items.iter().all(Value::is_string) => {
            for item in items.iter().filter_map(Value::as_str) {
                println!("{item}");
            }
        }
        other => println!("{}", serde_json::to_string_pretty(other)?),
    }
    Ok(())
}

fn setup_tracing() -> Result<()> {
    use tracing_subscriber::fmt;

    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    let trace_dir = home.join(".kiln").join("trace");
    fs::create_dir_all(&trace_dir)?;

    let log_file = trace_dir.join("kiln.log");
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Tracing initialized to {:?}", log_file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_command_args() {
        let raw: Vec<String> = ["src", "--watch", "--port", "8000", "--mode=fast", "extra"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            command_args("dev", &raw),
            json!({ "_": ["dev", "src", "extra"], "watch": true, "port": "8000", "mode": "fast" })
        );
    }

    #[test]
    fn test_load_user_config() {
        let temp = TempDir::new().unwrap();
        assert!(load_user_config(temp.path()).unwrap().is_empty());

        fs::write(
            temp.path().join(CONFIG_FILE),
            "outputPath = \"build\"\nplugins = [\"./plugin\"]\n\n[theme]\nprimary = \"red\"\n",
        )
        .unwrap();
        let config = load_user_config(temp.path()).unwrap();
        assert_eq!(config.get("outputPath"), Some(&json!("build")));
        assert_eq!(config.get("plugins"), Some(&json!(["./plugin"])));
        assert_eq!(config.get("theme"), Some(&json!({ "primary": "red" })));
    }
}
