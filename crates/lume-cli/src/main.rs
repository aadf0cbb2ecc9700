//! lume-serve - serve a model over Channel Access and pvAccess
//!
//! Serves the bundled demo model on the in-process transport hub, applies
//! any `--put` writes through a controller, prints `--get` reads, and
//! either runs for a fixed time or until Ctrl-C.
//!
//! # Configuration
//!
//! Configuration is loaded from multiple sources with priority:
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables (`LUME_*`, `EPICS_CA_*`, `EPICS_PVA_*`)
//! 3. Config file (`--config`, TOML)
//! 4. Demo variables and bindings for anything the file leaves out
//!
//! # Environment Variables
//!
//! - `LUME_CONFIG`: config file path
//! - `LUME_PROTOCOLS`: comma separated protocol list (`ca,pva`)
//! - `LUME_COALESCE_WINDOW_MS`, `LUME_SHUTDOWN_TIMEOUT_MS`, `LUME_RESTART_LISTENERS`

mod demo;
mod log_file;

use anyhow::{bail, Context, Result};
use clap::Parser;
use demo::{demo_config, DemoModel};
use lume_runtime::config::Role;
use lume_runtime::registry::VariableRegistry;
use lume_runtime::{
    ConfigLoader, Controller, ListenerState, LocalHub, LoopState, Server, ServerConfig,
    ServerStatus,
};
use lume_types::{Protocol, PvValue};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Prefix used when neither the config file nor `--prefix` sets one.
const DEFAULT_PREFIX: &str = "test";

/// How long `--put` / `--get` wait for the server to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// lume-serve - serve a model over Channel Access and pvAccess
#[derive(Parser, Debug)]
#[command(name = "lume-serve")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Config file (TOML)
    #[arg(short, long, value_name = "PATH", env = "LUME_CONFIG")]
    config: Option<PathBuf>,

    /// PV name prefix (overrides the config file)
    #[arg(long)]
    prefix: Option<String>,

    /// Protocols to serve, e.g. `ca,pva` (overrides LUME_PROTOCOLS)
    #[arg(long, value_delimiter = ',')]
    protocols: Option<Vec<Protocol>>,

    /// Append logs to this file (debug level, independent of the terminal)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Resolve the configuration, print the PV table and exit
    #[arg(long)]
    check: bool,

    /// Print the --check table as JSON
    #[arg(long, requires = "check")]
    json: bool,

    /// Write an input through the controller after start (repeatable)
    #[arg(long = "put", value_name = "NAME=VALUE", value_parser = parse_assignment)]
    puts: Vec<(String, f64)>,

    /// Read a variable through the controller and print it (repeatable)
    #[arg(long = "get", value_name = "NAME")]
    gets: Vec<String>,

    /// Stop after this many milliseconds instead of waiting for Ctrl-C
    #[arg(long, value_name = "MS")]
    run_for_ms: Option<u64>,

    /// Seed for the demo model's random image
    #[arg(long)]
    seed: Option<u64>,
}

fn parse_assignment(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid value for '{name}': {e}"))?;
    Ok((name.trim().to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config = resolve_config(&args)?;

    if args.check {
        return print_check(&config, args.json);
    }

    println!("lume-serve v{}", env!("CARGO_PKG_VERSION"));

    let hub = LocalHub::new();
    let server = Server::new(DemoModel::new(args.seed), config.clone(), Arc::new(hub.clone()))
        .context("cannot create server")?;

    let interactive = args.run_for_ms.is_none() && args.puts.is_empty() && args.gets.is_empty();
    if interactive {
        println!(
            "Serving prefix '{}' (Ctrl-C to stop)",
            config.epics.prefix.as_deref().unwrap_or_default()
        );
        server.start(true).await?;
        print_status(&server.status());
        return Ok(());
    }

    server.start(false).await?;
    let controller = Controller::new(&config, &hub).context("cannot create controller")?;

    let outcome = exercise(&server, &controller, &args).await;
    if outcome.is_ok() {
        if let Some(ms) = args.run_for_ms {
            info!(ms, "running");
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    controller.close().await;
    server.stop().await;
    print_status(&server.status());
    outcome
}

/// Terminal filter: `--debug` > `--verbose` > `RUST_LOG` > `warn`.
/// The optional file layer always logs at debug.
fn init_tracing(args: &Args) {
    let terminal_filter = if args.debug {
        EnvFilter::new("debug")
    } else if args.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let terminal_layer = fmt::layer().with_target(false);

    let log_file = args.log_file.as_deref().and_then(log_file::open_log_file);

    if let Some(file) = log_file {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(log_file::FileMakeWriter::new(file));

        tracing_subscriber::registry()
            .with(terminal_layer.with_filter(terminal_filter))
            .with(file_layer.with_filter(EnvFilter::new("debug")))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(terminal_layer.with_filter(terminal_filter))
            .init();
    }
}

/// Loads the config and fills in whatever the demo model needs.
///
/// Demo variables and bindings are added only where the file has none
/// under the same name.
fn resolve_config(args: &Args) -> Result<ServerConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_file(path).require_file();
    }
    let mut config = loader.load().context("config error")?;

    if let Some(prefix) = &args.prefix {
        config.epics.prefix = Some(prefix.clone());
    }
    let prefix = config
        .epics
        .prefix
        .get_or_insert_with(|| DEFAULT_PREFIX.to_string())
        .clone();

    let demo = demo_config(&prefix);
    for (name, def) in demo.variables {
        config.variables.entry(name).or_insert(def);
    }
    for (name, binding) in demo.epics.pvs {
        config.epics.pvs.entry(name).or_insert(binding);
    }

    if let Some(protocols) = &args.protocols {
        config.settings.protocols.clone_from(protocols);
    }

    Ok(config)
}

#[derive(Debug, Serialize)]
struct PvRow {
    name: String,
    pvname: String,
    protocol: Protocol,
    kind: String,
    role: &'static str,
    served: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    units: Option<String>,
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Input => "input",
        Role::Output => "output",
    }
}

fn print_check(config: &ServerConfig, json: bool) -> Result<()> {
    let registry = VariableRegistry::build(&config.variables, &config.epics)
        .context("configuration is invalid")?;

    let rows: Vec<PvRow> = registry
        .variables()
        .map(|v| PvRow {
            name: v.name.clone(),
            pvname: v.address.pvname.clone(),
            protocol: v.address.protocol,
            kind: v.kind.to_string(),
            role: role_name(v.role),
            served: v.address.serve,
            units: v.units.clone(),
        })
        .collect();

    if json {
        let doc = serde_json::json!({
            "protocols": config.settings.protocols,
            "variables": rows,
            "structures": registry
                .structures()
                .iter()
                .map(|s| serde_json::json!({
                    "name": s.name,
                    "pvname": s.pvname,
                    "protocol": s.protocol,
                    "fields": s.fields,
                }))
                .collect::<Vec<_>>(),
            "summary": registry.summary().map(|s| &s.pvname),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    let protocols: Vec<&str> = config.settings.protocols.iter().map(Protocol::as_str).collect();
    println!("protocols: {}", protocols.join(","));
    println!(
        "{:<12} {:<24} {:<4} {:<7} {:<7} {}",
        "NAME", "PVNAME", "PROT", "KIND", "ROLE", "SERVED"
    );
    for row in &rows {
        println!(
            "{:<12} {:<24} {:<4} {:<7} {:<7} {}",
            row.name,
            row.pvname,
            row.protocol,
            row.kind,
            row.role,
            if row.served { "yes" } else { "monitor" }
        );
    }
    for s in registry.structures() {
        println!("structure {} ({}): {}", s.pvname, s.protocol, s.fields.join(", "));
    }
    if let Some(summary) = registry.summary() {
        println!("summary {} ({})", summary.pvname, summary.protocol);
    }
    Ok(())
}

/// Applies `--put` writes, waits for the loop to pick them up, then
/// prints `--get` reads once they match the server's state.
async fn exercise(server: &Server, controller: &Controller, args: &Args) -> Result<()> {
    for (name, value) in &args.puts {
        controller
            .put(name, *value)
            .await
            .with_context(|| format!("put {name}={value} failed"))?;
        info!(name = %name, value, "put accepted");
    }

    if !args.puts.is_empty() {
        let expected: BTreeMap<&str, f64> =
            args.puts.iter().map(|(n, v)| (n.as_str(), *v)).collect();
        let mut loop_status = server.handle().subscribe_loop();
        let settled = loop_status.wait_for(|status| {
            status.state == LoopState::Idle
                && expected
                    .iter()
                    .all(|(n, v)| server.snapshot().value(n) == Some(&PvValue::Scalar(*v)))
        });
        match tokio::time::timeout(SETTLE_TIMEOUT, settled).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => bail!("execution loop stopped before evaluating the writes"),
            Err(_) => bail!("timed out waiting for the writes to be evaluated"),
        };
    }

    for name in &args.gets {
        let value = read_settled(server, controller, name).await?;
        println!("{name} = {value}");
    }
    Ok(())
}

/// Reads `name` until the served value matches the loop's current value.
async fn read_settled(server: &Server, controller: &Controller, name: &str) -> Result<PvValue> {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let value = controller
            .get(name)
            .await
            .with_context(|| format!("get {name} failed"))?;
        if server.snapshot().value(name) == Some(&value) {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(name, "served value did not catch up with the loop");
            return Ok(value);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn describe_listener(state: &ListenerState) -> String {
    match state {
        ListenerState::Starting { .. } => "starting".to_string(),
        ListenerState::Running { restarts } => format!("running (restarts: {restarts})"),
        ListenerState::Faulted { fault, restarts } => {
            format!("faulted after {restarts} restarts: {fault}")
        }
        ListenerState::Stopped => "stopped".to_string(),
    }
}

fn print_status(status: &ServerStatus) {
    println!("server: {}", status.phase);
    println!(
        "evaluations: {} (failed: {}, rejected changes: {})",
        status.engine.evaluations, status.engine.failures, status.engine.rejected_changes
    );
    if let Some(err) = &status.engine.last_error {
        println!("last error: {err}");
    }
    for (protocol, state) in &status.listeners {
        println!("listener {protocol}: {}", describe_listener(state));
    }
}
