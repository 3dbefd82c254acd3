use anyhow::Context;
use clap::Parser;
use dbgp_config::DebugConfig;
use dbgp_session::{server, DebugEngine, EngineConfig};
use std::path::PathBuf;

/// DBGp (Xdebug) debug session server.
///
/// Reads one JSON tool request per line on stdin and writes one JSON response
/// per line on stdout. Logs go to stderr.
#[derive(Debug, Parser)]
#[command(name = "dbgp-session", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `DBGP_CONFIG` is used as a fallback. When neither are provided
    /// the server uses in-memory defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on for the debugger engine.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on for the debugger engine.
    #[arg(long)]
    port: Option<u16>,

    /// Project root; relative breakpoint paths and path mappings resolve
    /// against it.
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Seconds to wait for the debuggee to connect.
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Log level or filter directives (`debug`, `info,dbgp.wire=trace`).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut DebugConfig) {
        if let Some(host) = &self.host {
            config.listen.host = host.clone();
        }
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(root) = &self.project_root {
            config.project.root = Some(root.clone());
        }
        if let Some(secs) = self.connect_timeout {
            config.listen.connect_timeout_secs = secs;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.clone());
    config
        .apply_env()
        .context("invalid debugger settings in the environment")?;
    cli.apply(&mut config);
    dbgp_config::init_tracing(&config.logging);

    let engine_config = EngineConfig::from_config(&config);
    tracing::info!(
        target = "dbgp.server",
        host = %engine_config.listen_host,
        port = engine_config.port,
        project_root = %engine_config.project_root.display(),
        mappings = engine_config.path_mappings.len(),
        "dbgp-session ready"
    );
    server::run_stdio(DebugEngine::new(engine_config)).await
}

fn load_config(cli_path: Option<PathBuf>) -> DebugConfig {
    let path = cli_path.or_else(|| std::env::var_os(dbgp_config::ENV_CONFIG).map(PathBuf::from));
    let Some(path) = path else {
        return DebugConfig::default();
    };

    match DebugConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "dbgp-session: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            DebugConfig::default()
        }
    }
}
