use crate::config::service::ServiceConfig;
use crate::config::types::ExecutionRequest;
use crate::core::proxy::run_proxy_role;
use crate::core::supervisor::PROXY_ROLE;
use crate::judge::registry::LanguageRegistry;
use crate::service::ExecutionService;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about = "Sandboxed execution service for untrusted code", long_about = None)]
struct Cli {
    /// Internal role selector (hidden; the supervisor re-executes this binary as the proxy)
    #[arg(long, hide = true)]
    internal_role: Option<String>,
    /// JSON configuration file
    #[arg(long, global = true, env = "EXECBOX_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service
    Serve {
        /// Listen address, overrides the configured bind_addr
        #[arg(long)]
        bind: Option<String>,
    },
    /// Execute one source file and print the JSON result
    Run {
        /// Language id or alias
        #[arg(long, short)]
        language: String,
        /// Source file
        file: PathBuf,
        /// File fed to the program's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,
        /// Caller id used for admission accounting
        #[arg(long, default_value = "cli")]
        caller: String,
    },
    /// List the configured languages and their limits
    Languages,
}

/// Binary entry point. The proxy role is dispatched before logging or any
/// runtime starts so the proxy stays single-threaded and silent.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(role) = cli.internal_role.as_deref() {
        if role == PROXY_ROLE {
            std::process::exit(run_proxy_role());
        }
        anyhow::bail!("unknown internal role: {}", role);
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Serve { bind }) => serve(config, bind),
        Some(Commands::Run {
            language,
            file,
            stdin,
            caller,
        }) => run_once(config, language, &file, stdin.as_deref(), caller),
        Some(Commands::Languages) => list_languages(&config),
        None => {
            eprintln!("No command given; try `execbox --help`");
            std::process::exit(2);
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let config = ServiceConfig::load(path).context("loading configuration")?;
    log::info!("Configuration: {}", serde_json::to_string(&config)?);
    Ok(config)
}

fn serve(mut config: ServiceConfig, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    let bind_addr = config.bind_addr.clone();
    let service = Arc::new(ExecutionService::from_config(Arc::new(config))?);

    // Built by hand rather than via #[tokio::main] so the proxy role above never starts one.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    runtime.block_on(crate::server::serve(service, &bind_addr))?;
    Ok(())
}

fn run_once(
    config: ServiceConfig,
    language: String,
    file: &Path,
    stdin: Option<&Path>,
    caller: String,
) -> Result<()> {
    let source = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let input = match stdin {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        None => Vec::new(),
    };

    let service = ExecutionService::from_config(Arc::new(config))?;
    let cancel = AtomicBool::new(false);
    let request = ExecutionRequest::new(language, source, input, caller);

    match service.run(request, None, &cancel) {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(rejection) => {
            let body = serde_json::json!({
                "error_kind": rejection.kind(),
                "message": rejection.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            std::process::exit(2);
        }
    }
}

fn list_languages(config: &ServiceConfig) -> Result<()> {
    let registry = LanguageRegistry::from_config(config)?;
    let profiles: Vec<_> = registry.languages().collect();
    println!("{}", serde_json::to_string_pretty(&profiles)?);
    Ok(())
}
