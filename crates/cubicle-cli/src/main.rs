//! Cubicle CLI
//!
//! Serves the orchestration API, or runs a local submission archive once.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cubicle::workspace::Workspace;
use cubicle::{Config, DockerEngine, EXAMPLE_CONFIG, Runner, server};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cubicle")]
#[command(about = "Run untrusted classroom submissions in containers and process groups")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP and websocket API
    Serve {
        /// Address to bind, overriding the configuration
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Build and run a local submission archive to completion
    Run {
        /// Zip archive of the submission
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,

        /// Language or category hint (e.g., java, python)
        #[arg(short, long)]
        language: Option<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Boot a local app archive for preview until interrupted
    Preview {
        /// Zip archive of the app
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "cubicle.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// List available languages
    Languages,

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Languages => {
            list_languages(&config);
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            serve(config).await
        }
        Commands::Run {
            archive,
            language,
            json,
        } => run_archive(config, &archive, language.as_deref(), json).await,
        Commands::Preview { archive } => preview_archive(config, &archive).await,
    }
}

async fn connect_runner(config: Config) -> Result<Runner> {
    let engine = DockerEngine::connect().context("failed to create container engine client")?;
    if let Err(e) = engine.ping().await {
        warn!(error = %e, "container engine is not reachable");
    }
    Ok(Runner::new(config, engine))
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
        trigger.cancel();
    });
    token
}

async fn serve(config: Config) -> Result<()> {
    let runner = connect_runner(config).await?;
    server::serve(runner, shutdown_on_ctrl_c())
        .await
        .context("server failed")
}

async fn load_archive(config: &Config, archive: &Path) -> Result<Workspace> {
    Workspace::from_archive_file(archive, &config.workspace)
        .await
        .with_context(|| format!("failed to extract '{}'", archive.display()))
}

async fn run_archive(config: Config, archive: &Path, hint: Option<&str>, json: bool) -> Result<()> {
    let workspace = load_archive(&config, archive).await?;
    let runner = connect_runner(config).await?;

    match runner.execute_workspace(workspace, hint).await {
        Ok(output) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{}", output.stdout);
                if output.stderr != cubicle::types::NO_OUTPUT {
                    eprintln!("{}", output.stderr);
                }
            }
            info!(
                language = %output.language,
                time = format_args!("{}ms", output.execution_time),
                exit = ?output.exit_classification,
                "execution result"
            );
            match output.exit_classification {
                cubicle::ExitClassification::Success => Ok(()),
                cubicle::ExitClassification::NonZeroExit { code } => {
                    std::process::exit(i32::try_from(code).unwrap_or(1))
                }
            }
        }
        Err(e) => {
            let report = e.report();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                eprintln!("{:?}: {}", report.kind, report.message);
                if let Some(ref raw) = report.raw_output {
                    eprintln!("\n{raw}");
                }
            }
            std::process::exit(1);
        }
    }
}

async fn preview_archive(config: Config, archive: &Path) -> Result<()> {
    let workspace = load_archive(&config, archive).await?;
    let runner = connect_runner(config).await?;
    let shutdown = shutdown_on_ctrl_c();

    let preview = match runner.app().start(workspace).await {
        Ok(preview) => preview,
        Err(e) => {
            eprintln!("{:?}: {e}", e.kind());
            if let Some(raw) = e.raw_output() {
                eprintln!("\n{raw}");
            }
            std::process::exit(1);
        }
    };
    println!("{}", serde_json::to_string_pretty(&preview)?);
    println!("\nOpen {} (ctrl-c to stop)", preview.open_browser_url);

    shutdown.cancelled().await;
    let outcome = runner.app().stop(&preview.session_id).await;
    info!(success = outcome.success, "{}", outcome.message);
    Ok(())
}

fn list_languages(config: &Config) {
    println!("Available languages:\n");

    for (id, lang) in config.sorted_languages() {
        let lang_type = if lang.is_compiled() {
            "compiled"
        } else {
            "interpreted"
        };
        println!(
            "  {:<12} {:<20} .{:<6} {} ({})",
            id,
            lang.name,
            lang.extension.as_str(),
            lang.base_image,
            lang_type
        );
    }
}

fn show_config(config: &Config) {
    let limits = &config.default_limits;
    println!("Default resource limits:");
    println!("  Memory: {:?} MB", limits.memory_mb);
    println!("  CPUs: {:?}", limits.cpus);
    println!("  Timeout: {:?} s", limits.timeout_secs);
    println!("  Build timeout: {:?} s", limits.build_timeout_secs);
    println!("  Max processes: {:?}", limits.max_processes);
    println!("  Network: {:?}", limits.network);
    println!("  Max output: {:?} KB", limits.max_output);
    println!();
    println!("Workspace:");
    println!("  Max archive: {} MB", config.workspace.max_archive_mb);
    println!("  Max extracted: {} MB", config.workspace.max_extracted_mb);
    println!("  Max analyzed file: {} bytes", config.workspace.max_file_bytes);
    println!();
    println!("Sessions:");
    println!("  Idle timeout: {} s", config.sessions.idle_timeout_secs);
    println!("  Max lifetime: {} s", config.sessions.max_lifetime_secs);
    println!("  Reaper interval: {} s", config.sessions.reaper_interval_secs);
    println!();
    println!("App previews:");
    println!("  Toolchain: {}", config.app.toolchain.join(", "));
    println!(
        "  Ports: backend {}+, frontend {}+ (window {})",
        config.app.backend_port_base, config.app.frontend_port_base, config.app.port_window
    );
    println!();
    println!("Server: {} (websocket prefix {})", config.server.bind, config.server.ws_prefix);
    println!(
        "Analyzer: {}",
        config.analyzer.endpoint.as_deref().unwrap_or("static scanning only")
    );
    println!();
    println!("Languages configured: {}", config.languages.len());
}

async fn init_config(output: &PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
