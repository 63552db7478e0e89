//! `keyrelayd`: an SSH agent broker.
//!
//! One logical agent (an in-memory keyring, optionally combined with the
//! Windows certificate store, or a Hyper-V host agent when running as a
//! guest) is served to clients over every enabled transport at once: the
//! OpenSSH named pipe, a WSL socket, a Cygwin/MSYS2 socket, a Hyper-V socket
//! and the Pageant window.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use keyrelay_capi::CapiBackend;
use keyrelay_core::config::Config;
use keyrelay_core::{AgentBackend, Multiplexer, Notifier, TracingNotifier};
use keyrelay_ssh_agent::{AgentSession, ForwardedBackend, Keyring};
use keyrelay_transport::{
    CygwinTransport, HyperVConnector, HyperVTransport, Listener, NamedPipeTransport,
    PageantTransport, Transport, WslTransport,
};
use keyrelayd::app::{self, App};
use keyrelayd::handler::SessionHandler;
use keyrelayd::{catalog, install};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(Debug, Parser)]
#[command(
    name = "keyrelayd",
    version,
    about = "SSH agent broker for Windows, WSL, Hyper-V and Pageant clients"
)]
struct Cli {
    /// Increase log verbosity; -vvv also writes a debug log to the home directory.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Register the Hyper-V guest communication service and exit.
    #[arg(short = 'i', long)]
    install_hyperv_service: bool,

    /// Do not offer keys from the Windows certificate store.
    #[arg(long)]
    disable_capi: bool,

    /// Config file (default: <config dir>/keyrelay/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Private key files (OpenSSH or PuTTY .ppk) to load at startup.
    keys: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    tracing::debug!("config: {}", config_path.display());

    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);

    if cli.install_hyperv_service {
        match install::install_hyperv_service(config.transport.hyperv.port) {
            Ok(()) => notifier.info(
                "hyper-v service installed",
                "Please reboot your computer to take effect!",
            ),
            Err(e) => notifier.error("hyper-v service install failed", &format!("{e:#}")),
        }
        return Ok(());
    }

    let guest = HyperVConnector::new(config.transport.hyperv.port)
        .host_reachable()
        .await;
    if guest {
        tracing::info!("hyper-v host agent found, running in guest mode");
    }

    let agent = Arc::new(build_agent(&config, cli.disable_capi, guest));
    tracing::info!(?agent, "agent ready");

    let key_files: Vec<PathBuf> = cli
        .keys
        .iter()
        .chain(&config.service.keys)
        .cloned()
        .collect();
    if !key_files.is_empty() {
        let loaded = catalog::preload(&agent, &key_files).await;
        tracing::info!(loaded, offered = key_files.len(), "preloaded key files");
    }

    let session = AgentSession::new(Arc::clone(&agent))
        .with_max_message_len(config.service.max_message_len);
    let mut app = App::new(
        Arc::new(SessionHandler::new(session)),
        Arc::clone(&notifier),
        config.service.grace_period(),
    );
    for transport in transports(&config, guest, dirs::home_dir()) {
        app.add_listener(Arc::new(Listener::new(transport, Arc::clone(&notifier))));
    }

    let report = app.run(app::shutdown_signal()).await;
    if !report.failed.is_empty() {
        tracing::warn!(failed = ?report.failed, "some transports did not run");
    }
    Ok(())
}

/// Logs go to stderr; with `-vvv` or `KEYRELAY_DEBUG=1` they are also
/// appended to `<home>/keyrelay-debug.log`.  `RUST_LOG` overrides the level.
fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let debug_log = verbose >= 3 || std::env::var("KEYRELAY_DEBUG").is_ok_and(|v| v == "1");
    let file_layer = match debug_log.then(dirs::home_dir).flatten() {
        Some(home) => {
            let path = home.join("keyrelay-debug.log");
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open debug log {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| {
            tracing::warn!("no config directory for this user; using current directory for config");
            PathBuf::from(".")
        })
        .join("keyrelay")
        .join("config.toml")
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!(
            "config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    // Key paths and transport settings should not be editable by others.
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mode = meta.mode();
                if mode & 0o077 != 0 {
                    tracing::warn!(
                        path = %path.display(),
                        mode = format!("{:o}", mode & 0o777),
                        "config file is readable by group or others, recommend: chmod 600 {}",
                        path.display()
                    );
                }
            }
            Err(e) => {
                tracing::warn!("could not check config file permissions: {e}");
            }
        }
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parse config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Guest mode forwards everything to the host agent.  Otherwise the keyring
/// is primary, with the certificate store behind it when available.
fn build_agent(config: &Config, disable_capi: bool, guest: bool) -> Multiplexer {
    if guest {
        let connector = Arc::new(HyperVConnector::new(config.transport.hyperv.port));
        return Multiplexer::new(Arc::new(ForwardedBackend::new(connector)));
    }

    let keyring: Arc<dyn AgentBackend> = Arc::new(Keyring::new());
    if disable_capi || config.service.disable_capi {
        return Multiplexer::new(keyring);
    }
    match CapiBackend::open() {
        Ok(capi) => Multiplexer::with_auxiliary(keyring, vec![Arc::new(capi) as Arc<dyn AgentBackend>]),
        Err(e) => {
            tracing::info!("certificate store backend not used: {e}");
            Multiplexer::new(keyring)
        }
    }
}

/// The enabled transports.  A guest does not listen on the Hyper-V service
/// itself; the host owns it.
fn transports(config: &Config, guest: bool, home: Option<PathBuf>) -> Vec<Arc<dyn Transport>> {
    let settings = &config.transport;
    let mut transports: Vec<Arc<dyn Transport>> = Vec::new();

    if settings.named_pipe.enabled {
        transports.push(Arc::new(NamedPipeTransport::new(
            settings.named_pipe.pipe_name.clone(),
        )));
    }
    match &home {
        Some(home) => {
            if settings.wsl.enabled {
                transports.push(Arc::new(WslTransport::new(
                    home.clone(),
                    settings.wsl.socket_name.clone(),
                    settings.wsl.relay_socket.clone(),
                )));
            }
            if settings.cygwin.enabled {
                transports.push(Arc::new(CygwinTransport::new(
                    home.clone(),
                    &settings.cygwin.socket_name,
                )));
            }
        }
        None => tracing::warn!("no home directory; WSL and Cygwin transports disabled"),
    }
    if settings.hyperv.enabled && !guest {
        transports.push(Arc::new(HyperVTransport::new(settings.hyperv.port)));
    }
    if settings.pageant.enabled {
        transports.push(Arc::new(PageantTransport::new()));
    }
    transports
}
