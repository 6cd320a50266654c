//! Selkie server binary
//!
//! TigerStyle: thin boot shell with explicit exit codes.
//!
//! Exit codes: 0 on a clean stop, the code passed to `exit(code)` by a
//! service otherwise, -1 on startup failure (lock file, missing config,
//! boot service failure).

use anyhow::{bail, Context, Result};
use clap::Parser;
use selkie_core::{Buffer, ServerConfigFile};
use selkie_core::message::PTYPE_TEXT;
use selkie_runtime::{Server, Service, ServiceConf, ServiceContext};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Selkie multi-worker service server
#[derive(Parser, Debug)]
#[command(name = "selkie")]
#[command(about = "Hosts a fleet of message-passing services over worker threads")]
#[command(version)]
struct Cli {
    /// Server id; selects this node's entry in config.json
    #[arg(default_value_t = 1)]
    sid: u32,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            std::process::exit(-1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let lock = LockFile::acquire(cli.sid)?;

    let config_text = std::fs::read_to_string("config.json").map_err(|_| {
        selkie_core::Error::ConfigMissing {
            path: "config.json".into(),
        }
    })?;
    let config = ServerConfigFile::parse(&config_text)?;
    let Some(node) = config.find(cli.sid) else {
        bail!("config for sid={} not found", cli.sid);
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(node.loglevel.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!(sid = node.sid, name = %node.name, workers = node.thread, "Booting");

    let server = Server::new(node.thread)?;
    server.register("echo", || Box::new(EchoService) as Box<dyn Service>);

    server.set_env("sid", &node.sid.to_string());
    server.set_env("name", &node.name);
    server.set_env("inner_host", &node.inner_host);
    server.set_env("outer_host", &node.outer_host);
    server.set_env("server_config", &config_text);

    server.start()?;
    hook_signals(&server);

    for entry in &node.services {
        let conf = ServiceConf {
            name: entry.name.clone(),
            unique: entry.unique,
            shared: entry.shared,
            worker_hint: entry.threadid,
            params: if entry.config.is_null() {
                String::new()
            } else {
                entry.config.to_string()
            },
        };
        server
            .new_service(&entry.kind, conf, selkie_core::ServiceId::ZERO, 0)
            .with_context(|| format!("boot service {:?} failed", entry.kind))?;
    }

    let code = server.run();
    lock.release();
    Ok(code)
}

/// Stop the server on SIGINT/SIGTERM; workers drain before the process ends
fn hook_signals(server: &Arc<Server>) {
    let server = server.clone();
    std::thread::Builder::new()
        .name("selkie-signals".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "Signal watcher unavailable");
                    return;
                }
            };
            runtime.block_on(async {
                #[cfg(unix)]
                {
                    use tokio::signal::unix::{signal, SignalKind};
                    let mut term = match signal(SignalKind::terminate()) {
                        Ok(s) => s,
                        Err(e) => {
                            error!(error = %e, "SIGTERM hook failed");
                            return;
                        }
                    };
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                        _ = term.recv() => info!("SIGTERM received"),
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Ctrl-C received");
                }
            });
            server.stop(0);
        })
        .ok();
}

/// `<sid>.lock`, holding the decimal sid
///
/// A present lock either belongs to a live instance (abort) or was left by
/// a crash (warn and continue after removing it).
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(sid: u32) -> Result<Self> {
        let path = PathBuf::from(format!("{}.lock", sid));
        if path.exists() {
            if std::fs::remove_file(&path).is_err() {
                return Err(selkie_core::Error::LockFileHeld {
                    path: path.display().to_string(),
                }
                .into());
            }
            // logging is not up yet during lock acquisition
            eprintln!("warn: server sid={} last run did not close cleanly", sid);
        }
        std::fs::write(&path, sid.to_string())
            .with_context(|| format!("writing lock file {:?}", path))?;
        Ok(Self { path })
    }

    fn release(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Diagnostic service: replies to any text message with the same payload
/// and the negated session
struct EchoService;

impl Service for EchoService {
    fn init(&mut self, _ctx: &ServiceContext, _params: &str) -> bool {
        true
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: selkie_core::Message) {
        if msg.ptype() == PTYPE_TEXT && msg.session() != 0 && !msg.sender().is_zero() {
            let _ = ctx.send(
                msg.sender(),
                Some(Buffer::from(msg.bytes())),
                msg.header(),
                -msg.session(),
                PTYPE_TEXT,
            );
        }
    }
}
