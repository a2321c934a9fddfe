//! `pam-client`: command-line front end for the just-in-time access service.
//!
//! Usage: pam-client [--api-url URL] [--data-dir DIR] <command> ...

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use pam_client::bridge::{ChannelStatus, LiveBridge};
use pam_client::config::{self, ClientConfig};
use pam_client::credentials::FileCredentialStore;
use pam_client::error::PamError;
use pam_client::gateway::{Gateway, ReqwestTransport};
use pam_client::lifecycle::{JitRequest, NewJitRequest, SessionController, SessionTicket};
use pam_client::replay::{self, ReplayEngine, ReplayHandle, ReplayStatus};
use pam_client::surface::StdoutSurface;
use pam_client::updates::UpdatesFeed;

/// Ctrl-]
const DETACH_BYTE: u8 = 0x1d;

#[derive(Parser, Debug)]
#[command(name = "pam-client")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Base URL of the access API
    #[arg(long, global = true, env = "PAM_API_URL", default_value = config::DEFAULT_API_URL)]
    api_url: String,

    /// Directory holding the credential file
    #[arg(long, global = true, env = "PAM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log filter (e.g. warn, debug, pam_client=trace)
    #[arg(long, global = true, env = "PAM_LOG", default_value = config::DEFAULT_LOG_LEVEL)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in and store the token pair
    Login {
        email: String,
        #[arg(long, env = "PAM_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Create an account and log in
    Register {
        email: String,
        #[arg(long, env = "PAM_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        admin: bool,
    },

    /// Forget the stored credentials
    Logout,

    /// Show the logged-in identity
    Whoami {
        /// Re-read the identity from the server
        #[arg(long)]
        refresh: bool,
    },

    /// Request access to an asset
    Request {
        asset_id: i64,
        role_id: i64,
        #[arg(short, long, default_value = "")]
        reason: String,
        /// Access window in minutes
        #[arg(short, long, default_value = "60")]
        duration: i64,
    },

    /// List access requests
    #[command(alias = "ls")]
    Requests {
        /// Only requests waiting for a decision
        #[arg(long, conflicts_with = "startable")]
        pending: bool,
        /// Only requests a session can be started from now
        #[arg(long)]
        startable: bool,
    },

    /// Approve a pending request (admin)
    Approve {
        jit_request_id: i64,
        /// Current TOTP code
        #[arg(long)]
        mfa: String,
    },

    /// Deny a pending request (admin)
    Deny {
        jit_request_id: i64,
        #[arg(long)]
        mfa: String,
    },

    /// Start a session from an approved request and attach to it
    Start { jit_request_id: i64 },

    /// List sessions
    Sessions,

    /// Show the commands typed in a session
    Commands {
        session_id: i64,
        #[arg(short = 'n', long)]
        limit: Option<u32>,
    },

    /// Replay a finished session
    Replay {
        #[arg(required_unless_present = "file")]
        session_id: Option<i64>,
        /// Play a recording saved with `export`
        #[arg(long, conflicts_with = "session_id")]
        file: Option<PathBuf>,
    },

    /// Save a session recording (gzip when PATH ends in .gz)
    Export { session_id: i64, path: PathBuf },

    /// Follow live request/session updates (admin)
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    if let Err(e) = run(cli).await {
        if let Some(pam) = e.downcast_ref::<PamError>() {
            if pam.is_auth_failure() {
                eprintln!("[pam] not logged in; run `pam-client login <email>`");
            }
        }
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = ClientConfig::new(&cli.api_url, cli.data_dir, &cli.log_level)?;
    let store = Arc::new(FileCredentialStore::open(config.credentials_path()));
    let transport = Arc::new(ReqwestTransport::new(&config.api_url)?);
    let gateway = Arc::new(Gateway::new(transport, store));
    let controller = Arc::new(SessionController::new(Arc::clone(&gateway)));
    let _listener = controller.spawn_unauthorized_listener();

    match cli.command {
        Commands::Login { email, password } => {
            let identity = gateway.login(&email, &password).await?;
            println!("Logged in as {}{}", identity.email, admin_suffix(identity.is_admin));
        }
        Commands::Register {
            email,
            password,
            admin,
        } => {
            let identity = gateway.register(&email, &password, admin).await?;
            println!("Registered {}{}", identity.email, admin_suffix(identity.is_admin));
        }
        Commands::Logout => {
            controller.logout()?;
            println!("Logged out");
        }
        Commands::Whoami { refresh } => {
            let identity = if refresh {
                Some(gateway.refresh_identity().await?)
            } else {
                controller.identity()
            };
            match identity {
                Some(identity) => {
                    println!("id:      {}", identity.id);
                    println!("email:   {}", identity.email);
                    println!("admin:   {}", identity.is_admin);
                    println!("mfa:     {}", identity.mfa_enabled);
                    if !identity.roles.is_empty() {
                        println!("roles:   {}", identity.roles.join(", "));
                    }
                }
                None => println!("Not logged in"),
            }
        }
        Commands::Request {
            asset_id,
            role_id,
            reason,
            duration,
        } => {
            let created = controller
                .submit_request(&NewJitRequest {
                    asset_id,
                    role_id,
                    reason,
                    duration_minutes: duration,
                })
                .await?;
            println!("Request {} submitted ({})", created.id, created.status);
        }
        Commands::Requests { pending, startable } => {
            let now = Utc::now();
            let requests = if pending {
                controller.pending_queue().await?
            } else if startable {
                controller.startable_requests(now).await?
            } else {
                controller.list_requests().await?
            };
            print_requests(&requests, now);
        }
        Commands::Approve {
            jit_request_id,
            mfa,
        } => {
            if let Some(note) = decision_note(controller.can_decide()) {
                eprintln!("{note}");
            }
            let decided = controller.approve(jit_request_id, &mfa).await?;
            println!("Request {} is {}", decided.id, decided.status);
        }
        Commands::Deny {
            jit_request_id,
            mfa,
        } => {
            if let Some(note) = decision_note(controller.can_decide()) {
                eprintln!("{note}");
            }
            let decided = controller.deny(jit_request_id, &mfa).await?;
            println!("Request {} is {}", decided.id, decided.status);
        }
        Commands::Start { jit_request_id } => {
            let ticket = controller.start_session(jit_request_id).await?;
            let result = attach(&ticket).await;
            controller.tickets().remove(ticket.session_id);
            result?;
        }
        Commands::Sessions => {
            let sessions = controller.list_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions");
            }
            for s in sessions {
                println!(
                    "{:>6}  request {:<6} {:<7} started {}  ended {}",
                    s.id,
                    s.jit_request_id,
                    s.status.to_string(),
                    fmt_time(s.started_at),
                    fmt_time(s.ended_at),
                );
            }
        }
        Commands::Commands { session_id, limit } => {
            for entry in controller.command_log(session_id, limit).await? {
                let at = DateTime::from_timestamp_millis((entry.ts * 1000.0) as i64);
                println!("{}  {}", fmt_time(at), entry.line);
            }
        }
        Commands::Replay { session_id, file } => {
            let surface = StdoutSurface::new(false);
            let handle = match (file, session_id) {
                (Some(path), _) => replay::play_file(&path, surface),
                (None, Some(id)) => ReplayEngine::new(Arc::clone(&gateway)).play(id, surface),
                (None, None) => bail!("a session id or --file is required"),
            };
            let status = run_replay(handle).await?;
            if status == ReplayStatus::Unavailable {
                bail!("{status}");
            }
            eprintln!("\r\n[pam] {status}");
        }
        Commands::Export { session_id, path } => {
            let count = ReplayEngine::new(Arc::clone(&gateway))
                .export_recording(session_id, &path)
                .await?;
            println!("Saved {} entries to {}", count, path.display());
        }
        Commands::Watch => {
            let mut feed = UpdatesFeed::connect(&config)
                .await
                .context("failed to connect to the update feed")?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = feed.next() => match event {
                        Some(Ok(event)) => match event.session_id {
                            Some(id) => println!("{}  {}  session {}", fmt_time(Some(Utc::now())), event.kind, id),
                            None => println!("{}  {}", fmt_time(Some(Utc::now())), event.kind),
                        },
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    },
                }
            }
            let _ = feed.close().await;
        }
    }

    Ok(())
}

// ── Live attach ─────────────────────────────────────────────────────

async fn attach(ticket: &SessionTicket) -> Result<()> {
    let interactive = io::stdin().is_terminal();
    eprintln!("[pam] session {} (Ctrl-] to detach)", ticket.session_id);

    let surface = StdoutSurface::new(interactive);
    let bridge = LiveBridge::open(ticket, surface)?;
    let mut status = bridge.status_changes();
    let mut input = spawn_stdin_reader();
    let mut winch = signal(SignalKind::window_change())?;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                debug!(status = %current, "live channel status");
                if current == ChannelStatus::Closed {
                    break;
                }
            }
            chunk = input.recv() => match chunk {
                Some(data) => {
                    if let Some(pos) = data.iter().position(|b| *b == DETACH_BYTE) {
                        bridge.send_input(&data[..pos]);
                        break;
                    }
                    bridge.send_input(&data);
                }
                None => break,
            },
            _ = winch.recv() => bridge.refit(),
        }
    }

    bridge.shutdown().await;
    eprintln!("\r\n[pam] {}", ChannelStatus::Closed);
    Ok(())
}

/// Blocking stdin reader on its own thread so a pending read never holds
/// up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

// ── Replay ──────────────────────────────────────────────────────────

async fn run_replay(handle: ReplayHandle<StdoutSurface>) -> Result<ReplayStatus> {
    let mut status = handle.status_changes();
    let mut winch = signal(SignalKind::window_change())?;
    let last = loop {
        tokio::select! {
            done = status.wait_for(|s| s.is_terminal()) => {
                break match done {
                    Ok(s) => *s,
                    Err(_) => handle.status(),
                };
            }
            _ = tokio::signal::ctrl_c() => break handle.status(),
            _ = winch.recv() => handle.refit(),
        }
    };
    handle.shutdown().await;
    Ok(last)
}

// ── Output helpers ──────────────────────────────────────────────────

/// Shown before approve/deny when the cached identity is not an admin.
/// The call still goes out; the server has the final say.
fn decision_note(can_decide: bool) -> Option<&'static str> {
    (!can_decide).then_some("pam-client: not signed in as an admin; the server will likely refuse this")
}

fn admin_suffix(is_admin: bool) -> &'static str {
    if is_admin {
        " (admin)"
    } else {
        ""
    }
}

fn fmt_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_requests(requests: &[JitRequest], now: DateTime<Utc>) {
    if requests.is_empty() {
        println!("No requests");
        return;
    }
    println!(
        "{:>6}  {:>6}  {:>6}  {:>6}  {:<8}  {:>5}  {:<19}  REASON",
        "ID", "USER", "ASSET", "ROLE", "STATUS", "MIN", "EXPIRES"
    );
    for r in requests {
        println!(
            "{:>6}  {:>6}  {:>6}  {:>6}  {:<8}  {:>5}  {:<19}  {}",
            r.id,
            r.user_id,
            r.asset_id,
            r.role_id,
            r.effective_status(now).to_string(),
            r.duration_minutes,
            fmt_time(r.expires_at),
            r.reason,
        );
    }
}
