//! maphub: a multi-client relay server for tabletop virtual-tabletop
//! sessions. Player and GM clients connect over TCP, speak a line-oriented
//! list protocol, and the server fans their messages out under privacy and
//! privilege rules while keeping a replayable snapshot of the game state
//! for late joiners.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mapwire::event::Event;
use mapwire::PROTOCOL_VERSION;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Instant;
use tracing::{info, warn};

mod auth;
mod dispatch;
mod lineio;
mod persist;
mod service;
mod session;
mod state;

use auth::{Authenticator, Passwords};
use dispatch::Ingest;
use lineio::LineReader;
use persist::Storage;
use service::{load_preamble, Service};
use session::{writer_task, ClientSession};

fn usage_and_exit() -> ! {
    eprintln!(
        "maphub (tabletop relay server)\n\n\
USAGE:\n  maphub [--endpoint HOST:PORT] [--init-file PATH] [--log-file PATH]\n         \
[--password-file PATH] [--database DIR] [--save-interval MINUTES]\n\n\
ENV:\n  MAPHUB_ENDPOINT        default 0.0.0.0:2323\n  MAPHUB_INIT_FILE       optional; \
preamble commands sent to each connecting client\n  MAPHUB_LOG_FILE        optional; append \
log here instead of stderr\n  MAPHUB_PASSWORD_FILE   optional; require authentication with \
this password file\n  MAPHUB_DATABASE        optional; directory for persistent game state\n  \
MAPHUB_SAVE_INTERVAL   default 10 (minutes); 0 disables periodic saves\n"
    );
    std::process::exit(2);
}

#[derive(Clone, Debug)]
struct Config {
    endpoint: String,
    init_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    password_file: Option<PathBuf>,
    database: Option<PathBuf>,
    save_interval_minutes: u64,
}

fn parse_args() -> Config {
    let mut cfg = Config {
        endpoint: std::env::var("MAPHUB_ENDPOINT").unwrap_or_else(|_| "0.0.0.0:2323".into()),
        init_file: std::env::var("MAPHUB_INIT_FILE").ok().map(PathBuf::from),
        log_file: std::env::var("MAPHUB_LOG_FILE").ok().map(PathBuf::from),
        password_file: std::env::var("MAPHUB_PASSWORD_FILE").ok().map(PathBuf::from),
        database: std::env::var("MAPHUB_DATABASE").ok().map(PathBuf::from),
        save_interval_minutes: std::env::var("MAPHUB_SAVE_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10),
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = || it.next().unwrap_or_else(|| usage_and_exit());
        match arg.as_str() {
            "--endpoint" => cfg.endpoint = value(),
            "--init-file" => cfg.init_file = Some(PathBuf::from(value())),
            "--log-file" => cfg.log_file = Some(PathBuf::from(value())),
            "--password-file" => cfg.password_file = Some(PathBuf::from(value())),
            "--database" => cfg.database = Some(PathBuf::from(value())),
            "--save-interval" => {
                cfg.save_interval_minutes = value().parse().unwrap_or_else(|_| usage_and_exit())
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }
    cfg
}

fn init_logging(cfg: &Config) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false);

    match &cfg.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(parse_args());
    init_logging(&cfg)?;
    info!(protocol = PROTOCOL_VERSION, "server starting");

    let passwords = match &cfg.password_file {
        Some(path) => {
            info!(path = %path.display(), "authentication enabled");
            Some(Passwords::load(path)?)
        }
        None => {
            warn!("authentication not enabled!");
            None
        }
    };

    let storage = match &cfg.database {
        Some(dir) => {
            info!(dir = %dir.display(), "using persistent game state");
            Some(Storage::open(dir)?)
        }
        None => {
            warn!("no database configured; state will not survive restarts");
            None
        }
    };

    let service = Arc::new(Service::new(storage, passwords));
    if let Some(storage) = &service.storage {
        *service.presets.write() = storage.load_presets().context("loading dice presets")?;
        storage
            .load_state(&mut service.state.write())
            .context("loading game state")?;
        info!(
            events = service.state.read().snapshot().len(),
            "game state restored"
        );
    }

    let listener = TcpListener::bind(&cfg.endpoint)
        .await
        .with_context(|| format!("binding {}", cfg.endpoint))?;
    info!(endpoint = %cfg.endpoint, "listening for clients");

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(supervisor(service.clone(), cfg.clone(), stop_tx));

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let service = service.clone();
                    let cfg = cfg.clone();
                    tokio::spawn(handle_connection(service, cfg, stream, addr));
                }
                Err(e) => warn!(err = %e, "error accepting incoming connection"),
            },
        }
    }
    drop(listener);

    info!("waiting for outstanding clients to exit");
    while !service.clients.read().is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    service.save();
    info!("server shut down");
    Ok(())
}

/// Handles everything that is not client traffic: shutdown and maintenance
/// signals, the keep-alive ping ticker (backing off while the table is
/// empty), and the periodic save ticker.
async fn supervisor(
    service: Arc<Service>,
    cfg: Arc<Config>,
    stop: tokio::sync::watch::Sender<bool>,
) {
    let mut hup = signal(SignalKind::hangup()).expect("installing SIGHUP handler");
    let mut int = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    let mut usr1 = signal(SignalKind::user_defined1()).expect("installing SIGUSR1 handler");
    let mut usr2 = signal(SignalKind::user_defined2()).expect("installing SIGUSR2 handler");

    let mut ping_minutes: u64 = 1;
    let ping = tokio::time::sleep(Duration::from_secs(60));
    tokio::pin!(ping);

    // A zero interval disables periodic saves; park the timer far away.
    let save_period = if cfg.save_interval_minutes == 0 {
        Duration::from_secs(3600 * 24 * 365)
    } else {
        Duration::from_secs(cfg.save_interval_minutes * 60)
    };
    let save_tick = tokio::time::sleep(save_period);
    tokio::pin!(save_tick);

    loop {
        tokio::select! {
            _ = hup.recv() => {
                info!("received SIGHUP; beginning graceful shutdown");
                service.accepting.store(false, Ordering::Relaxed);
                let _ = stop.send(true);
                return;
            }
            _ = int.recv() => {
                info!("received SIGINT; emergency shutdown");
                service.accepting.store(false, Ordering::Relaxed);
                for client in service.all_clients() {
                    warn!(client = %client.addr, "terminating client");
                    client.close_now();
                }
                let _ = stop.send(true);
                return;
            }
            _ = usr1.recv() => {
                service.state.read().log_dump();
            }
            _ = usr2.recv() => {
                info!("save requested by signal");
                service.save();
            }
            _ = &mut ping => {
                let any = service.ping_all();
                if any {
                    if ping_minutes != 1 {
                        info!("activity detected; reset ping timer to 1 minute");
                    }
                    ping_minutes = 1;
                } else {
                    let next = (ping_minutes * 2).min(60);
                    if next != ping_minutes {
                        info!(minutes = next, "no connections; backing off ping timer");
                    }
                    ping_minutes = next;
                }
                ping.as_mut().reset(Instant::now() + Duration::from_secs(60 * ping_minutes));
            }
            _ = &mut save_tick => {
                service.save();
                save_tick.as_mut().reset(Instant::now() + save_period);
            }
        }
    }
}

async fn handle_connection(
    service: Arc<Service>,
    cfg: Arc<Config>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    info!(client = %addr, "incoming connection");
    let (rd, wr) = stream.into_split();
    let (session, rx) = ClientSession::new(addr);
    let writer = tokio::spawn(writer_task(session.clone(), rx, wr));
    let mut reader = LineReader::new(rd);

    if let Err(e) = run_session(&service, &cfg, &mut reader, &session).await {
        info!(client = %addr, err = %e, "session ended");
    }

    service.remove_client(addr);
    session.close();
    let _ = writer.await;
}

async fn run_session<R: AsyncRead + Unpin>(
    service: &Arc<Service>,
    cfg: &Config,
    reader: &mut LineReader<R>,
    session: &Arc<ClientSession>,
) -> anyhow::Result<()> {
    if !service.accepting.load(Ordering::Relaxed) {
        session.send(&[
            "DENIED",
            "Server is not ready to accept connections. Try again later.",
        ]);
        anyhow::bail!("server not accepting new connections");
    }
    if let Err(e) = service.add_client(session.clone()) {
        session.send(&["DENIED", "Internal error setting up connection."]);
        return Err(e);
    }

    // Initial greeting commands, read fresh so edits apply to the next
    // connection without a restart.
    let mut sync_client = false;
    if let Some(path) = &cfg.init_file {
        match load_preamble(path) {
            Ok(preamble) => {
                for line in &preamble.lines {
                    session.send_raw(line);
                }
                sync_client = preamble.sync_on_connect;
            }
            Err(e) => warn!(client = %session.addr, err = %e, "error reading init file"),
        }
    }

    match &service.passwords {
        Some(passwords) => {
            authenticate_session(reader, session, passwords).await?;
            service.notify_peer_change(&session.username(), "authenticated");
        }
        None => {
            // no credentials configured; everyone is welcome
            session.authenticated.store(true, Ordering::Relaxed);
            session.send(&["OK", PROTOCOL_VERSION]);
            service.notify_peer_change(&session.username(), "joined");
        }
    }

    if sync_client {
        service.sync(session);
    }

    let mut ingest = Ingest::default();
    while !session.is_closing() {
        let line = tokio::select! {
            line = reader.read_line() => line?,
            _ = session.wait_closed() => break,
        };
        let Some(line) = line else {
            break; // clean EOF
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match Event::parse(trimmed, "", "") {
            Ok(ev) => service.execute(ev, session, &mut ingest),
            Err(e) => warn!(client = %session.addr, err = %e, "error in incoming event"),
        }
    }
    Ok(())
}

/// The authentication handshake:
/// ```text
/// -> OK <version> <challenge>
/// <- AUTH <response> [<user> [<client>]]
/// -> GRANTED <username>  |  DENIED <message>
/// ```
/// Intermediate `POLO`s are ignored; anything else draws a `PRIV` nudge.
async fn authenticate_session<R: AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
    session: &Arc<ClientSession>,
    passwords: &Passwords,
) -> anyhow::Result<()> {
    let mut auth = Authenticator::new(passwords);
    let challenge = auth.generate_challenge()?;
    session.send(&["OK", PROTOCOL_VERSION, challenge.as_str()]);

    loop {
        let Some(line) = reader.read_line().await? else {
            session.send(&["DENIED", "Unable to understand response"]);
            anyhow::bail!("EOF while waiting for authentication");
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let ev = match Event::parse(trimmed, "", "") {
            Ok(ev) => ev,
            Err(e) => {
                warn!(client = %session.addr, err = %e, "error in incoming event");
                continue;
            }
        };
        match ev.etype() {
            "POLO" => continue,
            "AUTH" => {
                if ev.fields.len() >= 3 {
                    auth.username = ev.fields[2].clone();
                    if let Some(personal) = passwords.users.get(&auth.username) {
                        auth.set_secret(personal);
                    }
                }
                if ev.fields.len() >= 4 {
                    auth.client_ident = ev.fields[3].clone();
                }

                if !auth.validate_response(&ev.fields[1]) {
                    warn!(client = %session.addr, user = %auth.username, "login incorrect");
                    session.send(&["DENIED", "Login incorrect"]);
                    anyhow::bail!("login incorrect");
                }

                if auth.gm_mode {
                    session.set_username("GM");
                    session.gm.store(true, Ordering::Relaxed);
                    session.authenticated.store(true, Ordering::Relaxed);
                    *session.client_ident.write() = auth.client_ident.clone();
                    session.send(&["GRANTED", "GM"]);
                    info!(client = %session.addr, "access granted for GM");
                    return Ok(());
                }

                let username = auth.username.to_lowercase();
                if username == "gm" {
                    warn!(client = %session.addr, "access denied to GM impersonator");
                    session.send(&["DENIED", "You are not the GM."]);
                    anyhow::bail!("login incorrect");
                }

                session.set_username(&username);
                session.authenticated.store(true, Ordering::Relaxed);
                *session.client_ident.write() = auth.client_ident.clone();
                session.send(&["GRANTED", username.as_str()]);
                info!(client = %session.addr, user = %username, "access granted");
                return Ok(());
            }
            _ => {
                session.send(&[
                    "PRIV",
                    "Not authorized for that operation until authenticated.",
                ]);
            }
        }
    }
}
