use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use crate::error::{Result, StoreError};
use crate::link::{self, ServerProfile};
use crate::probe;
use crate::session::{self, SessionConfig, SessionEvent, SessionHandle, SessionState};
use crate::store::{Settings, Store};
use crate::supervisor::{SupervisorConfig, DEFAULT_PROGRAM};

#[derive(Parser, Debug)]
#[command(name = "socksicle", version, about = "Shadowsocks client front-end for sslocal")]
struct Args {
    /// Directory holding servers.json, subscriptions.json and settings.json.
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,
    /// Local SOCKS5 port, overriding the saved setting.
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,
    #[arg(long, value_name = "PROGRAM", default_value = DEFAULT_PROGRAM)]
    sslocal: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show every server and subscription.
    List,
    /// Add a manual server from an ss:// link.
    Add { link: String },
    /// Delete a manual server by its index in `list`.
    Remove { index: usize },
    /// Print the ss:// link of a server.
    Share { index: usize },
    Sub {
        #[command(subcommand)]
        command: SubCommand,
    },
    /// TCP latency to every server.
    Ping,
    /// Country of a server's host.
    Geo { index: usize },
    /// Run the proxy for a server until interrupted.
    Connect {
        #[arg(default_value_t = 0)]
        index: usize,
    },
    Import { path: PathBuf },
    Export { path: PathBuf },
    /// Show or change saved settings.
    Settings {
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        port: Option<u16>,
        #[arg(long)]
        auto_connect: Option<bool>,
    },
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    Add { name: String, url: String },
    /// Re-fetch one subscription, or all of them.
    Update { name: Option<String> },
    Remove { name: String },
}

pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(execute(args)) {
        log::error!("{} ({})", e, e.code());
        std::process::exit(1);
    }
}

fn pick(store: &Store, index: usize) -> Result<ServerProfile> {
    store
        .all_profiles()
        .get(index)
        .map(|profile| (*profile).clone())
        .ok_or_else(|| StoreError::BadIndex(index).into())
}

fn human_bytes(bytes: u64) -> String {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    format!("{:.2} GB", bytes as f64 / GIB)
}

async fn execute(args: Args) -> Result<()> {
    let mut store = match args.config_dir {
        Some(dir) => Store::open(dir)?,
        None => Store::open_default()?,
    };

    match args.command {
        Command::List => list(&store),
        Command::Add { link } => {
            let profile = store.add_server(&link)?;
            println!("added {} ({})", profile.name(), profile.endpoint());
        }
        Command::Remove { index } => {
            let removed = store.remove_server(index)?;
            println!("removed {}", removed.name());
        }
        Command::Share { index } => println!("{}", link::encode(&pick(&store, index)?)),
        Command::Sub { command } => subscriptions(&mut store, command).await?,
        Command::Ping => ping(&store).await,
        Command::Geo { index } => {
            let profile = pick(&store, index)?;
            match probe::lookup_host(profile.host()).await {
                Some(geo) => println!(
                    "{} {} {} {}",
                    geo.flag,
                    geo.country_code,
                    geo.city.as_deref().unwrap_or("-"),
                    geo.ip
                ),
                None => println!("unknown"),
            }
        }
        Command::Connect { index } => {
            let profile = pick(&store, index)?;
            let config = SessionConfig {
                local_port: args.port.unwrap_or_else(|| store.settings().local_port()),
                supervisor: SupervisorConfig {
                    program: args.sslocal,
                    ..SupervisorConfig::default()
                },
                ..SessionConfig::default()
            };
            connect(config, profile).await?;
        }
        Command::Import { path } => {
            let summary = store.import_from(&path)?;
            println!(
                "imported {} servers, {} subscriptions",
                summary.servers, summary.subscriptions
            );
        }
        Command::Export { path } => {
            store.export_to(&path)?;
            println!("exported to {}", path.display());
        }
        Command::Settings { port, auto_connect } => {
            let mut settings: Settings = store.settings().clone();
            if let Some(port) = port {
                settings.local_port = port.to_string();
            }
            if let Some(auto_connect) = auto_connect {
                settings.auto_connect = auto_connect;
            }
            if &settings != store.settings() {
                store.set_settings(settings)?;
            }
            let settings = store.settings();
            println!("local_port   = {}", settings.local_port());
            println!("auto_connect = {}", settings.auto_connect);
        }
    }
    Ok(())
}

fn list(store: &Store) {
    let mut index = 0;
    for profile in store.servers() {
        println!("{index:>3}  {:<32} {}", profile.name(), profile.endpoint());
        index += 1;
    }
    for sub in store.subscriptions() {
        match sub.traffic {
            Some(quota) => println!(
                "[{}] {} / {} ({:.1}%)",
                sub.name,
                human_bytes(quota.used_bytes),
                human_bytes(quota.total_bytes),
                quota.used_percent()
            ),
            None => println!("[{}]", sub.name),
        }
        for profile in &sub.servers {
            println!("{index:>3}  {:<32} {}", profile.name(), profile.endpoint());
            index += 1;
        }
    }
}

async fn subscriptions(store: &mut Store, command: SubCommand) -> Result<()> {
    match command {
        SubCommand::Add { name, url } => {
            let count = store.add_subscription(&name, &url).await?;
            println!("{name}: {count} servers");
        }
        SubCommand::Update { name } => {
            let names: Vec<String> = match name {
                Some(name) => vec![name],
                None => store.subscriptions().iter().map(|s| s.name.clone()).collect(),
            };
            for name in names {
                match store.update_subscription(&name).await {
                    Ok(added) => println!("{name}: {added} new servers"),
                    Err(StoreError::EmptySubscription) => println!("{name}: no update available"),
                    Err(e) => return Err(e.into()),
                }
            }
        }
        SubCommand::Remove { name } => {
            store.remove_subscription(&name)?;
            println!("removed {name}");
        }
    }
    Ok(())
}

async fn ping(store: &Store) {
    let profiles: Vec<ServerProfile> = store.all_profiles().into_iter().cloned().collect();
    let mut rx = probe::ping_all(&profiles, probe::TCP_TIMEOUT);
    let mut latencies = vec![None; profiles.len()];
    while let Some(result) = rx.recv().await {
        if let Some(index) = result.target_index {
            latencies[index] = result.latency_ms;
        }
    }
    for (index, (profile, latency)) in profiles.iter().zip(latencies).enumerate() {
        let shown = match latency {
            Some(ms) => format!("{ms} ms"),
            None => "timeout".to_string(),
        };
        println!("{index:>3}  {:<32} {shown}", profile.name());
    }
}

/// Prints one event. Returns true once the session is over.
fn report(event: SessionEvent, handle: &SessionHandle) -> bool {
    match event {
        SessionEvent::StateChanged { state, .. } => state == SessionState::Disconnected,
        SessionEvent::Notice { message, is_error: true } => {
            eprintln!("error: {message}");
            handle.snapshot().state() == SessionState::Disconnected
        }
        SessionEvent::Notice { message, .. } => {
            println!("{message}");
            false
        }
        SessionEvent::Log(line) => {
            log::info!(target: "sslocal", "{line}");
            false
        }
        SessionEvent::Latency(_) => {
            println!("{}", handle.snapshot().latency_label());
            false
        }
        SessionEvent::Geo(_) => false,
        SessionEvent::Status(label) => {
            println!("{label}");
            false
        }
    }
}

async fn connect(config: SessionConfig, profile: ServerProfile) -> Result<()> {
    let port = config.local_port;
    let handle = session::spawn(config);
    let mut events = handle.subscribe();
    handle.connect(profile)?;
    println!("SOCKS5 on 127.0.0.1:{port}, Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if report(event, &handle) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => log::warn!("skipped {skipped} session events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    handle.shutdown().await
}
