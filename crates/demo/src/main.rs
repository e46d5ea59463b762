use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use tandem::{ClientSession, ConnectionState, Event, EventDelivery, NetConfig, NetServer};

const ECHO_COMMAND: u8 = 1;

#[derive(Parser)]
#[command(name = "tandem-demo")]
#[command(about = "Echo server and client exercising both session channels")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an echo server that authorizes every arrival.
    Serve {
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,

        #[arg(short, long, default_value_t = 4450)]
        tcp_port: u16,

        #[arg(short, long, default_value_t = 4451)]
        udp_port: u16,
    },
    /// Connect, send a message over both channels, print the echoes.
    Join {
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value_t = 4450)]
        tcp_port: u16,

        #[arg(short, long, default_value_t = 4451)]
        udp_port: u16,

        #[arg(short, long, default_value = "hello")]
        message: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Serve {
            bind,
            tcp_port,
            udp_port,
        } => serve(&bind, tcp_port, udp_port),
        Command::Join {
            host,
            tcp_port,
            udp_port,
            message,
        } => join(&host, tcp_port, udp_port, &message),
    }
}

fn serve(bind: &str, tcp_port: u16, udp_port: u16) -> Result<()> {
    let server = NetServer::bind(
        format!("{}:{}", bind, tcp_port),
        format!("{}:{}", bind, udp_port),
        NetConfig::default(),
        EventDelivery::Queued,
    )
    .context("failed to bind server sockets")?;
    log::info!(
        "echo server on {} / {}",
        server.local_tcp_addr(),
        server.local_udp_addr()
    );

    loop {
        for event in server.drain_events() {
            match event {
                Event::Connected { id } => {
                    log::info!("connection {} arrived, authorizing", id);
                    if let Err(e) = server.authorize(id) {
                        log::warn!("authorize {} failed: {}", id, e);
                    }
                }
                Event::Ready { id } => {
                    log::info!("connection {} ready", id);
                }
                Event::Disconnected { id } => {
                    log::info!("connection {} gone", id);
                }
                Event::AuthPacket { id, command, .. } => {
                    log::debug!("pre-auth packet {} from {}", command, id);
                }
                Event::ReliablePacket { id, command, payload } => {
                    if let Err(e) = server.send_reliable(id, command, &payload) {
                        log::warn!("echo to {} failed: {}", id, e);
                    }
                }
                Event::UnreliablePacket { id, command, payload } => {
                    if let Err(e) = server.send_unreliable(id, command, &payload, true) {
                        log::warn!("echo to {} failed: {}", id, e);
                    }
                }
            }
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn join(host: &str, tcp_port: u16, udp_port: u16, message: &str) -> Result<()> {
    let client = ClientSession::connect(
        host,
        tcp_port,
        udp_port,
        NetConfig::default(),
        EventDelivery::Queued,
    )
    .context("failed to reach server")?;

    let start = Instant::now();
    while client.state() != ConnectionState::Ready {
        if client.state() == ConnectionState::Disconnected {
            bail!("disconnected during handshake");
        }
        if start.elapsed() > Duration::from_secs(10) {
            bail!("handshake timed out");
        }
        thread::sleep(Duration::from_millis(10));
    }
    log::info!("ready as connection {}", client.client_id());

    client.send_reliable(ECHO_COMMAND, message.as_bytes())?;
    client.send_unreliable(ECHO_COMMAND, message.as_bytes(), true)?;

    let mut reliable_echo = false;
    let mut unreliable_echo = false;
    let start = Instant::now();
    while !(reliable_echo && unreliable_echo) {
        if start.elapsed() > Duration::from_secs(5) {
            bail!("echo timed out");
        }
        for event in client.drain_events() {
            match event {
                Event::ReliablePacket { payload, .. } => {
                    println!("reliable echo: {}", String::from_utf8_lossy(&payload));
                    reliable_echo = true;
                }
                Event::UnreliablePacket { payload, .. } => {
                    println!("unreliable echo: {}", String::from_utf8_lossy(&payload));
                    unreliable_echo = true;
                }
                Event::Disconnected { .. } => bail!("server dropped the session"),
                _ => {}
            }
        }
        thread::sleep(Duration::from_millis(10));
    }

    Ok(())
}
