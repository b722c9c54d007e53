use rndz_chat::{
    discovery::PublicLookup,
    rendezvous::{self, Server},
    start, Config, Discovery, Error, Inbound, Rendezvous, Result, SessionOptions, SharedKey,
    Target,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use structopt::StructOpt;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::select;

#[derive(StructOpt, Debug)]
#[structopt(name = "rndz-chat")]
enum Opt {
    /// Connect to a peer and chat.
    Client(ClientOpt),
    /// Run the rendezvous server.
    Server(ServerOpt),
    /// Print a new random pre-shared key.
    Keygen,
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "config", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Username to register under.
    #[structopt(long = "id")]
    id: Option<String>,

    /// Rendezvous server url, overrides the config file.
    #[structopt(long = "server-url")]
    server_url: Option<String>,

    /// Pre-shared key as 64 hex digits, overrides the config file.
    #[structopt(long = "key")]
    key: Option<String>,

    #[structopt(long = "bind-addr")]
    bind_addr: Option<SocketAddr>,

    /// Treat any bidirectional punch traffic as established.
    #[structopt(long = "cgnat")]
    cgnat: bool,

    /// Username of the peer to look up.
    #[structopt(long = "peer")]
    peer: Option<String>,

    /// Punch this address directly, skipping the lookup.
    #[structopt(long = "peer-addr")]
    peer_addr: Option<SocketAddr>,

    /// Scan the port range of this ip.
    #[structopt(long = "scan")]
    scan: Option<IpAddr>,

    /// Punch the scan listen port of this ip and wait to be found.
    #[structopt(long = "beacon")]
    beacon: Option<IpAddr>,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    /// The `PORT` environment variable overrides the port.
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:5000")]
    listen_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Server(opt) => run_server(opt).await,
        Opt::Client(opt) => run_client(opt).await,
        Opt::Keygen => {
            println!("{}", SharedKey::generate().to_hex());
            Ok(())
        }
    }
}

async fn run_server(opt: ServerOpt) -> Result<()> {
    let mut listen_addr = opt.listen_addr;
    if let Ok(port) = std::env::var("PORT") {
        let port = port
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("PORT={:?} is not a port", port)))?;
        listen_addr.set_port(port);
    }

    Server::new(listen_addr).await?.run().await
}

fn target(opt: &ClientOpt) -> Result<Target> {
    let mut targets = Vec::new();
    if let Some(peer) = &opt.peer {
        targets.push(Target::Peer(peer.clone()));
    }
    if let Some(addr) = opt.peer_addr {
        targets.push(Target::Address(addr));
    }
    if let Some(ip) = opt.scan {
        targets.push(Target::Scan(ip));
    }
    if let Some(ip) = opt.beacon {
        targets.push(Target::Beacon(ip));
    }

    match targets.len() {
        1 => Ok(targets.remove(0)),
        0 => Err(Error::Config(
            "one of --peer, --peer-addr, --scan or --beacon is required".into(),
        )),
        _ => Err(Error::Config(
            "--peer, --peer-addr, --scan and --beacon are exclusive".into(),
        )),
    }
}

async fn run_client(opt: ClientOpt) -> Result<()> {
    let mut config = match &opt.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if opt.key.is_some() {
        config.key = opt.key.clone();
    }
    if let Some(addr) = opt.bind_addr {
        config.client.bind_addr = addr;
    }
    config.client.cgnat_mode |= opt.cgnat;
    config.validate()?;

    let target = target(&opt)?;
    if matches!(target, Target::Peer(_)) && opt.id.is_none() {
        return Err(Error::Config("--peer needs --id to register under".into()));
    }

    let key = config.key()?;
    let server_url = opt.server_url.clone().unwrap_or_else(|| config.server_url());
    let client = rendezvous::Client::new(&server_url, config.retry())?;
    let lookup = PublicLookup::new(config.stun_timeout())?;
    let discovery = Discovery::new(lookup, config.stun.servers.clone())
        .with_fallback(config.stun.echo.clone());

    let options = SessionOptions {
        bind_addr: config.client.bind_addr,
        punch: config.punch(),
        keepalive: config.keepalive(),
        recv_timeout: config.recv_timeout(),
    };
    let rdv = opt.id.as_deref().map(|username| Rendezvous {
        client: &client,
        username,
    });

    let mut session = start(options, &key, &discovery, rdv, target).await?;
    let mut inbox = session
        .inbox()
        .ok_or_else(|| Error::Config("session inbox already taken".into()))?;

    if let Some(remote) = session.remote() {
        println!("connected to {}, type /quit to leave", remote);
    }

    let mut lines = BufReader::new(stdin()).lines();
    loop {
        select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" {
                    break;
                }
                if let Err(e) = session.send(text).await {
                    log::warn!("send failed: {}", e);
                }
            }
            inbound = inbox.recv() => match inbound {
                Some(Inbound::Message { from, text }) => println!("[{}] {}", from, text),
                Some(Inbound::Undeliverable { from, error }) => {
                    println!("[{}] <undeliverable message: {}>", from, error)
                }
                None => break,
            }
        }
    }

    session.close().await;
    Ok(())
}
