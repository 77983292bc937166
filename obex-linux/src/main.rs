// obexd: OBEX over TCP folder server and client commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use obex_core::HeaderSet;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use obex_linux::config;
use obex_linux::handler::{FOLDER_BROWSING, FOLDER_LISTING_TYPE};
use obex_linux::{server, ClientSession, FolderHandler, TcpConnector, Trigger};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: obexd [--version] <command>
  serve                          serve the configured folder
  put <host:port> <file>         send a file
  get <host:port> <name> [out]   fetch a file
  delete <host:port> <name>      delete a file
  ls <host:port>                 print the remote folder listing";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Serve,
    Put { addr: String, file: PathBuf },
    Get { addr: String, name: String, out: Option<PathBuf> },
    Delete { addr: String, name: String },
    List { addr: String },
}

impl Command {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let cmd = match args.as_slice() {
            ["serve"] => Command::Serve,
            ["put", addr, file] => Command::Put {
                addr: addr.to_string(),
                file: PathBuf::from(file),
            },
            ["get", addr, name] => Command::Get {
                addr: addr.to_string(),
                name: name.to_string(),
                out: None,
            },
            ["get", addr, name, out] => Command::Get {
                addr: addr.to_string(),
                name: name.to_string(),
                out: Some(PathBuf::from(out)),
            },
            ["delete", addr, name] => Command::Delete {
                addr: addr.to_string(),
                name: name.to_string(),
            },
            ["ls", addr] => Command::List {
                addr: addr.to_string(),
            },
            _ => bail!("{}", USAGE),
        };
        Ok(cmd)
    }

    fn addr(&self) -> Option<&str> {
        match self {
            Command::Serve => None,
            Command::Put { addr, .. }
            | Command::Get { addr, .. }
            | Command::Delete { addr, .. }
            | Command::List { addr } => Some(addr),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("obexd {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "obexd=info,obex_linux=info,obex_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let command = Command::parse(&args)?;
    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match command {
            Command::Serve => serve(cfg).await,
            other => run_client(other, cfg).await,
        }
    })
}

async fn serve(cfg: config::Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cfg.root_dir)
        .with_context(|| format!("creating {}", cfg.root_dir.display()))?;
    let listener = TcpListener::bind((cfg.listen_addr.as_str(), cfg.port))
        .await
        .with_context(|| format!("binding {}:{}", cfg.listen_addr, cfg.port))?;
    tracing::info!(root = %cfg.root_dir.display(), "serving folder");

    let shutdown = Trigger::new();
    let root = cfg.root_dir.clone();
    let allow_create = cfg.allow_create;
    let max_object_size = cfg.max_object_size;
    let server = tokio::spawn(server::serve(
        listener,
        Arc::new(cfg.server_options()),
        move || {
            FolderHandler::new(root.clone(), allow_create).with_max_object_size(max_object_size)
        },
        shutdown.clone(),
    ));
    shutdown_signal().await?;
    shutdown.fire();
    server.await??;
    Ok(())
}

async fn run_client(command: Command, cfg: config::Config) -> anyhow::Result<()> {
    let Some(addr) = command.addr() else {
        bail!("{}", USAGE);
    };
    let connector = TcpConnector::new(addr);
    let mut session = ClientSession::open(&connector, cfg.mtu)
        .await
        .with_context(|| format!("connecting to {}", addr))?;
    session.set_timeout(cfg.timeout());
    if let Some(credentials) = cfg.credentials() {
        session.set_credentials(credentials);
    }

    let mut hello = HeaderSet::new();
    if matches!(command, Command::List { .. }) {
        hello.set_target(FOLDER_BROWSING.as_bytes().to_vec());
    }
    session.connect(hello).await?;

    match &command {
        Command::Put { file, .. } => {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .context("file has no name")?;
            let data = tokio::fs::read(file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let mut headers = HeaderSet::new();
            headers.set_name(name.as_str());
            headers.set_object_length(data.len() as u64);
            let mut op = session.put(headers)?;
            op.write(&data).await?;
            let code = op.close().await?;
            tracing::info!(%name, len = data.len(), %code, "sent");
        }
        Command::Get { name, out, .. } => {
            let mut headers = HeaderSet::new();
            headers.set_name(name.as_str());
            let mut op = session.get(headers).await?;
            let data = op.read_to_end().await?;
            drop(op);
            let out = out.clone().unwrap_or_else(|| PathBuf::from(name));
            tokio::fs::write(&out, &data)
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            tracing::info!(%name, len = data.len(), "received");
        }
        Command::Delete { name, .. } => {
            let mut headers = HeaderSet::new();
            headers.set_name(name.as_str());
            session.delete(headers).await?;
            tracing::info!(%name, "deleted");
        }
        Command::List { .. } => {
            let mut headers = HeaderSet::new();
            headers.set_type(FOLDER_LISTING_TYPE)?;
            let mut op = session.get(headers).await?;
            let listing = op.read_to_end().await?;
            drop(op);
            print!("{}", String::from_utf8_lossy(&listing));
        }
        Command::Serve => bail!("{}", USAGE),
    }

    session.disconnect(HeaderSet::new()).await?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
