use chatline_core::backend::Credentials;
use chatline_core::config;
use chatline_core::controller::{Action, NoticeLevel, Phase, SessionController, Update};
use chatline_core::credentials::FileCredentialStore;
use chatline_core::store::Message;
use chatline_core::transport::{ConnectionState, WsTransport};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "chatline")]
#[command(about = "Chatline CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config with one relay account (alice/pw).
    Init {
        /// Config file path (default: CHATLINE_CONFIG_PATH or ~/.chatline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the dev relay (in-memory chat backend, HTTP + WebSocket on one port).
    Relay {
        /// Config file path (default: CHATLINE_CONFIG_PATH or ~/.chatline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 17171)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Join the chat room (interactive). Commands: /login <user> <password>, /logout, /quit.
    Chat {
        /// Config file path (default: CHATLINE_CONFIG_PATH or ~/.chatline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("chatline {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Relay { config, port }) => {
            if let Err(e) = run_relay(config, port).await {
                log::error!("relay failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config }) => {
            if let Err(e) = run_chat(config).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = chatline_core::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_relay(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, _) = config::load_config(config_path)?;
    if let Some(p) = port {
        config.relay.port = p;
    }
    log::info!("starting relay on {}:{}", config.relay.bind, config.relay.port);
    chatline_core::relay::run_relay(config).await
}

/// What a line typed at the prompt means.
#[derive(Debug)]
enum Input {
    Action(Action),
    Quit,
    Usage(&'static str),
    Empty,
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Action(Action::Send(line.to_string()));
    };
    let mut parts = command.split_whitespace();
    match parts.next().unwrap_or_default() {
        "login" => match (parts.next(), parts.next(), parts.next()) {
            (Some(username), Some(password), None) => Input::Action(Action::Login(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            })),
            _ => Input::Usage("usage: /login <user> <password>"),
        },
        "logout" => Input::Action(Action::Logout),
        "quit" | "exit" => Input::Quit,
        _ => Input::Usage("commands: /login <user> <password>, /logout, /quit"),
    }
}

fn render_message(m: &Message) -> String {
    format!(
        "[{}] {}: {}",
        m.created_at.with_timezone(&chrono::Local).format("%H:%M"),
        m.author,
        m.content
    )
}

fn render(update: &Update) -> Option<String> {
    match update {
        Update::Phase(Phase::LoginRequired) => {
            Some("* log in with /login <user> <password>".to_string())
        }
        Update::Phase(Phase::LoggedOut) => Some("* logged out".to_string()),
        Update::Phase(_) => None,
        Update::Connection(ConnectionState::Connected) => Some("* connected".to_string()),
        Update::Connection(_) => None,
        Update::Notice(n) => Some(match n.level {
            NoticeLevel::Info => format!("* {}", n.text),
            NoticeLevel::Danger => format!("! {}", n.text),
        }),
        Update::MessageAdded(m) => Some(render_message(m)),
        Update::HistoryLoaded { messages, added } if *added > 0 => Some(
            messages
                .iter()
                .map(render_message)
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Update::HistoryLoaded { .. } => None,
        Update::SendConfirmed(_) | Update::SendUnconfirmed(_) => None,
        Update::SessionChanged(Some(name)) => Some(format!("* logged in as {}", name)),
        Update::SessionChanged(None) => None,
    }
}

async fn run_chat(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    let url = config::resolve_client_url(&config);
    let credentials_path = config::resolve_credentials_path(&config, &path);
    let credentials = FileCredentialStore::load(&credentials_path).await;
    log::info!(
        "chat: backend {}, credentials {}",
        url,
        credentials.path().display()
    );

    let (transport, events) = WsTransport::new(&url, &config.client);
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let (actions_tx, actions_rx) = mpsc::unbounded_channel();

    let mut controller = SessionController::new(
        Arc::new(transport),
        Arc::new(credentials),
        &config.client,
        updates_tx,
    );
    let session = tokio::spawn(async move {
        controller
            .start(std::future::ready(Ok::<(), std::convert::Infallible>(())))
            .await;
        controller.run(events, actions_rx).await;
    });

    let printer = tokio::spawn(async move {
        while let Some(update) = updates_rx.recv().await {
            if let Some(line) = render(&update) {
                println!("{}", line);
            }
        }
    });

    // Blocking stdin lives on its own thread; lines become controller actions.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let action = match parse_input(&line) {
                Input::Action(action) => action,
                Input::Quit => break,
                Input::Usage(text) => {
                    eprintln!("{}", text);
                    continue;
                }
                Input::Empty => continue,
            };
            if actions_tx.send(action).is_err() {
                return;
            }
        }
        let _ = actions_tx.send(Action::Shutdown);
    });

    session.await?;
    printer.await?;
    Ok(())
}
