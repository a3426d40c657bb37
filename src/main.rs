use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};

use lumo_client::{ChatSettings, ChatState, ChatStatus, ChatStore, RpcClient};
use lumo_core::chat::{ChatRole, OpenAIModel};
use lumo_core::item::{CreateItemInput, UpdateItemInput};
use lumo_llm::OpenAiProvider;
use lumo_server::ServerConfig;
use lumo_store::Database;
use lumo_telemetry::{LogQuery, TelemetryConfig, TelemetryGuard};

#[derive(Parser)]
#[command(name = "lumo", version, about = "Items and streaming chat over a small RPC server")]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines (also `LUMO_LOG_JSON=1`).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the RPC server.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        /// SQLite database file.
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Manage items on a running server.
    Item {
        /// Server URL (default `LUMO_SERVER_URL` or http://localhost:3001).
        #[arg(long, global = true)]
        server: Option<String>,
        #[command(subcommand)]
        action: ItemAction,
    },
    /// Interactive chat against a running server.
    Chat {
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        model: Option<OpenAIModel>,
    },
    /// Show persisted warn and error logs, newest first.
    Logs {
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        request_id: Option<String>,
        #[arg(long)]
        procedure: Option<String>,
        /// Substring of the emitting module path.
        #[arg(long)]
        target: Option<String>,
        /// RFC 3339 lower bound on the timestamp.
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        /// Log database (default `~/.lumo/logs.db`).
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ItemAction {
    List,
    Get {
        id: i64,
    },
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Delete {
        id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let serving = matches!(cli.command, Command::Serve { .. });
    let json_env = std::env::var("LUMO_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    let mut config = TelemetryConfig {
        log_level: match (cli.verbose, serving) {
            (true, _) => Level::DEBUG,
            (false, true) => Level::INFO,
            (false, false) => Level::WARN,
        },
        json: cli.log_json || json_env,
        log_to_sqlite: serving,
        ..Default::default()
    };
    if let Command::Logs { db, .. } = &cli.command {
        config.log_to_sqlite = true;
        if let Some(db) = db {
            config.log_db_path = db.clone();
        }
    }
    let telemetry = lumo_telemetry::init_telemetry(config);

    match cli.command {
        Command::Serve { port, db } => serve(port, db).await,
        Command::Item { server, action } => item(client(server)?, action).await,
        Command::Chat { server, model } => chat(client(server)?, model).await,
        Command::Logs {
            level,
            request_id,
            procedure,
            target,
            since,
            limit,
            db: _,
        } => {
            let query = LogQuery {
                level,
                target,
                request_id,
                procedure,
                since,
                limit: Some(limit),
            };
            logs(&telemetry, &query)
        }
    }
}

fn client(server: Option<String>) -> anyhow::Result<RpcClient> {
    let client = match server {
        Some(url) => RpcClient::new(url)?,
        None => RpcClient::from_env()?,
    };
    Ok(client)
}

async fn serve(port: Option<u16>, db_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = ServerConfig::from_env();
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(db_path) = db_path {
        config.db_path = db_path;
    }

    let db = Database::open(&config.db_path)
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
    info!(path = %config.db_path.display(), "database opened");

    // Keys and base URLs are resolved per request from the server config.
    let provider = OpenAiProvider::new(None, None)?;
    let handle = lumo_server::start(config, db, Arc::new(provider)).await?;
    info!(url = %handle.url(), "lumo server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn item(client: RpcClient, action: ItemAction) -> anyhow::Result<()> {
    let output = match action {
        ItemAction::List => serde_json::to_value(client.list_items().await?)?,
        ItemAction::Get { id } => serde_json::to_value(client.get_item(id).await?)?,
        ItemAction::Create { name, description } => {
            let input = CreateItemInput { name, description };
            serde_json::to_value(client.create_item(&input).await?)?
        }
        ItemAction::Update {
            id,
            name,
            description,
        } => {
            let input = UpdateItemInput {
                id,
                name,
                description,
            };
            serde_json::to_value(client.update_item(&input).await?)?
        }
        ItemAction::Delete { id } => serde_json::to_value(client.delete_item(id).await?)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn logs(telemetry: &TelemetryGuard, query: &LogQuery) -> anyhow::Result<()> {
    let sink = telemetry
        .logs()
        .context("log database is unavailable")?;
    let records = sink.query(query)?;
    if records.is_empty() {
        eprintln!("no matching logs ({} stored)", sink.count()?);
    }
    for record in records {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    Send(String),
    Regenerate,
    Clear,
    Model(String),
    Key(String),
    Base(String),
    Quit,
    Help,
    Empty,
}

fn parse_repl_line(line: &str) -> ReplCommand {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return match line {
            "" => ReplCommand::Empty,
            text => ReplCommand::Send(text.to_string()),
        };
    };
    let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    let arg = arg.trim().to_string();
    match name {
        "regen" | "regenerate" => ReplCommand::Regenerate,
        "clear" => ReplCommand::Clear,
        "model" => ReplCommand::Model(arg),
        "key" => ReplCommand::Key(arg),
        "base" => ReplCommand::Base(arg),
        "quit" | "exit" => ReplCommand::Quit,
        _ => ReplCommand::Help,
    }
}

const REPL_HELP: &str = "commands: /regen  /clear  /model <gpt-4o-mini|gpt-4o>  /key <api key>  /base <url>  /quit
ctrl-c stops a response in progress";

async fn chat(client: RpcClient, model: Option<OpenAIModel>) -> anyhow::Result<()> {
    let store = ChatStore::new(client, Some(ChatSettings::default_path()));
    if let Some(model) = model {
        store.set_model(model);
    }
    println!("model: {}  (type /help for commands)", store.snapshot().settings.model);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match parse_repl_line(&line) {
            ReplCommand::Empty => {}
            ReplCommand::Quit => break,
            ReplCommand::Help => println!("{REPL_HELP}"),
            ReplCommand::Clear => {
                store.clear_conversation();
                println!("conversation cleared");
            }
            ReplCommand::Model(name) => match name.parse::<OpenAIModel>() {
                Ok(model) => {
                    store.set_model(model);
                    println!("model: {model}");
                }
                Err(e) => println!("{e}"),
            },
            ReplCommand::Key(key) => {
                store.set_openai_api_key(key);
                println!("API key updated");
            }
            ReplCommand::Base(url) => {
                store.set_openai_base_url(url);
                println!("base URL updated");
            }
            ReplCommand::Regenerate => run_turn(&store, true).await?,
            ReplCommand::Send(text) => {
                store.set_input(text);
                run_turn(&store, false).await?;
            }
        }
    }
    Ok(())
}

/// Drive one send or regenerate, echoing deltas as they land.
async fn run_turn(store: &ChatStore<RpcClient>, regenerate: bool) -> anyhow::Result<()> {
    let mut updates = store.subscribe();
    let mut task = {
        let store = store.clone();
        tokio::spawn(async move {
            if regenerate {
                store.regenerate().await
            } else {
                store.send_message().await
            }
        })
    };

    let mut printed = 0;
    loop {
        tokio::select! {
            finished = &mut task => {
                finished.context("chat task failed")?;
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                echo_reply(&state, &mut printed)?;
            }
            _ = tokio::signal::ctrl_c() => store.stop(),
        }
    }

    let state = store.snapshot();
    echo_reply(&state, &mut printed)?;
    println!();
    if state.status == ChatStatus::Error {
        eprintln!("error: {}", state.error.as_deref().unwrap_or("unknown error"));
    }
    Ok(())
}

/// Print the unseen tail of the assistant reply. `printed` is a byte offset
/// into a string that only grows by appends.
fn echo_reply(state: &ChatState, printed: &mut usize) -> std::io::Result<()> {
    let Some(last) = state.messages.last().filter(|m| m.role == ChatRole::Assistant) else {
        return Ok(());
    };
    if let Some(tail) = last.content.get(*printed..) {
        if !tail.is_empty() {
            let mut out = std::io::stdout();
            out.write_all(tail.as_bytes())?;
            out.flush()?;
            *printed = last.content.len();
        }
    }
    Ok(())
}
