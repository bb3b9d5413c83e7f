use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use chat_sync::cache::CacheSnapshot;
use chat_sync::config::load_config;
use chat_sync::{
    ChannelStatus, ClientConfig, Command, ConversationCache, ConversationStore, DataDir,
    FileConfig, MessageId, MessageStatus, Role, Session, StaticToken, StoreEvent, ThreadId,
    TokenProvider,
};

#[derive(Parser)]
#[command(name = "chat-sync")]
#[command(about = "Terminal client for a streaming chat assistant")]
struct Cli {
    /// Custom data directory (defaults to ~/.chat-sync)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// WebSocket endpoint, overrides ws_url from config
    #[arg(long)]
    url: Option<String>,

    /// User id sent with every message
    #[arg(long)]
    user: Option<String>,

    /// Send over HTTP while the socket is down
    #[arg(long)]
    rest_fallback: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Command(Command),
    ListThreads,
    Help,
    Invalid(String),
}

const HELP: &str = "\
commands:
  <text>          send a message
  /retry <id>     resend a failed message
  /cancel         stop the reply that is streaming
  /new            start a new conversation
  /threads        list conversations
  /switch <id>    switch conversation
  /delete <id>    delete a conversation
  /connect        connect (also after giving up)
  /disconnect     close the connection
  /reconnect      drop and reopen the connection
  /quit           save and exit";

fn parse_line(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Input::Command(Command::Send(line.to_string())));
    };

    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

    let input = match (name, arg) {
        ("retry", Some(id)) => Input::Command(Command::Retry(MessageId::from(id))),
        ("switch", Some(id)) => Input::Command(Command::SelectThread(ThreadId::from(id))),
        ("delete", Some(id)) => Input::Command(Command::DeleteThread(ThreadId::from(id))),
        ("retry" | "switch" | "delete", None) => Input::Invalid(format!("/{name} needs an id")),
        ("cancel", _) => Input::Command(Command::CancelStream),
        ("new", _) => Input::Command(Command::NewThread),
        ("connect", _) => Input::Command(Command::Connect),
        ("disconnect", _) => Input::Command(Command::Disconnect),
        ("reconnect", _) => Input::Command(Command::Reconnect),
        ("quit" | "exit", _) => Input::Command(Command::Shutdown),
        ("threads", _) => Input::ListThreads,
        ("help", _) => Input::Help,
        _ => Input::Invalid(format!("unknown command /{name}")),
    };
    Some(input)
}

/// Thread titles mirrored out of the store for the input task.
#[derive(Debug, Default)]
struct ThreadDirectory {
    threads: Vec<(ThreadId, String)>,
    active: Option<ThreadId>,
}

impl ThreadDirectory {
    fn apply(&mut self, event: &StoreEvent) {
        match event {
            StoreEvent::ThreadCreated { thread_id } => {
                self.threads
                    .push((thread_id.clone(), chat_sync::types::DEFAULT_TITLE.to_string()));
            }
            StoreEvent::ThreadUpdated {
                thread_id, title, ..
            } => {
                if let Some(entry) = self.threads.iter_mut().find(|(id, _)| id == thread_id) {
                    entry.1 = title.clone();
                }
            }
            StoreEvent::ThreadDeleted { thread_id } => {
                self.threads.retain(|(id, _)| id != thread_id);
            }
            StoreEvent::ActiveThreadChanged { thread_id } => {
                self.active = thread_id.clone();
            }
            _ => {}
        }
    }

    fn render(&self) -> String {
        if self.threads.is_empty() {
            return "no conversations yet".to_string();
        }
        self.threads
            .iter()
            .map(|(id, title)| {
                let marker = if self.active.as_ref() == Some(id) { "*" } else { " " };
                format!("{marker} {id}  {title}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Prints assistant output incrementally and flags failed sends.
#[derive(Default)]
struct Printer {
    printed: HashMap<MessageId, usize>,
}

impl Printer {
    fn on_event(&mut self, event: &StoreEvent) -> std::io::Result<()> {
        let mut out = std::io::stdout().lock();
        match event {
            StoreEvent::MessageAppended { message } if message.role() == Role::Assistant => {
                write!(out, "assistant> {}", message.content())?;
                self.printed
                    .insert(message.id().clone(), message.content().len());
                if !message.is_streaming() {
                    writeln!(out)?;
                    self.printed.remove(message.id());
                }
            }
            StoreEvent::MessageUpdated { message } if message.role() == Role::Assistant => {
                if let Some(done) = self.printed.get_mut(message.id()) {
                    let content = message.content();
                    if let Some(delta) = content.get(*done..) {
                        write!(out, "{delta}")?;
                    }
                    *done = content.len();
                    if !message.is_streaming() {
                        writeln!(out)?;
                        self.printed.remove(message.id());
                    }
                }
            }
            StoreEvent::MessageUpdated { message }
                if message.role() == Role::User && message.status() == MessageStatus::Error =>
            {
                writeln!(
                    out,
                    "[not delivered: \"{}\"  /retry {}]",
                    message.content(),
                    message.id()
                )?;
            }
            StoreEvent::ActiveThreadChanged {
                thread_id: Some(id),
            } => {
                writeln!(out, "[conversation {id}]")?;
            }
            _ => {}
        }
        out.flush()
    }
}

fn banner(status: &ChannelStatus) -> String {
    match status {
        ChannelStatus::StateChanged(state) => format!("[connection {state}]"),
        ChannelStatus::ReconnectScheduled { attempt, delay } => {
            format!("[reconnecting in {:.1}s, attempt {attempt}]", delay.as_secs_f64())
        }
        ChannelStatus::Failed(err) => format!("[{err}; type /connect to try again]"),
    }
}

fn resolve_config(cli: &Cli, data_dir: &DataDir) -> Result<ClientConfig> {
    let mut fc: FileConfig = load_config(&data_dir.root)
        .extract()
        .context("Failed to load configuration")?;
    if let Some(ref url) = cli.url {
        fc.ws_url = url.clone();
    }
    if let Some(ref user) = cli.user {
        fc.user_id = user.clone();
    }
    if cli.rest_fallback {
        fc.rest_fallback = true;
    }
    ClientConfig::from_file(&fc).context("Invalid configuration")
}

fn restore_store(user_id: &str, cache: &ConversationCache) -> ConversationStore {
    let snapshot = match cache.load() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(code = "cache_unreadable", "starting without cached conversations: {e}");
            CacheSnapshot::default()
        }
    };
    let mut store = ConversationStore::with_threads(user_id, snapshot.threads);
    if let Some(active) = snapshot.active {
        if let Err(e) = store.set_active_thread(&active) {
            warn!("cached active conversation is gone: {e}");
        }
    }
    store
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "chat_sync=debug"
    } else {
        "chat_sync=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let data_dir = DataDir::new(cli.data_dir.clone())?;
    let config = resolve_config(&cli, &data_dir)?;
    info!(url = %config.ws_url, user = %config.user_id, "starting chat-sync");

    let cache = ConversationCache::new(data_dir.cache_path());
    let mut store = restore_store(&config.user_id, &cache);

    let directory = Arc::new(Mutex::new(ThreadDirectory::default()));
    {
        let mut dir = directory
            .lock()
            .map_err(|_| anyhow::anyhow!("thread directory poisoned"))?;
        dir.threads = store
            .threads()
            .iter()
            .map(|t| (t.id.clone(), t.title.clone()))
            .collect();
        dir.active = store.active_thread_id().cloned();
    }
    let dir_for_events = directory.clone();
    store.subscribe(move |event| {
        dir_for_events
            .lock()
            .map_err(|_| anyhow::anyhow!("thread directory poisoned"))?
            .apply(event);
        Ok(())
    });
    let mut printer = Printer::default();
    store.subscribe(move |event| printer.on_event(event).map_err(Into::into));

    let token = config
        .token
        .clone()
        .map(|t| Arc::new(StaticToken::new(Some(t))) as Arc<dyn TokenProvider>);
    let (mut session, events) =
        Session::websocket(&config, store, token).context("Failed to set up session")?;
    session.channel_mut().on_status(|status| {
        eprintln!("{}", banner(status));
        Ok(())
    });

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    commands_tx.send(Command::Connect)?;

    let input_dir = directory.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        eprintln!("type /help for commands");
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_line(&line) {
                Some(Input::Command(command)) => {
                    let quit = command == Command::Shutdown;
                    if commands_tx.send(command).is_err() || quit {
                        break;
                    }
                }
                Some(Input::ListThreads) => match input_dir.lock() {
                    Ok(dir) => println!("{}", dir.render()),
                    Err(_) => eprintln!("thread list unavailable"),
                },
                Some(Input::Help) => println!("{HELP}"),
                Some(Input::Invalid(msg)) => eprintln!("{msg}"),
                None => {}
            }
        }
    });

    session.run(commands_rx, events).await;

    let store = session.store();
    let store = store.borrow();
    let snapshot = CacheSnapshot::new(store.threads().to_vec(), store.active_thread_id().cloned());
    cache
        .save(&snapshot)
        .with_context(|| format!("Failed to save cache to {:?}", cache.path()))?;
    info!(threads = snapshot.threads.len(), "conversations saved");
    Ok(())
}
