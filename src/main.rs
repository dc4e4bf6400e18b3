mod app;
mod cache;
mod config;
mod error;
mod http;
mod invalidation;
mod logging;
mod proxy;
mod store;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::store::{LocalTask, Task};

#[derive(Parser, Debug)]
#[command(name = "daybook")]
#[command(about = "Offline-first cache and sync layer for the Daybook client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/daybook/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Backend API base URL, overrides backend.url
  #[arg(short, long, global = true)]
  backend: Option<String>,

  /// Mirror logs to stderr at debug level
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read a backend path through the caches and print the JSON
  Get {
    path: String,
    /// Skip the memory cache and go to the network
    #[arg(long)]
    refresh: bool,
  },
  /// Work with the local task mirror
  Task {
    #[command(subcommand)]
    action: TaskAction,
  },
  /// Read or change user preferences
  Prefs {
    #[command(subcommand)]
    action: PrefsAction,
  },
  /// List queued changes that have not reached the backend
  Queue,
  /// Send queued changes now
  Sync,
  /// Keep the proxy and sync running until Ctrl-C
  Run {
    /// Backend path to re-read and print as it changes
    #[arg(long)]
    watch: Option<String>,
  },
}

#[derive(Subcommand, Debug)]
enum TaskAction {
  Save {
    #[arg(long)]
    id: String,
    #[arg(long)]
    owner: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    due: Option<String>,
    #[arg(long)]
    completed: bool,
  },
  Delete {
    id: String,
  },
  List {
    #[arg(long)]
    owner: String,
  },
}

#[derive(Subcommand, Debug)]
enum PrefsAction {
  Get {
    user: String,
  },
  /// Merge key=value pairs; values are parsed as JSON when possible
  Set {
    user: String,
    #[arg(required = true)]
    pairs: Vec<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?.with_backend(args.backend);
  let _log_guard = logging::init(&config.log_dir()?, args.verbose)?;

  let app = app::App::new(config).await?;
  let result = execute(&app, args.command).await;
  app.shutdown();

  result
}

async fn execute(app: &app::App, command: Command) -> Result<()> {
  match command {
    Command::Get { path, refresh } => {
      let data = app.get(&path, refresh).await?;
      println!("{}", serde_json::to_string_pretty(&data)?);
    }
    Command::Task { action } => match action {
      TaskAction::Save {
        id,
        owner,
        title,
        description,
        due,
        completed,
      } => {
        let mut task = Task::new(id, owner, title);
        task.description = description;
        task.due_date = due;
        task.completed = completed;
        let local = app.save_task(&task).await?;
        print_task(&local);
      }
      TaskAction::Delete { id } => {
        if !app.delete_task(&id).await? {
          eprintln!("Task {} was not in the local mirror", id);
        }
      }
      TaskAction::List { owner } => {
        for task in app.list_tasks(&owner)? {
          print_task(&task);
        }
      }
    },
    Command::Prefs { action } => match action {
      PrefsAction::Get { user } => {
        let prefs = app.get_preferences(&user)?;
        println!("{}", serde_json::to_string_pretty(&prefs)?);
      }
      PrefsAction::Set { user, pairs } => {
        let patch = parse_pairs(&pairs)?;
        let prefs = app.set_preferences(&user, &patch)?;
        println!("{}", serde_json::to_string_pretty(&prefs)?);
      }
    },
    Command::Queue => {
      for mutation in app.pending()? {
        println!(
          "{}  {} {}  attempts={}  queued={}",
          mutation.id,
          mutation.method,
          mutation.url,
          mutation.attempts,
          mutation.timestamp.to_rfc3339()
        );
      }
    }
    Command::Sync => {
      let report = app.sync_now().await?;
      println!(
        "delivered={} retrying={} dropped={} deferred={}",
        report.delivered, report.retrying, report.dropped, report.deferred
      );
    }
    Command::Run { watch } => app.run(watch.as_deref()).await?,
  }

  Ok(())
}

fn print_task(local: &LocalTask) {
  println!(
    "{}  [{}]  {}{}",
    local.task.id,
    local.sync_status.as_str(),
    local.task.title,
    if local.task.completed { "  (done)" } else { "" }
  );
}

fn parse_pairs(pairs: &[String]) -> Result<Map<String, Value>> {
  let mut patch = Map::new();
  for pair in pairs {
    let (key, raw) = pair
      .split_once('=')
      .ok_or_else(|| eyre!("Expected key=value, got '{}'", pair))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    patch.insert(key.to_string(), value);
  }
  Ok(patch)
}
