mod cache;
mod config;
mod event;
mod logging;
mod zalo;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use std::fmt::Display;
use std::path::PathBuf;

use cache::{
  ActiveFlag, MemoryStorage, ReconcileOutcome, RosterEntity, RosterStore, SqliteStorage,
};
use config::Config;
use event::{EventSink, SyncEvent};
use zalo::{Friend, Group, Session, SyncedZaloClient};

#[derive(Parser, Debug)]
#[command(name = "zroster")]
#[command(about = "Keeps local Zalo group and friend rosters in sync with the backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/zroster/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also print logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List configured accounts and their cached roster sizes
  Accounts,
  /// Reconcile cached rosters with the backend
  Sync {
    roster: RosterSelection,
    #[arg(short, long)]
    account: String,
    /// Work on a throwaway in-memory cache, leaving the on-disk cache alone
    #[arg(long)]
    ephemeral: bool,
  },
  /// Print a cached roster without touching the network
  Show {
    roster: RosterKind,
    #[arg(short, long)]
    account: String,
    /// Print records as JSON
    #[arg(long)]
    json: bool,
  },
  /// Forget cached rosters
  Clear {
    roster: RosterSelection,
    #[arg(short, long)]
    account: String,
  },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RosterKind {
  Groups,
  Friends,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RosterSelection {
  Groups,
  Friends,
  All,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let guard = logging::init(args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  match run(args.command, &config).await {
    Err(e) if zalo::is_session_expired(&e) => {
      tracing::error!(error = %e, "Session expired");
      eprintln!("{}", e);
      eprintln!("Update the account's session cookie and run the command again.");
      drop(guard);
      std::process::exit(2);
    }
    other => other,
  }
}

async fn run(command: Command, config: &Config) -> Result<()> {
  match command {
    Command::Accounts => list_accounts(config),
    Command::Sync {
      roster,
      account,
      ephemeral,
    } => {
      if ephemeral {
        let client = SyncedZaloClient::with_storage(config, MemoryStorage::new())?;
        sync(&client, config, roster, &account).await
      } else {
        let client = SyncedZaloClient::new(config)?;
        sync(&client, config, roster, &account).await
      }
    }
    Command::Show {
      roster,
      account,
      json,
    } => {
      config.account(&account)?;
      let client = SyncedZaloClient::new(config)?;
      match roster {
        RosterKind::Groups => show::<Group>(&client, &account, json),
        RosterKind::Friends => show::<Friend>(&client, &account, json),
      }
    }
    Command::Clear { roster, account } => {
      config.account(&account)?;
      let client = SyncedZaloClient::new(config)?;
      if matches!(roster, RosterSelection::Groups | RosterSelection::All) {
        report_clear("groups", client.clear::<Group>(&account)?);
      }
      if matches!(roster, RosterSelection::Friends | RosterSelection::All) {
        report_clear("friends", client.clear::<Friend>(&account)?);
      }
      Ok(())
    }
  }
}

fn list_accounts(config: &Config) -> Result<()> {
  if config.accounts.is_empty() {
    println!("No accounts configured.");
    return Ok(());
  }

  let storage = SqliteStorage::open()?;
  for account in &config.accounts {
    let groups: Vec<Group> = storage.load(&account.id)?;
    let friends: Vec<Friend> = storage.load(&account.id)?;
    println!(
      "{}  {}  groups: {}  friends: {}",
      account.id,
      account.name.as_deref().unwrap_or("-"),
      groups.len(),
      friends.len()
    );
  }
  Ok(())
}

async fn sync<S: RosterStore>(
  client: &SyncedZaloClient<S>,
  config: &Config,
  roster: RosterSelection,
  account_id: &str,
) -> Result<()> {
  let account = config.account(account_id)?;
  let session = Session::from_account(account, Config::get_session_cookie(&account.id)?);

  let active = ActiveFlag::new();
  stop_on_ctrl_c(active.clone());

  match roster {
    RosterSelection::Groups => sync_roster::<Group, S>(client, &session, &active).await,
    RosterSelection::Friends => sync_roster::<Friend, S>(client, &session, &active).await,
    RosterSelection::All => {
      futures::try_join!(
        sync_roster::<Group, S>(client, &session, &active),
        sync_roster::<Friend, S>(client, &session, &active)
      )?;
      Ok(())
    }
  }
}

/// Ctrl-C lets the current batch finish, then stops the pass
fn stop_on_ctrl_c(active: ActiveFlag) {
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      eprintln!("Stopping after the current batch...");
      active.deactivate();
    }
  });
}

async fn sync_roster<T: RosterEntity, S: RosterStore>(
  client: &SyncedZaloClient<S>,
  session: &Session,
  active: &ActiveFlag,
) -> Result<()> {
  let label = T::namespace();
  let (sink, mut rx) = EventSink::<T>::channel();

  let pass = async move {
    let result = client.sync::<T>(session, active, &sink).await;
    // Closing the sink ends the printer below
    drop(sink);
    result
  };
  let printer = async {
    while let Some(event) = rx.recv().await {
      print_event(label, &event);
    }
  };

  let (result, ()) = tokio::join!(pass, printer);
  let result = result?;

  match result.outcome {
    ReconcileOutcome::Aborted(reason) => println!(
      "{}: pass aborted ({:?}), kept {} cached records",
      label,
      reason,
      result.roster.len()
    ),
    ReconcileOutcome::Completed(report) => println!(
      "{}: {} records ({} new, {} refreshed, {} removed, {} failed batches{})",
      label,
      result.roster.len(),
      report.new_ids,
      report.refreshed,
      report.removed,
      report.batches_failed,
      if report.cancelled { ", stopped early" } else { "" }
    ),
  }
  Ok(())
}

fn print_event<T>(label: &str, event: &SyncEvent<T>) {
  match event {
    SyncEvent::Cached(roster) => println!("{}: {} cached", label, roster.len()),
    SyncEvent::Pruned { removed, .. } => println!("{}: removed {}", label, removed.len()),
    SyncEvent::BatchMerged {
      batch,
      total,
      roster,
    } => println!(
      "{}: batch {}/{} merged, {} records",
      label,
      batch,
      total,
      roster.len()
    ),
    SyncEvent::BatchFailed {
      batch,
      total,
      error,
    } => println!("{}: batch {}/{} failed: {}", label, batch, total, error),
  }
}

fn show<T: RosterEntity + Display>(
  client: &SyncedZaloClient,
  account_id: &str,
  json: bool,
) -> Result<()> {
  let roster: Vec<T> = client.cached(account_id)?;

  if json {
    println!("{}", serde_json::to_string_pretty(&roster)?);
    return Ok(());
  }

  match client.cached_at::<T>(account_id)? {
    Some(at) => println!(
      "{} {} (cached {})",
      roster.len(),
      T::namespace(),
      at.format("%Y-%m-%d %H:%M:%S UTC")
    ),
    None => println!("No cached {} for {}", T::namespace(), account_id),
  }
  for record in &roster {
    println!("{}", record);
  }
  Ok(())
}

fn report_clear(label: &str, removed: bool) {
  if removed {
    println!("Cleared cached {}", label);
  } else {
    println!("No cached {} to clear", label);
  }
}
