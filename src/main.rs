//! Penny: a Discord community bot with auto-pings and zero-downtime handoff.

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use penny::blob::FsBlobStore;
use penny::bot::{BotRunner, shutdown_token};
use penny::channel::discord::DiscordChannel;
use penny::config::{BOT_TOKEN_ENV, PennyConfig};
use penny::coordinator::process_instance_id;
use penny::pings::commands::{fold_all, parse_expression_list, render_test};
use penny::pings::{Expression, ExpressionKind, PingsStore, find_triggered_expressions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Penny: auto-pings and instance handoff for a Discord server.
#[derive(Parser)]
#[command(name = "penny", version, about)]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, global = true, default_value = "penny.toml")]
    config: PathBuf,

    /// Blob store directory; skips loading the config for offline commands.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to Discord and serve until SIGINT/SIGTERM.
    Run,

    /// Inspect auto-pings offline.
    Pings {
        #[command(subcommand)]
        action: PingsAction,
    },
}

#[derive(Subcommand)]
enum PingsAction {
    /// Show which expressions a message would trigger.
    Test {
        /// The message body.
        message: String,

        /// Expressions to test (comma separated, repeatable). Defaults to
        /// every stored expression.
        #[arg(long = "expr")]
        expressions: Vec<String>,

        /// Treat `--expr` values as containment expressions.
        #[arg(long)]
        contains: bool,
    },

    /// List a user's stored expressions.
    List {
        /// Discord user id.
        #[arg(long)]
        user: u64,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Command::Run => cmd_run(&cli.config).await,
        Command::Pings { action } => {
            let store = open_store(&cli.config, cli.data_dir.as_deref())?;
            match action {
                PingsAction::Test {
                    message,
                    expressions,
                    contains,
                } => cmd_pings_test(&store, &message, &expressions, contains).await,
                PingsAction::List { user } => cmd_pings_list(&store, user).await,
            }
        }
    }
}

/// Directory relative paths in the config are resolved against.
fn config_base(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn open_store(config_path: &Path, data_dir: Option<&Path>) -> Result<PingsStore> {
    let root = match data_dir {
        Some(dir) => dir.to_path_buf(),
        None => PennyConfig::load(config_path)?.resolved_data_dir(&config_base(config_path)),
    };
    Ok(PingsStore::new(Arc::new(FsBlobStore::new(root))))
}

/// Connect to Discord and serve.
async fn cmd_run(config_path: &Path) -> Result<()> {
    let config = PennyConfig::load(config_path)?;
    let token = config.bot_token(std::env::var(BOT_TOKEN_ENV).ok())?;
    let data_dir = config.resolved_data_dir(&config_base(config_path));
    std::fs::create_dir_all(&data_dir)
        .wrap_err_with(|| format!("failed to create data dir {}", data_dir.display()))?;

    let channel = Arc::new(DiscordChannel::new(token, config.command_prefix.clone()));
    let blobs = Arc::new(FsBlobStore::new(data_dir));
    let runner = BotRunner::new(&config, process_instance_id(), channel, blobs);
    runner.run(shutdown_token()).await
}

/// Evaluate the matcher against a message without connecting to Discord.
async fn cmd_pings_test(
    store: &PingsStore,
    message: &str,
    expressions: &[String],
    contains: bool,
) -> Result<()> {
    if !expressions.is_empty() {
        let kind = if contains {
            ExpressionKind::Contains
        } else {
            ExpressionKind::ExactMatch
        };
        let texts: Vec<String> = expressions
            .iter()
            .flat_map(|e| parse_expression_list(e))
            .collect();
        println!("{}", render_test(message, &fold_all(&texts, kind)));
        return Ok(());
    }

    let watch_set = store.get_all().await?;
    let triggered = find_triggered_expressions(message, &watch_set);
    if triggered.is_empty() {
        println!(
            "The message does not trigger any of the {} stored expressions.",
            watch_set.len()
        );
        return Ok(());
    }
    let mut users: Vec<_> = triggered.into_iter().collect();
    users.sort_by(|a, b| a.0.cmp(&b.0));
    for (user, expressions) in users {
        let mut expressions: Vec<Expression> = expressions.into_iter().collect();
        expressions.sort();
        let names: Vec<String> = expressions.iter().map(|e| format!("`{e}`")).collect();
        println!("{user}: {}", names.join(", "));
    }
    Ok(())
}

/// Print a user's stored expressions.
async fn cmd_pings_list(store: &PingsStore, user: u64) -> Result<()> {
    let reply = penny::pings::commands::list(store, &user.to_string())
        .await
        .wrap_err("failed to read pings")?;
    println!("{reply}");
    Ok(())
}
