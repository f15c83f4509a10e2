use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::auth::{AuthStore, CookieRefresher, config_dir, resolve_refresh_token, resolve_token};
use crate::client::{ClientConfig, FOR_YOU};

pub const DEFAULT_URL: &str = "http://localhost:8000";
const DEFAULT_FILTER: &str = "newsdigest=info";

#[derive(Debug, Parser)]
#[command(name = "newsdigest", version, about = "Terminal client for the NewsDigest assistant")]
pub struct Cli {
    /// Backend base URL.
    #[arg(long, env = "NEWSDIGEST_URL", default_value = DEFAULT_URL, global = true)]
    pub url: String,

    /// Access token; falls back to the token saved by `login`.
    #[arg(long, env = "NEWSDIGEST_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Refresh token used to renew an expired access token; falls back to
    /// the one saved by `login`.
    #[arg(long, env = "NEWSDIGEST_REFRESH_TOKEN", hide_env_values = true, global = true)]
    pub refresh_token: Option<String>,

    /// Connect timeout in seconds.
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,

    /// Write logs here instead of stderr.
    #[arg(long, env = "NEWSDIGEST_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Interactive chat (default).
    Chat {
        /// Resume an existing session.
        #[arg(long)]
        session: Option<String>,
    },
    /// Ask one question and stream the answer to stdout.
    Ask {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        #[arg(long)]
        session: Option<String>,
    },
    /// Analyze an article.
    Analyze { article_id: i64 },
    /// Search highlights for a query.
    Highlights {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },
    /// Print a page of a session's history.
    History {
        session_id: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Print a feed page as JSON lines.
    Feed {
        #[arg(default_value = FOR_YOU)]
        topic: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Delete one chat session and its messages.
    DeleteChat { session_id: String },
    /// Delete every chat session.
    DeleteHistory {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    Login {
        username: String,
        #[arg(long, env = "NEWSDIGEST_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    Logout,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Chat { session: None })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.url.clone(),
            connect_timeout: self.timeout.map(Duration::from_secs),
        }
    }

    pub fn auth_store(&self) -> Arc<AuthStore> {
        let store = AuthStore::new(resolve_token(self.token.clone()));
        let store = match resolve_refresh_token(self.refresh_token.clone()) {
            Some(refresh) => store.with_refresher(Arc::new(CookieRefresher::new(refresh))),
            None => store,
        };
        Arc::new(store)
    }

    /// The TUI owns the terminal, so it always logs to a file.
    pub fn log_target(&self) -> Option<PathBuf> {
        match (&self.log_file, self.command()) {
            (Some(path), _) => Some(path.clone()),
            (None, Command::Chat { .. }) => Some(config_dir().join("newsdigest.log")),
            (None, _) => None,
        }
    }
}

pub fn init_logging(log_file: Option<&Path>) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        None => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_chat() {
        let cli = Cli::try_parse_from(["newsdigest"]).unwrap();
        assert!(matches!(cli.command(), Command::Chat { session: None }));
    }

    #[test]
    fn ask_joins_words_and_accepts_session() {
        let cli = Cli::try_parse_from(["newsdigest", "ask", "any", "sports", "--session", "s1"])
            .unwrap();
        match cli.command() {
            Command::Ask { query, session } => {
                assert_eq!(query, vec!["any", "sports"]);
                assert_eq!(session.as_deref(), Some("s1"));
            }
            other => panic!("expected ask, got {other:?}"),
        }
    }

    #[test]
    fn feed_defaults_to_for_you() {
        let cli = Cli::try_parse_from(["newsdigest", "feed"]).unwrap();
        match cli.command() {
            Command::Feed { topic, page } => {
                assert_eq!(topic, FOR_YOU);
                assert_eq!(page, 1);
            }
            other => panic!("expected feed, got {other:?}"),
        }
    }

    #[test]
    fn timeout_becomes_connect_timeout() {
        let cli = Cli::try_parse_from(["newsdigest", "--timeout", "7", "logout"]).unwrap();
        assert_eq!(cli.client_config().connect_timeout, Some(Duration::from_secs(7)));
    }

    #[test]
    fn delete_commands_parse() {
        let cli = Cli::try_parse_from(["newsdigest", "delete-chat", "s9"]).unwrap();
        assert!(matches!(cli.command(), Command::DeleteChat { session_id } if session_id == "s9"));

        let cli = Cli::try_parse_from(["newsdigest", "delete-history", "--yes"]).unwrap();
        assert!(matches!(cli.command(), Command::DeleteHistory { yes: true }));
    }

    #[tokio::test]
    async fn explicit_refresh_token_enables_refresh() {
        let cli = Cli::try_parse_from(["newsdigest", "--refresh-token", "r1", "logout"]).unwrap();
        assert!(cli.auth_store().can_refresh().await);
    }
}
