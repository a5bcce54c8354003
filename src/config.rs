use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use janus_client::SessionConfig;
use url::Url;

use crate::logger::LogConfig;

/// Environment variable naming the dotenv file read before argument parsing.
pub const ENV_FILE_VAR: &str = "JANUS_ENV_FILE";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "janus-signal",
    about = "Join a Janus video room through the gateway's HTTP API",
    version
)]
pub struct Cli {
    /// Janus root URL, e.g. http://localhost:8088/janus
    #[arg(env = "JANUS_URL")]
    pub url: String,

    /// The video room ID to join
    #[arg(long, env = "JANUS_ROOM", default_value_t = 1234)]
    pub room: u64,

    /// Display name announced to the room
    #[arg(long, env = "JANUS_DISPLAY", default_value = "janus-signal")]
    pub display: String,

    /// How long to keep the session open, in seconds
    #[arg(long, default_value_t = 600)]
    pub duration: u64,

    /// Log level (error, warn, info, debug, trace). RUST_LOG wins if set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write a daily rolling log file into this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// -v for debug, -vv for trace
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Timeout for every HTTP request, long-poll included
    #[arg(long, default_value_t = 60)]
    pub request_timeout_secs: u64,

    /// How long to wait for a plugin's asynchronous reply
    #[arg(long, default_value_t = 30)]
    pub reply_timeout_secs: u64,
}

/// Fully validated runtime configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub root_url: Url,
    pub room: u64,
    pub display: String,
    pub hold: Duration,
    pub reply_timeout: Duration,
    pub log: LogConfig,
    pub session: SessionConfig,
}

impl TryFrom<Cli> for ClientConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let root_url = Url::parse(&cli.url)
            .with_context(|| format!("invalid gateway URL `{}`", cli.url))?;
        if !matches!(root_url.scheme(), "http" | "https") {
            bail!("gateway URL must be http or https, got `{}`", root_url.scheme());
        }
        if cli.request_timeout_secs == 0 || cli.reply_timeout_secs == 0 {
            bail!("timeouts must be at least one second");
        }

        let session = SessionConfig {
            request_timeout: Duration::from_secs(cli.request_timeout_secs),
            ..SessionConfig::default()
        };

        Ok(Self {
            root_url,
            room: cli.room,
            display: cli.display,
            hold: Duration::from_secs(cli.duration),
            reply_timeout: Duration::from_secs(cli.reply_timeout_secs),
            log: LogConfig::new(effective_level(&cli.log_level, cli.verbose), cli.log_dir),
            session,
        })
    }
}

impl ClientConfig {
    /// Root URL as the gateway expects it, without a trailing slash.
    pub fn root(&self) -> &str {
        self.root_url.as_str().trim_end_matches('/')
    }
}

/// `-v` flags override the configured level.
pub fn effective_level(level: &str, verbose: u8) -> String {
    match verbose {
        0 => level.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Load a dotenv file into the process environment, if there is one.
///
/// Runs before logging is up, so the outcome is returned rather than logged.
pub fn load_env_file() -> Option<PathBuf> {
    let path = env::var(ENV_FILE_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".env"));
    if path.exists() && dotenvy::from_path(&path).is_ok() {
        Some(path)
    } else {
        None
    }
}
