mod live;
mod server;

use anyhow::Context;
use clap::Parser;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use crate::live::ProbeSources;
use crate::server::AgentState;

const DEFAULT_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_LOG_DIR: &str = ".ter/logs";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub label: String,
    pub auth_token: Option<String>,
    pub debug: bool,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "ter-agent", about = "Serves host state to remote clients")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// Name reported by /health; defaults to the hostname.
    #[arg(long, default_value = "")]
    label: String,
    #[arg(long, default_value = "")]
    auth_token: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 15)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;
    if !addr.ip().is_loopback() && config.auth_token.is_none() {
        warn!(event = "unauthenticated_listener", addr = %addr);
    }

    let state = Arc::new(AgentState::new(config.clone(), ProbeSources::default()));
    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    info!(event = "agent_start", addr = %addr, label = %config.label, auth = config.auth_token.is_some());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("agent server failed")?;
    info!(event = "agent_stop");
    Ok(())
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        label: resolve_label(&args.label),
        auth_token: resolve_auth_token(&args.auth_token),
        debug: args.debug || env_true("TER_AGENT_DEBUG"),
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("TER_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, &config.addr) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Copies every log line to stdout and, when configured, the log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, addr: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(log_file_name(addr)))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn log_file_name(addr: &str) -> String {
    let port = addr
        .rsplit_once(':')
        .map(|(_, port)| port)
        .filter(|port| !port.is_empty())
        .unwrap_or("default");
    format!("ter-agent-{port}.log")
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn flag_or_env(flag: &str, key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env_value(key)
}

fn resolve_addr(addr_flag: &str) -> String {
    flag_or_env(addr_flag, "TER_AGENT_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

fn resolve_auth_token(token_flag: &str) -> Option<String> {
    flag_or_env(token_flag, "TER_AUTH_TOKEN")
}

fn resolve_label(label_flag: &str) -> String {
    flag_or_env(label_flag, "TER_HOST_LABEL").unwrap_or_else(|| {
        hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string())
    })
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    flag_or_env(log_dir_flag, "TER_LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_named_after_port() {
        assert_eq!(log_file_name("127.0.0.1:8787"), "ter-agent-8787.log");
        assert_eq!(log_file_name("[::1]:9000"), "ter-agent-9000.log");
        assert_eq!(log_file_name("nonsense"), "ter-agent-default.log");
    }

    #[test]
    fn flag_wins_over_environment() {
        std::env::set_var("TER_TEST_FLAG_OR_ENV", "from-env");
        assert_eq!(
            flag_or_env(" from-flag ", "TER_TEST_FLAG_OR_ENV").as_deref(),
            Some("from-flag")
        );
        assert_eq!(
            flag_or_env("", "TER_TEST_FLAG_OR_ENV").as_deref(),
            Some("from-env")
        );
        assert_eq!(flag_or_env("", "TER_TEST_UNSET_KEY"), None);
    }
}
