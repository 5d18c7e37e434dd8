//! Runs interactive programs inside a pseudo-terminal and captures what they
//! render until they go quiet, exit, or hit a hard ceiling.

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use regex::Regex;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

const REAP_TIMEOUT: Duration = Duration::from_secs(2);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);
const IDLE_PARKED: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone)]
pub struct PtyOptions {
    pub rows: u16,
    pub cols: u16,
    /// Hard ceiling for the whole run.
    pub timeout: Duration,
    /// Quiet period after which the program is considered done rendering.
    /// Not counted before the input has been written.
    pub idle: Duration,
    /// Delay before the input is written.
    pub settle: Duration,
    /// Defaults to the user's home directory.
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            rows: 60,
            cols: 200,
            timeout: Duration::from_millis(12_000),
            idle: Duration::from_millis(600),
            settle: Duration::from_millis(200),
            cwd: None,
            env: Vec::new(),
        }
    }
}

impl PtyOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Idle,
    Exited,
    TimedOut,
}

impl Completion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completion::Idle => "idle",
            Completion::Exited => "exited",
            Completion::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PtyCapture {
    pub output: String,
    pub completion: Completion,
    pub pid: Option<u32>,
    pub exit_code: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PtyError {
    #[error("{0} not installed")]
    NotFound(String),
    #[error("pty open failed: {0}")]
    Open(String),
    #[error("failed to spawn {binary}: {message}")]
    Spawn { binary: String, message: String },
}

/// Spawns `binary` on a fresh terminal, writes `input` once the settle delay
/// has passed, and returns everything it printed.
///
/// An empty capture is a valid result. The child is killed and reaped before
/// this returns, whatever ended the run.
pub async fn run_pty(
    binary: &str,
    args: &[String],
    input: &str,
    options: &PtyOptions,
) -> Result<PtyCapture, PtyError> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: options.rows,
            cols: options.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| PtyError::Open(err.to_string()))?;
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| PtyError::Open(err.to_string()))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|err| PtyError::Open(err.to_string()))?;

    let mut builder = CommandBuilder::new(binary);
    builder.args(args);
    if let Some(cwd) = options.cwd.clone().or_else(dirs::home_dir) {
        builder.cwd(cwd);
    }
    builder.env("TERM", "xterm-256color");
    builder.env("COLORTERM", "truecolor");
    for (key, value) in &options.env {
        builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|err| spawn_error(binary, err.to_string()))?;
    drop(pair.slave);
    let pid = child.process_id();
    let mut killer = child.clone_killer();
    debug!(event = "pty_spawned", binary, pid = ?pid);

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    thread::spawn(move || {
        let mut buffer = [0u8; 8192];
        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => count,
                Err(_) => break,
            };
            if chunk_tx.send(buffer[..read].to_vec()).is_err() {
                break;
            }
        }
    });

    let (exit_tx, mut exit_rx) = oneshot::channel::<Option<u32>>();
    thread::spawn(move || {
        let code = child.wait().ok().map(|status| status.exit_code());
        let _ = exit_tx.send(code);
    });

    let mut output = Vec::new();
    let mut exit_code = None;
    let mut input_pending = true;
    let mut idle_armed = false;
    let mut reader_open = true;

    let hard = sleep(options.timeout);
    let settle = sleep(options.settle);
    let idle = sleep(IDLE_PARKED);
    tokio::pin!(hard, settle, idle);

    let completion = loop {
        tokio::select! {
            _ = &mut hard => break Completion::TimedOut,
            _ = &mut idle, if idle_armed && !input_pending => break Completion::Idle,
            _ = &mut settle, if input_pending => {
                input_pending = false;
                if !input.is_empty() {
                    if let Err(err) = writer
                        .write_all(input.as_bytes())
                        .and_then(|_| writer.flush())
                    {
                        warn!(event = "pty_write_failed", binary, error = %err);
                    }
                }
                idle.as_mut().reset(Instant::now() + options.idle);
                idle_armed = true;
            }
            chunk = chunk_rx.recv(), if reader_open => match chunk {
                Some(bytes) => {
                    output.extend_from_slice(&bytes);
                    idle.as_mut().reset(Instant::now() + options.idle);
                    idle_armed = true;
                }
                None => reader_open = false,
            },
            code = &mut exit_rx => {
                exit_code = code.ok().flatten();
                break Completion::Exited;
            }
        }
    };

    if completion != Completion::Exited {
        let _ = killer.kill();
        match timeout(REAP_TIMEOUT, &mut exit_rx).await {
            Ok(code) => exit_code = code.ok().flatten(),
            Err(_) => warn!(event = "pty_reap_timeout", binary, pid = ?pid),
        }
    }

    while reader_open {
        match timeout(DRAIN_TIMEOUT, chunk_rx.recv()).await {
            Ok(Some(bytes)) => output.extend_from_slice(&bytes),
            Ok(None) | Err(_) => reader_open = false,
        }
    }
    drop(writer);
    drop(pair.master);

    debug!(
        event = "pty_complete",
        binary,
        completion = completion.as_str(),
        bytes = output.len()
    );
    Ok(PtyCapture {
        output: String::from_utf8_lossy(&output).into_owned(),
        completion,
        pid,
        exit_code,
    })
}

/// Text-only form of [`run_pty`].
pub async fn run_pty_command(
    binary: &str,
    args: &[String],
    input: &str,
    options: &PtyOptions,
) -> Result<String, PtyError> {
    run_pty(binary, args, input, options)
        .await
        .map(|capture| capture.output)
}

/// Removes CSI escape sequences.
pub fn strip_ansi(text: &str) -> String {
    static CSI: OnceLock<Regex> = OnceLock::new();
    let csi = CSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid regex"));
    csi.replace_all(text, "").into_owned()
}

fn spawn_error(binary: &str, message: String) -> PtyError {
    let lower = message.to_lowercase();
    if lower.contains("not found in path")
        || lower.contains("no such file")
        || lower.contains("doesn't exist")
    {
        PtyError::NotFound(binary.to_string())
    } else {
        PtyError::Spawn {
            binary: binary.to_string(),
            message,
        }
    }
}
