use anyhow::{bail, Context};
use clap::Parser;
use std::io::Write;
use ter_core::live::LiveOptions;
use ter_watch::{HostTarget, LiveManager, WsConnector};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ter-watch",
    about = "Follows the live feed of one or more agents",
    long_about = "Prints one JSON line per host change. Type `r` to refresh every host or `r <id>` for one."
)]
struct Args {
    /// `id=url` or `id=url#token`; repeat for more hosts.
    #[arg(long = "host", required = true)]
    hosts: Vec<String>,
    #[arg(long, default_value_t = false)]
    sessions: bool,
    #[arg(long, default_value_t = false)]
    preview: bool,
    #[arg(long, default_value_t = 6)]
    preview_lines: u32,
    #[arg(long, default_value_t = false)]
    insights: bool,
    #[arg(long, default_value_t = false)]
    host_metrics: bool,
    #[arg(long, default_value_t = false)]
    docker: bool,
    /// Push interval in milliseconds.
    #[arg(long, default_value_t = 5000)]
    interval: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let targets = args
        .hosts
        .iter()
        .map(|raw| parse_host(raw))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let options = LiveOptions {
        sessions: args.sessions,
        preview: args.preview,
        preview_lines: args.preview_lines,
        insights: args.insights,
        host: args.host_metrics,
        docker: args.docker,
        interval_ms: args.interval,
    };

    let mut manager = LiveManager::new(WsConnector, options);
    manager.set_hosts(targets);
    info!(event = "watch_start", hosts = manager.states().len());

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut stdout = std::io::stdout();

    for host_id in initial_ids(&manager) {
        print_state(&mut stdout, &manager, &host_id)?;
    }

    loop {
        tokio::select! {
            host_id = manager.next_update() => {
                print_state(&mut stdout, &manager, &host_id)?;
            }
            line = stdin.next_line(), if stdin_open => match line.context("read stdin")? {
                Some(line) => handle_command(&manager, line.trim()),
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    info!(event = "watch_stop");
    Ok(())
}

fn initial_ids<C>(manager: &LiveManager<C>) -> Vec<String>
where
    C: ter_watch::Connector,
{
    let mut ids: Vec<String> = manager.states().keys().cloned().collect();
    ids.sort();
    ids
}

fn handle_command<C: ter_watch::Connector>(manager: &LiveManager<C>, line: &str) {
    match line.split_once(' ') {
        None if line == "r" => {
            let sent = manager.refresh_all();
            debug!(event = "refresh_all", sent);
        }
        Some(("r", host_id)) => {
            let sent = manager.refresh_host(host_id.trim());
            debug!(event = "refresh_host", host = %host_id.trim(), sent);
        }
        _ if line.is_empty() => {}
        _ => eprintln!("unknown command: {line}"),
    }
}

fn print_state<C: ter_watch::Connector>(
    out: &mut impl Write,
    manager: &LiveManager<C>,
    host_id: &str,
) -> anyhow::Result<()> {
    let Some(state) = manager.state(host_id) else {
        return Ok(());
    };
    let line = serde_json::json!({ "host": host_id, "state": state });
    writeln!(out, "{line}").context("write stdout")?;
    out.flush().context("flush stdout")
}

fn parse_host(raw: &str) -> anyhow::Result<HostTarget> {
    let Some((id, rest)) = raw.split_once('=') else {
        bail!("host must look like id=url[#token]: {raw}");
    };
    let id = id.trim();
    if id.is_empty() {
        bail!("host id is empty: {raw}");
    }
    let (base_url, auth_token) = match rest.rsplit_once('#') {
        Some((url, token)) if !token.is_empty() => (url, Some(token.to_string())),
        Some((url, _)) => (url, None),
        None => (rest, None),
    };
    Ok(HostTarget {
        id: id.to_string(),
        base_url: base_url.trim().to_string(),
        auth_token,
    })
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else {
        std::env::var("TER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_specs() {
        let host = parse_host("box=https://box.lan:8787#abc").unwrap();
        assert_eq!(host.id, "box");
        assert_eq!(host.base_url, "https://box.lan:8787");
        assert_eq!(host.auth_token.as_deref(), Some("abc"));

        let plain = parse_host("local=http://127.0.0.1:8787").unwrap();
        assert_eq!(plain.auth_token, None);

        assert!(parse_host("no-separator").is_err());
        assert!(parse_host("=http://x").is_err());
    }
}
