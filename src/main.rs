//! Command line front end.
//!
//! `teleshell target` runs a demonstration target: a runtime with the agent installed, reachable
//! on a debug port. `teleshell eval` attaches to a target and runs snippets in it.

use std::{
    io::BufRead,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{info, warn};
use teleshell::{
    agent::Agent,
    attach::ExecutionEnv,
    cancellation::CancellationToken,
    config::{DEFAULT_CONNECTOR, DEFAULT_HOST_NAME, DEFAULT_PORT},
    contract::DEFAULT_EXECUTOR_TYPE,
    operate::capnp::execution::{ERR, OUT},
    runtime::{debug_server, Runtime},
    ConnectionParams, ExecutionError, Session,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a target with the agent installed, until interrupted.
    Target {
        /// Debug port to listen on, 0 picks an ephemeral one.
        #[clap(long, env = "TELESHELL_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Attach to a target and run snippets in it.
    ///
    /// Without snippet arguments, snippets are read from the standard input, one per line.
    Eval {
        #[clap(long, env = "TELESHELL_HOST", default_value = DEFAULT_HOST_NAME)]
        host: String,

        #[clap(long, env = "TELESHELL_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Bound of the handshake and of the dial-back, in milliseconds.
        #[clap(long, default_value_t = 30_000)]
        timeout: u64,

        /// Type executing snippets in the target.
        #[clap(long, default_value = DEFAULT_EXECUTOR_TYPE)]
        remote_agent: String,

        #[clap(long, default_value = DEFAULT_CONNECTOR)]
        connector: String,

        /// Stop each snippet still running after this many milliseconds.
        #[clap(long)]
        stop_after: Option<u64>,

        snippets: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Target { port } => run_target(port),
        Command::Eval {
            host,
            port,
            timeout,
            remote_agent,
            connector,
            stop_after,
            snippets,
        } => {
            let params = ConnectionParams {
                hostname: host,
                port,
                remote_agent,
                timeout: Duration::from_millis(timeout),
                connector,
            };
            run_eval(&params, stop_after.map(Duration::from_millis), snippets)
        }
    }
}

fn run_target(port: u16) -> anyhow::Result<()> {
    let runtime = Runtime::new();
    Agent::install(&runtime).context("cannot install the agent")?;

    let cancellation_token = CancellationToken::new();
    let (addr, server) = debug_server::spawn(
        runtime.clone(),
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        cancellation_token.clone(),
    )
    .with_context(|| format!("cannot listen on port {port}"))?;
    println!("debug port: {}", addr.port());

    wait_for_termination()?;
    info!(target: "teleshell::runtime", "terminating");
    runtime.exit("terminated by signal");
    cancellation_token.cancel();

    server
        .join()
        .map_err(|_| anyhow::anyhow!("debug server panicked"))?
        .context("debug server failed")
}

#[cfg(unix)]
fn wait_for_termination() -> anyhow::Result<()> {
    use async_signal::{Signal, Signals};
    use futures::StreamExt;

    let mut signals = Signals::new([Signal::Int, Signal::Term])?;
    futures::executor::block_on(async {
        while let Some(signal) = signals.next().await {
            match signal {
                Ok(signal) => {
                    info!(target: "teleshell::runtime", "received {signal:?}");
                    break;
                }
                Err(e) => warn!(target: "teleshell::runtime", "signal failure: {e}"),
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn wait_for_termination() -> anyhow::Result<()> {
    let mut line = String::new();
    println!("press enter to terminate");
    std::io::stdin().read_line(&mut line)?;
    Ok(())
}

fn run_eval(
    params: &ConnectionParams,
    stop_after: Option<Duration>,
    snippets: Vec<String>,
) -> anyhow::Result<()> {
    let from_stdin = snippets.is_empty();
    let env = if from_stdin {
        ExecutionEnv::new()
            .with_output(OUT, std::io::stdout())
            .with_output(ERR, std::io::stderr())
    } else {
        ExecutionEnv::stdio()
    };
    let session = teleshell::attach_with_env(params, env)
        .with_context(|| format!("cannot attach to {}:{}", params.hostname, params.port))?;
    session.on_exit(|description| eprintln!("target exited: {description}"));

    let mut failed = false;
    if from_stdin {
        for line in std::io::stdin().lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            failed |= !eval_one(&session, &line, stop_after);
        }
    } else {
        for snippet in &snippets {
            failed |= !eval_one(&session, snippet, stop_after);
        }
    }

    session.close();
    if failed {
        anyhow::bail!("some snippets failed");
    }
    Ok(())
}

/// Runs one snippet, printing its value or its error.
fn eval_one(session: &Session, snippet: &str, stop_after: Option<Duration>) -> bool {
    let result = match stop_after {
        None => session.invoke(snippet),
        Some(delay) => std::thread::scope(|scope| {
            let done = CancellationToken::new();
            scope.spawn({
                let done = done.clone();
                move || {
                    if !done.wait_timeout(delay) {
                        if let Err(e) = session.stop() {
                            warn!(target: "teleshell::attach", "cannot stop the snippet: {e}");
                        }
                    }
                }
            });
            let result = session.invoke(snippet);
            done.cancel();
            result
        }),
    };

    match result {
        Ok(value) => {
            println!("{value}");
            true
        }
        Err(ExecutionError::Stopped) => {
            eprintln!("stopped");
            false
        }
        Err(e) => {
            eprintln!("error: {e}");
            false
        }
    }
}
