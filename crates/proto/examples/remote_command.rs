//! Remote Command Example
//!
//! Runs a command (or an interactive shell) on a remote host, much like
//! `ssh [-p port] [-o Name=value]... user@host [command]`.
//!
//! Key features:
//! - OpenSSH-style `-o` options (StrictHostKeyChecking, RekeyLimit, ...)
//! - Default key from `~/.ssh`, password from `TETHER_PASSWORD`
//! - Exit code mirrors the remote command; 255 on connection errors
//!
//! Usage:
//!   cargo run --example remote_command -- [-p port] [-o Name=value]... <user@host> [command...]
//!
//! Example:
//!   RUST_LOG=tether_proto=debug cargo run --example remote_command -- \
//!       -p 2222 -o StrictHostKeyChecking=accept-new admin@127.0.0.1 uname -a

use std::env;
use std::sync::Arc;

use tether_proto::ssh::{Credentials, ExitStatus, Options, Session, StaticPrompter, Target};
use tracing_subscriber::EnvFilter;

struct Args {
    target: Target,
    options: Vec<(String, String)>,
    command: Option<String>,
}

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} [-p port] [-o Name=value]... <user@host> [command...]",
        program
    );
    std::process::exit(255);
}

fn parse_args() -> Result<Args, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("remote_command");
    let mut port = None;
    let mut options = Vec::new();
    let mut rest = args.iter().skip(1);

    let destination = loop {
        match rest.next().map(String::as_str) {
            Some("-p") => {
                let value = rest.next().unwrap_or_else(|| usage(program));
                port = Some(value.parse::<u16>()?);
            }
            Some("-o") => {
                let value = rest.next().unwrap_or_else(|| usage(program));
                options.push(Options::parse_pair(value)?);
            }
            Some(arg) if arg.starts_with('-') => usage(program),
            Some(arg) => break arg.to_string(),
            None => usage(program),
        }
    };

    let mut target = Target::parse(&destination);
    if let Some(port) = port {
        target = target.with_port(port);
    }
    let command: Vec<&str> = rest.map(String::as_str).collect();
    Ok(Args {
        target,
        options,
        command: (!command.is_empty()).then(|| command.join(" ")),
    })
}

async fn run(args: Args) -> Result<ExitStatus, Box<dyn std::error::Error>> {
    let options = Options::from_pairs(args.options)?;

    let mut credentials = Credentials::new().with_default_key();
    if let Ok(password) = env::var("TETHER_PASSWORD") {
        credentials = credentials.with_prompter(Arc::new(StaticPrompter::new(password)));
    }

    let mut session = Session::new(args.target, options).with_credentials(credentials);
    let mut live = session.connect().await?;
    tracing::info!(method = %live.authenticated().method, "Authenticated");

    let status = match args.command.as_deref() {
        Some(command) => {
            live.run(
                Some(command),
                tokio::io::stdin(),
                tokio::io::stdout(),
                tokio::io::stderr(),
            )
            .await?
        }
        None => live.run_interactive().await?,
    };
    live.close().await?;
    Ok(status)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("remote_command: {}", e);
            std::process::exit(255);
        }
    };

    let code = match run(args).await {
        Ok(ExitStatus::Code(code)) => code as i32,
        Ok(status) => {
            eprintln!("remote_command: {}", status);
            255
        }
        Err(e) => {
            eprintln!("remote_command: {}", e);
            255
        }
    };
    std::process::exit(code);
}
