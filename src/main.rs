//! ferny-askpass: askpass helper speaking the interaction protocol
//!
//! Run by ssh (or anything else honoring SSH_ASKPASS) with its stderr
//! connected to the controlling process's interaction agent.
//!
//! Usage:
//!   ferny-askpass "Enter passphrase for key:"   # ask, exit with the verdict
//!   ferny-askpass                               # signal end of interaction

use anyhow::{Context, Result};
use clap::Parser;
use ferny_agent::{askpass, send_command, END_COMMAND};
use std::collections::BTreeMap;
use std::io;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// Askpass helper for the ferny interaction protocol
#[derive(Parser, Debug)]
#[command(name = "ferny-askpass")]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct Args {
    /// Arguments from the caller, forwarded verbatim (usually a prompt)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    argv: Vec<String>,
}

fn main() {
    let args = Args::parse();

    // Off unless asked for: stderr is the transport.
    let filter = std::env::var("FERNY_ASKPASS_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new("off"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("ferny-askpass: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(args: Args) -> Result<i32> {
    if args.argv.is_empty() {
        debug!("No arguments, ending the interaction");
        send_command(io::stderr(), END_COMMAND, &[], &[]).context("Failed to send end command")?;
        return Ok(0);
    }

    let program = std::env::args()
        .next()
        .unwrap_or_else(|| "ferny-askpass".to_string());
    let mut argv = Vec::with_capacity(args.argv.len() + 1);
    argv.push(program);
    argv.extend(args.argv);

    // Variables that aren't valid UTF-8 can't be represented as literals.
    let env: BTreeMap<String, String> = std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect();

    debug!("Asking with argv {:?}", argv);
    askpass(io::stderr(), io::stdout(), &argv, &env).context("Askpass interaction failed")
}
