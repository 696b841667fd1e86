//! tessera-ctl — command-line interface for Tessera nodes.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use tessera_core::config::DEFAULT_PORT;
use tessera_core::crypto::DEFAULT_KEY_BITS;

mod cmd;

fn print_usage() {
    println!("tessera-ctl — Tessera node CLI");
    println!();
    println!("USAGE:");
    println!("  tessera-ctl identity generate <path> [--overwrite] [--bits N]");
    println!("  tessera-ctl identity show <path>");
    println!("  tessera-ctl call [--addr host:port] --server-key <pub.pem> --identity <path> echo <msg>");
    println!();
    println!("OPTIONS:");
    println!("  --addr        Node address (default 127.0.0.1:{})", DEFAULT_PORT);
    println!("  --server-key  Node public key PEM (the daemon's identity .pub)");
    println!("  --identity    Private key PEM to prove possession with");
}

#[derive(Default)]
struct Flags {
    overwrite: bool,
    bits: Option<usize>,
    addr: Option<SocketAddr>,
    server_key: Option<PathBuf>,
    identity: Option<PathBuf>,
}

/// Split flags from positional arguments.
fn parse(args: &[String]) -> Result<(Flags, Vec<&str>)> {
    let mut flags = Flags::default();
    let mut positional = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let value = |i: usize| {
            args.get(i + 1)
                .with_context(|| format!("{} needs a value", args[i]))
        };
        match args[i].as_str() {
            "--overwrite" => flags.overwrite = true,
            "--bits" => {
                flags.bits = Some(value(i)?.parse().context("--bits must be a number")?);
                i += 1;
            }
            "--addr" => {
                flags.addr = Some(value(i)?.parse().context("--addr must be host:port")?);
                i += 1;
            }
            "--server-key" => {
                flags.server_key = Some(PathBuf::from(value(i)?));
                i += 1;
            }
            "--identity" => {
                flags.identity = Some(PathBuf::from(value(i)?));
                i += 1;
            }
            other => positional.push(other),
        }
        i += 1;
    }
    Ok((flags, positional))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (flags, positional) = parse(&args)?;

    match positional.as_slice() {
        ["identity", "generate", path] => cmd::identity::cmd_identity_generate(
            &PathBuf::from(path),
            flags.overwrite,
            flags.bits.unwrap_or(DEFAULT_KEY_BITS),
        ),
        ["identity", "show", path] => cmd::identity::cmd_identity_show(&PathBuf::from(path)),
        ["call", "echo", msg] => {
            let addr = flags
                .addr
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)));
            let Some(server_key) = flags.server_key else {
                bail!("call needs --server-key");
            };
            let Some(identity) = flags.identity else {
                bail!("call needs --identity");
            };
            cmd::call::cmd_call_echo(addr, &server_key, &identity, msg).await
        }
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            print_usage();
            std::process::exit(1);
        }
    }
}
