//! Remote call commands.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use tessera_core::config::TesseraConfig;
use tessera_core::crypto::{Identity, PublicKey};
use tessera_services::{Client, Context, RpcError, Settings, Value};

pub async fn cmd_call_echo(
    addr: SocketAddr,
    server_key_path: &Path,
    identity_path: &Path,
    msg: &str,
) -> Result<()> {
    let server_key = PublicKey::load_pem(server_key_path)
        .with_context(|| format!("failed to read server key {}", server_key_path.display()))?;
    let identity = Arc::new(
        Identity::load(identity_path)
            .with_context(|| format!("failed to load identity {}", identity_path.display()))?,
    );

    let config = TesseraConfig::load().unwrap_or_default();
    let ctx = Arc::new(Context::in_memory(Settings::from_config(&config))?);
    let server_peer = ctx.put_peer(&server_key)?;
    let target = ctx.put_servant_ref(&server_peer, "echo")?;

    let client = Client::new(ctx, vec![identity]);
    let conn = client.connect(addr, server_key).await?;
    let result = conn
        .call(&target, [("msg", Value::String(msg.to_string()))])
        .await;
    conn.close().await;

    match result {
        Ok(Value::String(s)) => println!("{s}"),
        Ok(other) => println!("{other:?}"),
        Err(RpcError::Remote { message, traceback }) => {
            eprintln!("remote error: {message}");
            for line in traceback {
                eprintln!("  {line}");
            }
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
