//! Identity management commands.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use tessera_core::crypto::{generate_identity, public_key_path, Identity, PublicKey};
use tessera_services::{Context, Settings};

pub fn cmd_identity_generate(path: &Path, overwrite: bool, bits: usize) -> Result<()> {
    let identity = generate_identity(path, overwrite, bits)
        .with_context(|| format!("failed to generate identity at {}", path.display()))?;
    println!("Identity written to {}", path.display());
    println!("Public key written to {}", public_key_path(path).display());
    print_key(identity.public_key())
}

/// Accepts either a private key or a `.pub` file.
pub fn cmd_identity_show(path: &Path) -> Result<()> {
    let key = match Identity::load(path) {
        Ok(identity) => identity.public_key().clone(),
        Err(_) => PublicKey::load_pem(path)
            .with_context(|| format!("{} is neither an identity nor a public key", path.display()))?,
    };
    print_key(&key)
}

fn print_key(key: &PublicKey) -> Result<()> {
    let ctx = Arc::new(Context::in_memory(Settings::default())?);
    let peer = ctx.put_peer(key)?;
    println!("═══════════════════════════════════════");
    println!("  Key id   : {}", hex::encode(key.id()));
    println!("  Peer ref : {}", peer);
    println!("═══════════════════════════════════════");
    Ok(())
}
