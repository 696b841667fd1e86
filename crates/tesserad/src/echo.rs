//! Built-in `echo` servant: returns its `msg` argument unchanged.

use anyhow::{anyhow, Result};

use tessera_services::{Call, Reply, Servant};

pub struct Echo;

impl Servant for Echo {
    fn invoke(&self, call: &Call<'_>) -> Result<Reply> {
        let msg = call
            .param("msg")
            .ok_or_else(|| anyhow!("echo needs a msg argument"))?;
        tracing::debug!(sender = ?call.sender_peer_ref.map(|r| r.short()), "echo");
        Ok(Reply {
            value: msg.value.clone(),
            t: msg.t.clone(),
        })
    }
}
