use crate::*;

use std::time::Instant;

use tessera_services::RpcError;

/// Accepts one connection and never answers.
async fn silent_server() -> Result<(SocketAddr, PublicKey, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let hold = tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        }
    });
    Ok((addr, test_identity().public_key().clone(), hold))
}

#[tokio::test]
async fn silent_target_times_out_and_frees_its_slot() -> Result<()> {
    let (addr, key, hold) = silent_server().await?;
    let timeout = Duration::from_millis(300);
    let caller = Caller::new(Settings {
        rpc_timeout: timeout,
        ..settings()
    })?;
    let peer = caller.ctx.put_peer(&key)?;
    let target = caller.ctx.put_servant_ref(&peer, "echo")?;
    let conn = caller.client.connect(addr, key).await?;

    let started = Instant::now();
    let err = conn
        .call(&target, [("msg", Value::String("anyone?".into()))])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::TimeoutWaitingForResponse { .. }), "{err:?}");
    assert!(started.elapsed() >= timeout);
    assert!(conn.endpoint().pending().is_empty().await);

    conn.close().await;
    hold.abort();
    Ok(())
}

#[tokio::test]
async fn closing_cancels_outstanding_calls() -> Result<()> {
    let (addr, key, hold) = silent_server().await?;
    let caller = Caller::new(settings())?;
    let peer = caller.ctx.put_peer(&key)?;
    let target = caller.ctx.put_servant_ref(&peer, "echo")?;
    let conn = Arc::new(caller.client.connect(addr, key).await?);

    let pending = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.call(&target, [("msg", Value::String("x".into()))])
                .await
        })
    };
    while conn.endpoint().pending().is_empty().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    conn.shutdown().await;

    assert!(matches!(pending.await?, Err(RpcError::Stopping)));
    hold.abort();
    Ok(())
}
