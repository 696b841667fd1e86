use crate::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_never_cross_wires() -> Result<()> {
    let node = Node::spawn(settings()).await?;
    let caller = Caller::new(settings())?;
    let conn = Arc::new(caller.client.connect(node.addr, node.public_key()).await?);
    let target = caller.target(&node, "delayed")?;

    // Authenticate first so the calls below run concurrently rather than
    // from the pre-auth queue.
    conn.call(&target, [("msg", Value::String("warm-up".into()))])
        .await?;

    let mut handles = Vec::new();
    for i in 0..32i64 {
        let conn = conn.clone();
        let target = target.clone();
        handles.push(tokio::spawn(async move {
            let msg = format!("call {i}");
            let got = conn
                .call(
                    &target,
                    [
                        ("msg", Value::String(msg.clone())),
                        ("delay_ms", Value::Int((31 - i) % 5 * 10)),
                    ],
                )
                .await?;
            anyhow::ensure!(got == Value::String(msg), "call {i} got {got:?}");
            anyhow::Ok(())
        }));
    }
    for h in handles {
        h.await??;
    }
    assert!(conn.endpoint().pending().is_empty().await);
    node.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_callers_share_one_node() -> Result<()> {
    let node = Arc::new(Node::spawn(settings()).await?);
    let mut handles = Vec::new();
    for c in 0..4 {
        let node = node.clone();
        handles.push(tokio::spawn(async move {
            let caller = Caller::new(settings())?;
            let conn = caller.client.connect(node.addr, node.public_key()).await?;
            let target = caller.target(&node, "echo")?;
            for i in 0..5 {
                let msg = format!("caller {c} call {i}");
                let got = conn.call(&target, [("msg", Value::String(msg.clone()))]).await?;
                anyhow::ensure!(got == Value::String(msg));
            }
            conn.close().await;
            anyhow::Ok(())
        }));
    }
    for h in handles {
        h.await??;
    }
    Ok(())
}
