use crate::*;

use anyhow::Context as _;
use tessera_core::Bundle;
use tessera_services::RpcError;
use tokio::sync::mpsc;

type PendingCall = JoinHandle<Result<Value, RpcError>>;

/// Issue `n` recorder calls through `endpoint` and capture their request
/// bundles in issue order.
async fn issue(
    endpoint: &Arc<RpcEndpoint>,
    target: &Ref,
    n: usize,
) -> Result<(Vec<PendingCall>, Vec<Bundle>)> {
    let (tx, mut rx) = mpsc::channel(16);
    let mut calls = Vec::new();
    let mut bundles = Vec::new();
    for i in 0..n {
        let endpoint = endpoint.clone();
        let tx = tx.clone();
        let target = target.clone();
        calls.push(tokio::spawn(async move {
            endpoint
                .call(&tx, &target, [("msg", Value::String(format!("m{i}")))])
                .await
        }));
        bundles.push(rx.recv().await.context("request not emitted")?);
    }
    Ok((calls, bundles))
}

#[tokio::test]
async fn requests_before_proof_run_in_order_after_it() -> Result<()> {
    let node = Node::spawn(settings()).await?;
    let caller = Caller::new(settings())?;
    let target = caller.target(&node, "recorder")?;
    let endpoint = Arc::new(RpcEndpoint::new(caller.ctx.clone()));
    let (calls, bundles) = issue(&endpoint, &target, 5).await?;

    let mut raw = RawClient::connect(&node, vec![caller.identity.clone()]).await?;
    for bundle in &bundles {
        raw.send(&SessionMessage::Payload(bundle.encode()?)).await?;
    }

    let SessionEvent::Send(proof) = raw.recv().await? else {
        bail!("expected a challenge first");
    };
    assert!(node.recorder.seen.lock().unwrap().is_empty());
    raw.send(&proof).await?;

    for _ in 0..bundles.len() {
        let SessionEvent::Deliver(payload) = raw.recv().await? else {
            bail!("expected a response");
        };
        endpoint.handle_bundle(Bundle::decode(&payload)?).await;
    }
    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await??, Value::String(format!("m{i}")));
    }

    let expected: Vec<String> = (0..5).map(|i| format!("m{i}")).collect();
    assert_eq!(*node.recorder.seen.lock().unwrap(), expected);
    node.stop().await
}

#[tokio::test]
async fn requests_beyond_the_queue_bound_are_refused() -> Result<()> {
    let node = Node::spawn(Settings {
        max_pending: 2,
        ..settings()
    })
    .await?;
    let caller = Caller::new(settings())?;
    let target = caller.target(&node, "recorder")?;
    let endpoint = Arc::new(RpcEndpoint::new(caller.ctx.clone()));
    let (mut calls, bundles) = issue(&endpoint, &target, 3).await?;

    // No identities: the proof can never verify.
    let mut raw = RawClient::connect(&node, vec![]).await?;
    for bundle in &bundles {
        raw.send(&SessionMessage::Payload(bundle.encode()?)).await?;
    }

    let SessionEvent::Send(_) = raw.recv().await? else {
        bail!("expected a challenge first");
    };
    let SessionEvent::Deliver(payload) = raw.recv().await? else {
        bail!("expected the refusal");
    };
    endpoint.handle_bundle(Bundle::decode(&payload)?).await;

    let third = calls.pop().context("three calls issued")?;
    assert!(matches!(third.await?, Err(RpcError::NotAuthorized)));
    assert!(node.recorder.seen.lock().unwrap().is_empty());

    endpoint.stop().await;
    node.stop().await
}

#[tokio::test]
async fn unproven_requests_expire_as_not_authorized() -> Result<()> {
    let ttl = Duration::from_millis(200);
    let node = Node::spawn(Settings {
        pending_ttl: ttl,
        ..settings()
    })
    .await?;
    let caller = Caller::with_identities(settings(), vec![])?;
    let conn = caller.client.connect(node.addr, node.public_key()).await?;

    let started = std::time::Instant::now();
    let err = conn
        .call(&caller.target(&node, "recorder")?, [("msg", Value::String("late".into()))])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NotAuthorized), "{err:?}");
    assert!(started.elapsed() >= ttl);
    assert!(node.recorder.seen.lock().unwrap().is_empty());

    conn.close().await;
    node.stop().await
}
