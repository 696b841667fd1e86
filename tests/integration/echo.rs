use crate::*;

use tessera_core::crypto::generate_identity;
use tessera_core::Route;
use tessera_services::route::unix_now;
use tessera_services::RpcError;

/// A generates a keypair, connects to B, proves possession and calls echo.
#[tokio::test]
async fn generate_connect_prove_and_echo() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("a.pem");
    generate_identity(&path, false, TEST_KEY_BITS)?;
    let a_identity = Arc::new(Identity::load(&path)?);

    let b = Node::spawn(settings()).await?;
    let a = Caller::with_identities(settings(), vec![a_identity])?;
    let conn = a.client.connect(b.addr, b.public_key()).await?;

    let got = conn
        .call(&a.target(&b, "echo")?, [("msg", Value::String("hi".into()))])
        .await?;
    assert_eq!(got, Value::String("hi".into()));

    conn.close().await;
    b.stop().await
}

#[tokio::test]
async fn peer_refs_agree_across_nodes() -> Result<()> {
    let b = Node::spawn(settings()).await?;
    let a = Caller::new(settings())?;
    assert_eq!(a.ctx.put_peer(&b.public_key())?, b.peer);
    b.stop().await
}

#[tokio::test]
async fn connect_peer_follows_learned_routes() -> Result<()> {
    let b = Node::spawn(settings()).await?;
    let a = Caller::new(settings())?;

    let peer = a.ctx.put_peer(&b.public_key())?;
    let transport = a.ctx.builtins.put_tcp_transport(
        &a.ctx.web,
        &a.ctx.types,
        "127.0.0.1",
        b.addr.port(),
    )?;
    a.ctx.routes.learn(&[Route {
        endpoint_ref: peer.clone(),
        transport_ref: transport,
        available_at: unix_now(),
    }]);

    let conn = a.client.connect_peer(&peer).await?;
    let got = conn
        .call(&a.target(&b, "echo")?, [("msg", Value::String("routed".into()))])
        .await?;
    assert_eq!(got, Value::String("routed".into()));

    conn.close().await;
    b.stop().await
}

#[tokio::test]
async fn connect_peer_without_routes_fails() -> Result<()> {
    let b = Node::spawn(settings()).await?;
    let a = Caller::new(settings())?;
    let peer = a.ctx.put_peer(&b.public_key())?;
    assert!(a.client.connect_peer(&peer).await.is_err());
    b.stop().await
}

/// Record types defined only on the caller travel in the request bundle.
#[tokio::test]
async fn caller_defined_record_roundtrips() -> Result<()> {
    let b = Node::spawn(settings()).await?;
    let a = Caller::new(settings())?;
    let conn = a.client.connect(b.addr, b.public_key()).await?;

    let (_, point) = a.ctx.types.register_record(
        &a.ctx.web,
        "point",
        &[("x", Primitive::Int.type_ref()), ("y", Primitive::Int.type_ref())],
    )?;
    let value = Value::record([("x", Value::Int(3)), ("y", Value::Int(-4))]);

    let (got, t) = conn
        .call_typed(
            &a.target(&b, "echo")?,
            vec![("msg".to_string(), value.clone(), point.clone())],
        )
        .await?;
    assert_eq!(got, value);
    assert_eq!(*t, *point);

    conn.close().await;
    b.stop().await
}

#[tokio::test]
async fn servant_failure_reaches_the_caller() -> Result<()> {
    let b = Node::spawn(settings()).await?;
    let a = Caller::new(settings())?;
    let conn = a.client.connect(b.addr, b.public_key()).await?;

    let err = conn
        .call(&a.target(&b, "echo")?, [("wrong", Value::Int(1))])
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { message, .. } => assert!(message.contains("missing msg"), "{message}"),
        other => bail!("expected a remote error, got {other:?}"),
    }

    // The connection is still usable afterwards.
    let got = conn
        .call(&a.target(&b, "echo")?, [("msg", Value::Int(5))])
        .await?;
    assert_eq!(got, Value::Int(5));

    conn.close().await;
    b.stop().await
}
