mod common;

use std::sync::atomic::Ordering;

use tether::{Call, Context, Error, Interface, Peer, PeerOptions, Slots};

use common::{counter, eventually, init_logs, meter};

fn args_for(name: &str) -> Slots {
    let mut args = Slots::default();
    args.set(0, &name).unwrap();
    args
}

#[tokio::test]
async fn bootstrap_ping() {
    init_logs();

    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(meter());
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Peer::new(PeerOptions::default()).unwrap();
    let handle = client
        .resolve(&address.to_string(), "meter")
        .await
        .unwrap();

    let results = handle
        .call(&Context::background(), "readTemperature", args_for("probe-1"))
        .await
        .unwrap();

    assert_eq!(results.get::<f32>(0).unwrap(), 42.0);
    assert_eq!(results.get::<String>(1).unwrap(), "probe-1");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn panic_shield_reports_and_recovers() {
    init_logs();

    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(meter());
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Peer::new(PeerOptions::default()).unwrap();
    let handle = client
        .resolve(&address.to_string(), "meter")
        .await
        .unwrap();

    let error = handle
        .call(&Context::background(), "explode", Slots::default())
        .await
        .unwrap_err();
    assert_eq!(error, Error::RemotePanic("boom".to_string()));

    // The capability survives the panic.
    let results = handle
        .call(&Context::background(), "readTemperature", args_for("probe-1"))
        .await
        .unwrap();
    assert_eq!(results.get::<f32>(0).unwrap(), 42.0);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn unknown_method_surfaces_not_found() {
    init_logs();

    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(meter());
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Peer::new(PeerOptions::default()).unwrap();
    let handle = client
        .resolve(&address.to_string(), "meter")
        .await
        .unwrap();

    let error = handle
        .call(&Context::background(), "readHumidity", Slots::default())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::NotFound(_)));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn deref_on_close_fires_the_closer_once() {
    init_logs();

    let (closed, hook) = counter();

    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(meter().on_close(hook));
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Peer::new(PeerOptions::default()).unwrap();
    let handle = client
        .resolve(&address.to_string(), "meter")
        .await
        .unwrap();
    let oid = handle.capability().oid;

    handle
        .call(&Context::background(), "readTemperature", args_for("probe-1"))
        .await
        .unwrap();
    assert!(server.registry().contains(&oid));

    handle.close().await;

    eventually("the close hook", || closed.load(Ordering::SeqCst) == 1).await;
    assert!(!server.registry().contains(&oid));

    // A second close is a no-op.
    handle.close().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn foreign_peer_cannot_use_a_stolen_capability() {
    init_logs();

    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(meter());
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Peer::new(PeerOptions::default()).unwrap();
    let handle = client
        .resolve(&address.to_string(), "meter")
        .await
        .unwrap();

    // A different peer replays the capability value it observed.
    let thief = Peer::new(PeerOptions::default()).unwrap();
    let stolen = thief.client(handle.capability());
    let error = stolen
        .call(&Context::background(), "readTemperature", args_for("probe-1"))
        .await
        .unwrap_err();

    assert!(matches!(error, Error::Unauthorized(_)));

    client.close().await;
    thief.close().await;
    server.close().await;
}

#[tokio::test]
async fn ref_counting_keeps_the_capability_alive() {
    init_logs();

    let (closed, hook) = counter();

    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(meter().on_close(hook));
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Peer::new(PeerOptions::default()).unwrap();
    let handle = client
        .resolve(&address.to_string(), "meter")
        .await
        .unwrap();
    let oid = handle.capability().oid;

    handle.add_ref().await.unwrap();
    handle.deref().await.unwrap();
    assert!(server.registry().contains(&oid));
    assert_eq!(closed.load(Ordering::SeqCst), 0);

    handle.deref().await.unwrap();
    eventually("the close hook", || closed.load(Ordering::SeqCst) == 1).await;
    assert!(!server.registry().contains(&oid));

    // Another deref is unknown-capability territory.
    let error = handle.deref().await.unwrap_err();
    assert!(matches!(error, Error::NotFound(_)));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn reexport_hands_the_vtable_to_another_peer() {
    init_logs();

    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(meter());
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let first = Peer::new(PeerOptions::default()).unwrap();
    let second = Peer::new(PeerOptions::default()).unwrap();

    let handle = first.resolve(&address.to_string(), "meter").await.unwrap();
    let exported = handle.reexport(second.identity()).await.unwrap();
    assert_ne!(exported.oid, handle.capability().oid);

    let results = second
        .client(exported)
        .call(&Context::background(), "readTemperature", args_for("probe-2"))
        .await
        .unwrap();
    assert_eq!(results.get::<String>(1).unwrap(), "probe-2");

    first.close().await;
    second.close().await;
    server.close().await;
}

#[tokio::test]
async fn unix_socket_serves_the_same_session_machinery() {
    init_logs();

    let path = std::env::temp_dir().join(format!("tether-test-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let address = format!("unix:{}", path.display());

    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(meter());
    server.listen_unix(&path.display().to_string()).await.unwrap();

    let client = Peer::new(PeerOptions::default()).unwrap();
    let handle = client.resolve(&address, "meter").await.unwrap();

    let results = handle
        .call(&Context::background(), "readTemperature", args_for("probe-1"))
        .await
        .unwrap();
    assert_eq!(results.get::<f32>(0).unwrap(), 42.0);

    client.close().await;
    server.close().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn bearer_tokens_gate_every_request() {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use ed25519_dalek::pkcs8::EncodePrivateKey;

    init_logs();

    let issuer = ed25519_dalek::SigningKey::from_bytes(&[3u8; 32]);
    let jwks = serde_json::json!({
        "keys": [{
            "kty": "OKP",
            "crv": "Ed25519",
            "x": URL_SAFE_NO_PAD.encode(issuer.verifying_key().to_bytes()),
        }]
    })
    .to_string();

    #[derive(serde::Serialize)]
    struct Claims {
        sub: String,
        exp: i64,
    }
    let der = issuer.to_pkcs8_der().unwrap();
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::EdDSA),
        &Claims {
            sub: "svc:tests".to_string(),
            exp: chrono::Utc::now().timestamp() + 600,
        },
        &jsonwebtoken::EncodingKey::from_ed_der(der.as_bytes()),
    )
    .unwrap();

    let server = Peer::new(PeerOptions {
        bearer_jwks: Some(jwks),
        ..PeerOptions::default()
    })
    .unwrap();
    server.expose(meter());
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    // Without a token every endpoint refuses, lookup included.
    let anonymous = Peer::new(PeerOptions::default()).unwrap();
    let error = anonymous
        .resolve(&address.to_string(), "meter")
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Unauthorized(_)));

    let client = Peer::new(PeerOptions {
        token: Some(token),
        ..PeerOptions::default()
    })
    .unwrap();
    let handle = client
        .resolve(&address.to_string(), "meter")
        .await
        .unwrap();
    let results = handle
        .call(&Context::background(), "readTemperature", args_for("probe-1"))
        .await
        .unwrap();
    assert_eq!(results.get::<f32>(0).unwrap(), 42.0);

    anonymous.close().await;
    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn capabilities_returned_from_handlers_are_invokable() {
    init_logs();

    // A directory interface minting per-entry capabilities on demand.
    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(Interface::new("directory").method(
        "open",
        |_cx, mut call: Call| async move {
            let name: String = call.arg(0)?;
            let capability = call.mint(std::sync::Arc::new(
                Interface::new("entry").method("describe", move |_cx, mut call: Call| {
                    let name = name.clone();
                    async move {
                        call.set(0, &format!("entry {}", name))?;
                        Ok(call)
                    }
                }),
            ));
            call.set(0, &capability)?;
            Ok(call)
        },
    ));
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Peer::new(PeerOptions::default()).unwrap();
    let directory = client
        .resolve(&address.to_string(), "directory")
        .await
        .unwrap();

    let results = directory
        .call(&Context::background(), "open", args_for("billing"))
        .await
        .unwrap();
    let entry = client.client(results.capability(0).unwrap());

    let described = entry
        .call(&Context::background(), "describe", Slots::default())
        .await
        .unwrap();
    assert_eq!(described.get::<String>(0).unwrap(), "entry billing");

    client.close().await;
    server.close().await;
}
