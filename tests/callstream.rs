mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use tether::{Call, Context, Error, Interface, Peer, PeerOptions, Slots};

use common::{counter, eventually, init_logs};

/// Peer A's side of the inline-callback scenario: `registerUpdates`
/// invokes the caller-supplied receiver while the call is in flight.
fn meter_updates() -> Interface {
    Interface::new("meterUpdates").method("registerUpdates", |_cx, call: Call| async move {
        let receiver = call.client(0).await?;

        let mut update = Slots::default();
        update.set(0, &"test")?;
        update.set(1, &42.0f32)?;
        receiver.invoke("update", update).await?;
        receiver.close().await;

        Ok(call)
    })
}

/// The caller-side receiver vtable, recording updates as they land.
fn update_receiver(seen: Arc<Mutex<Vec<(String, f32)>>>) -> Interface {
    Interface::new("updateReceiver").method("update", move |_cx, call: Call| {
        let seen = seen.clone();
        async move {
            let meter: String = call.arg(0)?;
            let temperature: f32 = call.arg(1)?;
            seen.lock().push((meter, temperature));
            Ok(call)
        }
    })
}

#[tokio::test]
async fn inline_callback_runs_before_the_call_returns() {
    init_logs();

    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(meter_updates());
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Peer::new(PeerOptions::default()).unwrap();
    let handle = client
        .resolve(&address.to_string(), "meterUpdates")
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (closed, hook) = counter();

    let mut callbacks = handle.callbacks();
    let receiver = callbacks.push(update_receiver(seen.clone()).on_close(hook));
    assert!(receiver.inline);

    let mut args = Slots::default();
    args.set(0, &receiver).unwrap();

    handle
        .call_with_callbacks(&Context::background(), "registerUpdates", args, callbacks)
        .await
        .unwrap();

    // The update completed before registerUpdates returned, and the
    // deref record already ran the receiver's close hook.
    assert_eq!(seen.lock().clone(), vec![("test".to_string(), 42.0)]);
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn unclosed_inline_clients_are_derefed_at_call_end() {
    init_logs();

    // The handler never closes the receiver; the framework derefs it
    // before the terminal record.
    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(Interface::new("meterUpdates").method(
        "registerUpdates",
        |_cx, call: Call| async move {
            let receiver = call.client(0).await?;
            receiver.invoke("update", Slots::default()).await?;
            Ok(call)
        },
    ));
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Peer::new(PeerOptions::default()).unwrap();
    let handle = client
        .resolve(&address.to_string(), "meterUpdates")
        .await
        .unwrap();

    let (closed, hook) = counter();
    let mut callbacks = handle.callbacks();
    let receiver = callbacks.push(
        Interface::new("updateReceiver")
            .method("update", |_cx, call: Call| async move { Ok(call) })
            .on_close(hook),
    );

    let mut args = Slots::default();
    args.set(0, &receiver).unwrap();

    handle
        .call_with_callbacks(&Context::background(), "registerUpdates", args, callbacks)
        .await
        .unwrap();

    eventually("the close hook", || closed.load(Ordering::SeqCst) == 1).await;

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn callback_errors_reach_the_handler() {
    init_logs();

    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(Interface::new("meterUpdates").method(
        "registerUpdates",
        |_cx, call: Call| async move {
            let receiver = call.client(0).await?;
            // The receiver rejects the update; surface its trio.
            receiver.invoke("update", Slots::default()).await?;
            Ok(call)
        },
    ));
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Peer::new(PeerOptions::default()).unwrap();
    let handle = client
        .resolve(&address.to_string(), "meterUpdates")
        .await
        .unwrap();

    let mut callbacks = handle.callbacks();
    let receiver = callbacks.push(Interface::new("updateReceiver").method(
        "update",
        |_cx, _call: Call| async move {
            Err(Error::fault("metering", "closed-probe", "probe disconnected"))
        },
    ));

    let mut args = Slots::default();
    args.set(0, &receiver).unwrap();

    let error = handle
        .call_with_callbacks(&Context::background(), "registerUpdates", args, callbacks)
        .await
        .unwrap_err();

    assert_eq!(
        error,
        Error::fault("metering", "closed-probe", "probe disconnected")
    );

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn plain_calls_still_work_without_callbacks() {
    init_logs();

    let server = Peer::new(PeerOptions::default()).unwrap();
    server.expose(common::meter());
    let address = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Peer::new(PeerOptions::default()).unwrap();
    let handle = client
        .resolve(&address.to_string(), "meter")
        .await
        .unwrap();

    let mut args = Slots::default();
    args.set(0, &"probe-1").unwrap();

    let results = handle
        .call_with_callbacks(
            &Context::background(),
            "readTemperature",
            args,
            handle.callbacks(),
        )
        .await
        .unwrap();

    assert_eq!(results.get::<f32>(0).unwrap(), 42.0);

    client.close().await;
    server.close().await;
}
