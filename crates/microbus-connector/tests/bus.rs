//! Connectors talking over an isolated in-process bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use microbus_config::ConfigProperty;
use microbus_connector::{post_json_request, Connector, SubscriptionOptions};
use microbus_core::{
    Context, Deployment, ErrorKind, Frame, FrameMut, MicrobusError, OpCode, Request, RequestExt,
    Response, ResponseExt,
};
use microbus_transport::codec::{self, Message};
use microbus_transport::subject::{reply_subject, request_subject};
use microbus_transport::{MemoryBus, Transport};
use serde_json::{json, Value};

fn bus() -> Arc<dyn Transport> {
    Arc::new(MemoryBus::new())
}

fn connector(bus: &Arc<dyn Transport>, host: &str) -> Connector {
    let con = Connector::new(host);
    con.set_transport(Arc::clone(bus)).unwrap();
    con.set_deployment(Deployment::Testing).unwrap();
    con
}

async fn client(bus: &Arc<dyn Transport>) -> Connector {
    let con = connector(bus, "client.test");
    con.startup().await.unwrap();
    con
}

fn echo_service(bus: &Arc<dyn Transport>) -> Connector {
    let con = connector(bus, "echo.test");
    con.subscribe("POST", "/echo", |_ctx: Context, req: Request| async move {
        Ok(Response::with_body(
            StatusCode::OK,
            "application/octet-stream",
            req.body().clone(),
        ))
    })
    .unwrap();
    con
}

#[tokio::test]
async fn test_echo() {
    let bus = bus();
    let svc = echo_service(&bus);
    svc.startup().await.unwrap();
    let cl = client(&bus).await;

    let res = cl
        .request(
            &Context::background(),
            post_json_request("https://echo.test/echo", &json!({"hello": "world"})).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(body["hello"], "world");
    assert_eq!(Frame::of(res.headers()).from_host(), "echo.test");

    cl.shutdown().await.unwrap();
    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_path_arguments_and_most_specific_route() {
    let bus = bus();
    let svc = connector(&bus, "paths.test");
    svc.subscribe("GET", "/items/{id}", |_ctx: Context, req: Request| async move {
        Ok(Response::text(format!("item {}", req.path_arg("id").unwrap_or_default())))
    })
    .unwrap();
    svc.subscribe("GET", "/items/special", |_ctx: Context, _req: Request| async {
        Ok(Response::text("special"))
    })
    .unwrap();
    svc.startup().await.unwrap();
    let cl = client(&bus).await;
    let ctx = Context::background();

    let res = cl.get(&ctx, "https://paths.test/items/42").await.unwrap();
    assert_eq!(res.body().as_ref(), b"item 42");
    let res = cl.get(&ctx, "https://paths.test/items/special").await.unwrap();
    assert_eq!(res.body().as_ref(), b"special");

    cl.shutdown().await.unwrap();
    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unicast_and_multicast() {
    let bus = bus();
    let mut instances = Vec::new();
    for _ in 0..3 {
        let svc = connector(&bus, "multi.test");
        svc.subscribe("GET", "/balanced", |_ctx: Context, _req: Request| async {
            Ok(Response::text("ok"))
        })
        .unwrap();
        svc.subscribe_with(
            "GET",
            "/everyone",
            SubscriptionOptions::new().no_queue(),
            |_ctx: Context, _req: Request| async { Ok(Response::text("ok")) },
        )
        .unwrap();
        svc.startup().await.unwrap();
        instances.push(svc);
    }
    let cl = client(&bus).await;
    let ctx = Context::background();

    let req = http::Request::get("https://multi.test/everyone").body(Bytes::new()).unwrap();
    let all = cl.publish(&ctx, req).collect().await;
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(Result::is_ok));

    let req = http::Request::get("https://multi.test/balanced").body(Bytes::new()).unwrap();
    let one = cl.publish(&ctx, req).collect().await;
    assert_eq!(one.len(), 1);

    cl.shutdown().await.unwrap();
    for svc in instances {
        svc.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_no_responders() {
    let bus = bus();
    let cl = client(&bus).await;
    let err = cl
        .get(&Context::background(), "https://nobody.test/anything")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoResponders);
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    cl.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout() {
    let bus = bus();
    let svc = connector(&bus, "slow.test");
    svc.subscribe("GET", "/slow", |ctx: Context, _req: Request| async move {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(5)) => Ok(Response::text("late")),
            () = ctx.done() => Err(MicrobusError::timeout("gave up")),
        }
    })
    .unwrap();
    svc.startup().await.unwrap();
    let cl = client(&bus).await;

    let ctx = Context::background().with_timeout(Duration::from_millis(500));
    let err = cl.get(&ctx, "https://slow.test/slow").await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);

    cl.shutdown().await.unwrap();
    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_error_and_panic_propagation() {
    let bus = bus();
    let svc = connector(&bus, "faulty.test");
    svc.subscribe("GET", "/reject", |_ctx: Context, _req: Request| async {
        Err::<Response, _>(MicrobusError::bad_input("missing name"))
    })
    .unwrap();
    svc.subscribe("GET", "/panic", |_ctx: Context, _req: Request| async {
        if true {
            panic!("handler exploded");
        }
        Ok(Response::text("unreachable"))
    })
    .unwrap();
    svc.startup().await.unwrap();
    let cl = client(&bus).await;
    let ctx = Context::background();

    let err = cl.get(&ctx, "https://faulty.test/reject").await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(err.message(), "missing name");
    assert!(!err.stack().is_empty());

    let err = cl.get(&ctx, "https://faulty.test/panic").await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(err.message().contains("handler exploded"));

    // The service survives
    let err = cl.get(&ctx, "https://faulty.test/reject").await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

    cl.shutdown().await.unwrap();
    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_large_bodies_are_fragmented() {
    let bus = bus();
    let svc = echo_service(&bus);
    svc.startup().await.unwrap();
    let cl = client(&bus).await;

    let body: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let req = http::Request::post("https://echo.test/echo")
        .body(Bytes::from(body.clone()))
        .unwrap();
    let res = cl.request(&Context::background(), req).await.unwrap();
    assert_eq!(res.body().as_ref(), body.as_slice());

    cl.shutdown().await.unwrap();
    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_call_loop_is_detected() {
    let bus = bus();
    let svc = connector(&bus, "loop.test");
    let weak = svc.downgrade();
    svc.subscribe("GET", "/again", move |ctx: Context, _req: Request| {
        let con = weak.upgrade();
        async move {
            let con = con.ok_or_else(|| MicrobusError::internal("gone"))?;
            con.get(&ctx, "https://loop.test/again").await
        }
    })
    .unwrap();
    svc.startup().await.unwrap();
    let cl = client(&bus).await;

    let err = cl
        .get(&Context::background(), "https://loop.test/again")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoopDetected);

    cl.shutdown().await.unwrap();
    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_overflowing_call_depth_is_a_loop() {
    let bus = bus();
    let cl = client(&bus).await;

    let mut headers = http::HeaderMap::new();
    FrameMut::of(&mut headers).set_call_depth(u32::MAX);
    let ctx = Context::background().with_frame(headers);
    let err = cl.get(&ctx, "https://loop.test/again").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoopDetected);

    cl.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stalled_response_fragments_time_out() {
    let bus = bus();
    let cl = client(&bus).await;

    // Acks, then sends only the first of two response fragments
    let mut requests = bus
        .subscribe(&request_subject(&cl.plane(), "stalled.test", 443, "GET"), None)
        .await
        .unwrap();
    let responder = Arc::clone(&bus);
    let plane = cl.plane();
    tokio::spawn(async move {
        while let Some(delivery) = requests.next().await {
            let Ok(Message::Request(req)) = codec::decode(delivery.payload) else {
                continue;
            };
            let msg_id = Frame::of(req.headers()).msg_id().to_string();
            let subject = reply_subject(&plane, &msg_id);

            let mut ack = Response::empty(StatusCode::ACCEPTED);
            FrameMut::of(ack.headers_mut())
                .set_op_code(OpCode::Ack)
                .set_msg_id(&msg_id)
                .set_from_host("stalled.test")
                .set_from_id("stalled1");
            let mut partial = Response::text("first half");
            FrameMut::of(partial.headers_mut())
                .set_op_code(OpCode::Response)
                .set_msg_id(&msg_id)
                .set_from_host("stalled.test")
                .set_from_id("stalled1")
                .set_fragment(1, 2);
            for res in [ack, partial] {
                let payload = codec::encode_response(&res).unwrap();
                responder.publish(&subject, payload).await.unwrap();
            }
        }
    });

    let started = tokio::time::Instant::now();
    let err = cl
        .get(&Context::background(), "https://stalled.test/data")
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < cl.time_budget());

    cl.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stalled_request_fragments_are_answered_with_timeout() {
    let bus = bus();
    let svc = echo_service(&bus);
    svc.startup().await.unwrap();

    let msg_id = "stalledreq1";
    let mut replies = bus
        .subscribe(&reply_subject(&svc.plane(), msg_id), None)
        .await
        .unwrap();

    let mut req = Request::new(Bytes::from_static(b"first half"));
    *req.method_mut() = http::Method::POST;
    *req.uri_mut() = "https://echo.test:443/echo".parse().unwrap();
    FrameMut::of(req.headers_mut())
        .set_op_code(OpCode::Request)
        .set_msg_id(msg_id)
        .set_from_host("caller.test")
        .set_from_id("caller1")
        .set_fragment(1, 2);
    bus.publish(
        &request_subject(&svc.plane(), "echo.test", 443, "POST"),
        codec::encode_request(&req).unwrap(),
    )
    .await
    .unwrap();

    let mut ops = Vec::new();
    while ops.len() < 2 {
        let delivery = tokio::time::timeout(Duration::from_secs(15), replies.next())
            .await
            .unwrap()
            .unwrap();
        let Ok(Message::Response(res)) = codec::decode(delivery.payload) else {
            continue;
        };
        ops.push((Frame::of(res.headers()).op_code(), res.status()));
    }
    assert_eq!(ops[0].0, OpCode::Ack);
    assert_eq!(ops[1], (OpCode::Error, StatusCode::GATEWAY_TIMEOUT));

    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_requests() {
    let bus = bus();
    let svc = connector(&bus, "drain.test");
    svc.subscribe("GET", "/work", |_ctx: Context, _req: Request| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(Response::text("done"))
    })
    .unwrap();
    svc.startup().await.unwrap();
    let cl = client(&bus).await;

    let caller = cl.clone();
    let pending = tokio::spawn(async move {
        caller
            .get(&Context::background(), "https://drain.test/work")
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    svc.shutdown().await.unwrap();

    let res = pending.await.unwrap().unwrap();
    assert_eq!(res.body().as_ref(), b"done");
    cl.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_config_changes_fire_callbacks() {
    let bus = bus();
    let svc = connector(&bus, "configured.test");
    svc.define_config(ConfigProperty::new("Greeting", "Hello", "str").unwrap())
        .unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    svc.on_config_changed(move |_ctx, changed| {
        let counter = Arc::clone(&counter);
        async move {
            if changed.contains("greeting") {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    });
    // No configurator on this bus, the default is kept
    svc.startup().await.unwrap();
    assert_eq!(svc.config("Greeting"), "Hello");

    svc.set_config("Greeting", "Shalom").await.unwrap();
    assert_eq!(svc.config("greeting"), "Shalom");
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ping_control_endpoint() {
    let bus = bus();
    let svc = connector(&bus, "pinged.test");
    svc.startup().await.unwrap();
    let cl = client(&bus).await;
    let ctx = Context::background();

    let res = cl
        .request(&ctx, post_json_request("https://pinged.test:888/ping", &json!({})).unwrap())
        .await
        .unwrap();
    assert_eq!(Frame::of(res.headers()).from_id(), svc.id());

    // Every connector on the bus answers the broadcast ping
    let all = cl
        .publish(&ctx, post_json_request("https://all:888/ping", &json!({})).unwrap())
        .collect()
        .await;
    assert_eq!(all.len(), 2);

    cl.shutdown().await.unwrap();
    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_distributed_cache_across_instances() {
    let bus = bus();
    let first = connector(&bus, "cache.test");
    let second = connector(&bus, "cache.test");
    first.startup().await.unwrap();
    second.startup().await.unwrap();
    let ctx = Context::background();

    for i in 0..8 {
        let key = format!("key{i}");
        first
            .distrib_cache()
            .store(&ctx, &key, Bytes::from(format!("value{i}")), 6)
            .await
            .unwrap();
    }
    for i in 0..8 {
        let key = format!("key{i}");
        let value = second.distrib_cache().load(&ctx, &key).await.unwrap();
        assert_eq!(value, Some(Bytes::from(format!("value{i}"))));
    }

    first.distrib_cache().delete(&ctx, "key3").await.unwrap();
    assert_eq!(second.distrib_cache().load(&ctx, "key3").await.unwrap(), None);
    assert_eq!(first.distrib_cache().load(&ctx, "missing").await.unwrap(), None);

    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}
