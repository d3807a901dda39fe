//! End-to-end tests for the courier broker over real sockets


use courier::ipc::{
    message_size, Authenticator, Client, ClientConfig, ConnectionUri, IpcError, Message,
    QueueKind, ResponseStatus, Role, Server,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    item: String,
    quantity: u16,
}

fn remote_status(err: &IpcError) -> Option<&str> {
    match err {
        IpcError::Remote { status, .. } => Some(status.as_str()),
        _ => None,
    }
}

fn no_reply(_msg: Message) -> anyhow::Result<Option<Message>> {
    Ok(None)
}

fn failing(_msg: Message) -> anyhow::Result<Option<Message>> {
    anyhow::bail!("invoice service unavailable")
}

fn upper(msg: Message) -> anyhow::Result<Option<Message>> {
    let text = msg.payload_text()?.to_uppercase();
    Ok(Some(Message::plain_text("upper", &text)))
}

#[tokio::test]
async fn test_echo_request() {
    let server = echo_server(local_config().build().unwrap()).await;
    let client = connect(&server).await;

    let response = client
        .send(Message::plain_text("test", "hello"), REQUEST_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(response.response_status(), ResponseStatus::Ok);
    assert_eq!(response.subject(), "test");
    assert_eq!(response.payload_text().unwrap(), "hello");

    client.close();
    server.close().await;
}

#[tokio::test]
async fn test_concurrent_requests_are_matched_by_id() {
    let server = echo_server(local_config().build().unwrap()).await;
    let client = Arc::new(connect(&server).await);

    let mut tasks = Vec::new();
    for i in 0..50 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let text = format!("request {}", i);
            let response = client
                .send(Message::plain_text("concurrent", &text), REQUEST_TIMEOUT)
                .await
                .unwrap();
            assert_eq!(response.payload_text().unwrap(), text);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    server.close().await;
}

#[tokio::test]
async fn test_handler_returning_nothing_yields_empty_ok() {
    let server = Server::with_handler(local_config().build().unwrap(), no_reply)
        .await
        .unwrap();
    let client = connect(&server).await;

    let response = client
        .send(Message::plain_text("ping", "x"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.response_status(), ResponseStatus::Ok);
    assert!(response.payload_binary().is_empty());

    server.close().await;
}

#[tokio::test]
async fn test_handler_error_reported() {
    let server = Server::with_handler(local_config().build().unwrap(), failing)
        .await
        .unwrap();
    let client = connect(&server).await;

    let response = client
        .send(Message::plain_text("invoice", "42"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.response_status(), ResponseStatus::HandlerError);
    assert!(response
        .payload_text()
        .unwrap()
        .contains("invoice service unavailable"));

    // The connection survives a failing handler
    let again = client
        .send(Message::plain_text("invoice", "43"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(again.response_status(), ResponseStatus::HandlerError);

    let status = server.status().await;
    assert_eq!(status.handler_errors, 2);

    server.close().await;
}

#[tokio::test]
async fn test_request_without_handler_is_bad_request() {
    let server = Server::start(local_config().build().unwrap(), None)
        .await
        .unwrap();
    let client = connect(&server).await;

    let response = client
        .send(Message::plain_text("orphan", "x"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.response_status(), ResponseStatus::BadRequest);

    server.close().await;
}

#[tokio::test]
async fn test_named_functions() {
    let server = echo_server(local_config().build().unwrap()).await;
    server.create_function("upper", upper).await.unwrap();
    assert!(server.exists_function("upper").await);

    let client = connect(&server).await;
    let response = client
        .send_to("upper", Message::plain_text("text", "shout"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.response_status(), ResponseStatus::Ok);
    assert_eq!(response.payload_text().unwrap(), "SHOUT");

    let missing = client
        .send_to("lower", Message::plain_text("text", "x"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(missing.response_status(), ResponseStatus::BadRequest);

    assert!(server.remove_function("upper").await);
    let removed = client
        .send_to("upper", Message::plain_text("text", "x"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(removed.response_status(), ResponseStatus::BadRequest);

    server.close().await;
}

#[tokio::test]
async fn test_queue_between_two_clients() {
    let server = echo_server(local_config().build().unwrap()).await;
    let producer = connect(&server).await;
    let consumer = connect(&server).await;

    producer
        .create_queue("orders", 100, QueueKind::Bounded, false)
        .await
        .unwrap();
    assert!(consumer.exists_queue("orders").await.unwrap());

    let order = Order {
        id: 7,
        item: "widget".to_string(),
        quantity: 3,
    };
    let offered = producer
        .offer(
            "orders",
            Message::structured("order", &order).unwrap(),
            Some(Duration::from_millis(300)),
        )
        .await
        .unwrap();
    assert_eq!(offered.response_status(), ResponseStatus::Ok);

    let polled = consumer
        .poll("orders", Some(Duration::from_millis(300)))
        .await
        .unwrap();
    assert_eq!(polled.response_status(), ResponseStatus::Ok);
    assert_eq!(polled.subject(), "order");
    assert_eq!(polled.payload_as::<Order>().unwrap(), order);

    let empty = consumer
        .poll("orders", Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(empty.response_status(), ResponseStatus::QueueEmpty);

    server.close().await;
}

#[tokio::test]
async fn test_poll_waits_for_offer() {
    let server = echo_server(local_config().build().unwrap()).await;
    server
        .create_queue("jobs", 10, QueueKind::Bounded, false)
        .await
        .unwrap();
    let producer = connect(&server).await;
    let consumer = connect(&server).await;

    let pending = consumer
        .poll_async("jobs", Some(Duration::from_secs(5)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    producer
        .offer("jobs", Message::plain_text("job", "build"), Some(Duration::ZERO))
        .await
        .unwrap();

    let polled = pending.await.unwrap();
    assert_eq!(polled.response_status(), ResponseStatus::Ok);
    assert_eq!(polled.payload_text().unwrap(), "build");

    server.close().await;
}

#[tokio::test]
async fn test_bounded_queue_full_and_missing_queue() {
    let server = echo_server(local_config().build().unwrap()).await;
    let client = connect(&server).await;
    client
        .create_queue("small", 1, QueueKind::Bounded, false)
        .await
        .unwrap();

    let first = client
        .offer("small", Message::plain_text("a", "1"), Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(first.response_status(), ResponseStatus::Ok);

    let second = client
        .offer("small", Message::plain_text("a", "2"), Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert_eq!(second.response_status(), ResponseStatus::QueueFull);

    let missing = client
        .poll("nowhere", Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(missing.response_status(), ResponseStatus::QueueNotFound);

    let status = client.queue_status("small").await.unwrap();
    assert!(status.exists);
    assert_eq!(status.size, 1);
    assert_eq!(status.capacity, 1);

    server.close().await;
}

#[tokio::test]
async fn test_circular_queue_over_the_wire() {
    let server = echo_server(local_config().build().unwrap()).await;
    let client = connect(&server).await;
    client
        .create_queue("ticks", 3, QueueKind::Circular, false)
        .await
        .unwrap();

    for i in 0..5 {
        let response = client
            .offer("ticks", Message::plain_text("tick", &i.to_string()), Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(response.response_status(), ResponseStatus::Ok);
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let msg = client.poll("ticks", Some(Duration::ZERO)).await.unwrap();
        seen.push(msg.payload_text().unwrap());
    }
    assert_eq!(seen, vec!["2", "3", "4"]);

    server.close().await;
}

#[tokio::test]
async fn test_durable_queue_survives_restart() {
    let wal_dir = temp_dir();
    let config = || {
        local_config()
            .write_ahead_log(wal_dir.path(), false, false)
            .build()
            .unwrap()
    };

    let server = echo_server(config()).await;
    server
        .create_queue("ledger", 50, QueueKind::Bounded, true)
        .await
        .unwrap();
    let client = connect(&server).await;
    for i in 0..5 {
        let msg = Message::plain_text("entry", &format!("entry-{}", i)).with_durable(true);
        let response = client
            .offer("ledger", msg, Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(response.response_status(), ResponseStatus::Ok);
    }
    // One consumed before the restart must not come back
    let first = client.poll("ledger", Some(Duration::ZERO)).await.unwrap();
    assert_eq!(first.payload_text().unwrap(), "entry-0");
    client.close();
    server.close().await;
    drop(server);

    let server = echo_server(config()).await;
    assert!(server.exists_queue("ledger").await);
    let client = connect(&server).await;
    for i in 1..5 {
        let msg = client.poll("ledger", Some(Duration::ZERO)).await.unwrap();
        assert_eq!(msg.response_status(), ResponseStatus::Ok);
        assert_eq!(msg.payload_text().unwrap(), format!("entry-{}", i));
    }
    let empty = client.poll("ledger", Some(Duration::ZERO)).await.unwrap();
    assert_eq!(empty.response_status(), ResponseStatus::QueueEmpty);

    server.close().await;
}

#[tokio::test]
async fn test_publish_subscribe_fan_out() {
    let server = echo_server(local_config().build().unwrap()).await;
    server.create_topic("news").await.unwrap();

    let subscriber = connect(&server).await;
    let publisher = connect(&server).await;

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(AtomicUsize::new(0));

    let sink = first.clone();
    let h1 = subscriber
        .subscribe("news", move |msg: Message| {
            sink.lock().unwrap().push(msg.payload_text().unwrap());
        })
        .await
        .unwrap();
    let counter = second.clone();
    subscriber
        .subscribe("news", move |_msg: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    let response = publisher
        .publish("news", Message::plain_text("headline", "one"))
        .await
        .unwrap();
    assert_eq!(response.response_status(), ResponseStatus::Ok);

    assert!(wait_for(|| second.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);
    assert!(wait_for(|| first.lock().unwrap().len() == 1, Duration::from_secs(2)).await);
    assert_eq!(first.lock().unwrap()[0], "one");

    subscriber.unsubscribe(h1).await.unwrap();
    publisher
        .publish("news", Message::plain_text("headline", "two"))
        .await
        .unwrap();

    assert!(wait_for(|| second.load(Ordering::SeqCst) == 2, Duration::from_secs(2)).await);
    assert_eq!(first.lock().unwrap().len(), 1);

    server.close().await;
}

#[tokio::test]
async fn test_subscribed_client_cannot_send_requests() {
    let server = echo_server(local_config().build().unwrap()).await;
    server.create_topic("alerts").await.unwrap();
    let client = connect(&server).await;

    let id = client.subscribe("alerts", |_msg: Message| {}).await.unwrap();
    let err = client
        .send(Message::plain_text("x", "y"), REQUEST_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::SubscriptionMode));

    client.unsubscribe(id).await.unwrap();
    let response = client
        .send(Message::plain_text("x", "y"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.response_status(), ResponseStatus::Ok);

    server.close().await;
}

#[tokio::test]
async fn test_publish_to_missing_topic() {
    let server = echo_server(local_config().build().unwrap()).await;
    let client = connect(&server).await;

    let response = client
        .publish("ghost", Message::plain_text("x", "y"))
        .await
        .unwrap();
    assert_eq!(response.response_status(), ResponseStatus::BadRequest);
    assert!(!client.exists_topic("ghost").await.unwrap());

    server.close().await;
}

fn secured_config() -> courier::ipc::ServerConfig {
    let mut auth = Authenticator::with_iterations(1_000);
    auth.add_credentials("admin", "admin-secret", Role::Admin)
        .unwrap();
    auth.add_credentials("worker", "worker-secret", Role::User)
        .unwrap();
    local_config()
        .encrypt(true)
        .authenticator(auth)
        .build()
        .unwrap()
}

fn user_config(server: &Server, user: &str, password: &str) -> ClientConfig {
    ClientConfig::new(server.local_uri().clone())
        .encrypt(true)
        .credentials(user, password)
}

#[tokio::test]
async fn test_authentication() {
    let server = echo_server(secured_config()).await;

    let admin = Client::connect(user_config(&server, "admin", "admin-secret"))
        .await
        .unwrap();
    let response = admin
        .send(Message::plain_text("secure", "ok"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.payload_text().unwrap(), "ok");

    let rejected = Client::connect(user_config(&server, "admin", "wrong")).await;
    assert!(rejected.is_err());

    let unknown = Client::connect(user_config(&server, "nobody", "admin-secret")).await;
    assert!(unknown.is_err());

    let anonymous = Client::connect(ClientConfig::new(server.local_uri().clone()).encrypt(true)).await;
    assert!(anonymous.is_err());

    server.close().await;
}

#[tokio::test]
async fn test_admin_rights() {
    let server = echo_server(secured_config()).await;
    let admin = Client::connect(user_config(&server, "admin", "admin-secret"))
        .await
        .unwrap();
    let worker = Client::connect(user_config(&server, "worker", "worker-secret"))
        .await
        .unwrap();

    let err = worker
        .create_queue("tasks", 10, QueueKind::Bounded, false)
        .await
        .unwrap_err();
    assert_eq!(remote_status(&err), Some("BAD_REQUEST"));
    assert!(!admin.exists_queue("tasks").await.unwrap());

    admin
        .create_queue("tasks", 10, QueueKind::Bounded, false)
        .await
        .unwrap();

    // Plain users may still use queues
    let offered = worker
        .offer("tasks", Message::plain_text("task", "t1"), Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(offered.response_status(), ResponseStatus::Ok);

    let err = worker.remove_queue("tasks").await.unwrap_err();
    assert_eq!(remote_status(&err), Some("BAD_REQUEST"));
    admin.remove_queue("tasks").await.unwrap();
    assert!(!server.exists_queue("tasks").await);

    server.close().await;
}

#[tokio::test]
async fn test_encrypted_and_compressed_large_payload() {
    let config = local_config()
        .encrypt(true)
        .compress_cutoff_size(1024)
        .build()
        .unwrap();
    let server = echo_server(config).await;
    let client = Client::connect(ClientConfig::new(server.local_uri().clone()).encrypt(true))
        .await
        .unwrap();
    assert!(client.server_settings().encrypt);

    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 17) as u8).collect();
    let response = client
        .send(
            Message::binary("blob", "application/octet-stream", data.clone()),
            REQUEST_TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(response.response_status(), ResponseStatus::Ok);
    assert_eq!(response.payload_binary(), data.as_slice());

    server.close().await;
}

#[tokio::test]
async fn test_server_forces_encryption() {
    let server = echo_server(local_config().encrypt(true).build().unwrap()).await;
    let client = connect(&server).await;
    assert!(client.server_settings().encrypt);

    let response = client
        .send(Message::plain_text("secret", "payload"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.payload_text().unwrap(), "payload");

    server.close().await;
}

#[tokio::test]
async fn test_connection_limit() {
    let server = echo_server(local_config().max_connections(2).build().unwrap()).await;
    let first = connect(&server).await;
    let second = connect(&server).await;

    let config = ClientConfig::new(server.local_uri().clone())
        .handshake_timeout(Duration::from_secs(2));
    assert!(Client::connect(config.clone()).await.is_err());

    first.close();
    drop(first);

    // The slot frees once the server notices the disconnect
    let mut third = None;
    for _ in 0..50 {
        match Client::connect(config.clone()).await {
            Ok(client) => {
                third = Some(client);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let third = third.expect("connection slot was not released");
    let response = third
        .send(Message::plain_text("late", "hi"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.response_status(), ResponseStatus::Ok);

    let status = server.status().await;
    assert!(status.rejected_connections >= 1);
    assert_eq!(status.max_connections, 2);

    drop(second);
    server.close().await;
}

#[tokio::test]
async fn test_temporary_queue_removed_on_disconnect() {
    let server = echo_server(local_config().build().unwrap()).await;
    let owner = connect(&server).await;
    let other = connect(&server).await;

    let name = owner.create_temporary_queue(10).await.unwrap();
    assert!(name.starts_with("temp-queue/"));

    // Other connections can reach it while the owner lives
    let offered = other
        .offer(&name, Message::plain_text("reply", "r"), Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(offered.response_status(), ResponseStatus::Ok);
    let status = other.queue_status(&name).await.unwrap();
    assert!(status.temporary);

    owner.close();
    drop(owner);

    let mut removed = false;
    for _ in 0..100 {
        if !server.exists_queue(&name).await {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(removed, "temporary queue outlived its connection");

    server.close().await;
}

#[tokio::test]
async fn test_message_too_large_rejected_locally() {
    let server = echo_server(local_config().max_message_size(4096).build().unwrap()).await;
    let client = connect(&server).await;
    assert_eq!(client.server_settings().max_message_size, 4096);

    let big = Message::binary("big", "application/octet-stream", vec![0u8; 8192]);
    let err = client.send(big, REQUEST_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, IpcError::MessageTooLarge { max: 4096, .. }));

    // The connection is still usable
    let response = client
        .send(Message::plain_text("small", "fits"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.payload_text().unwrap(), "fits");

    server.close().await;
}

#[test]
fn test_message_size_sections_sum() {
    let msg = Message::plain_text("subject", "some text payload").with_request_id("req-1");
    let size = message_size(&msg);
    assert_eq!(
        size.total,
        size.header + size.payload_meta + size.payload_data
    );
    assert_eq!(size.payload_data, "some text payload".len());
    assert_eq!(msg.size(), size);
}

#[tokio::test]
async fn test_closed_client_fails_fast() {
    let server = echo_server(local_config().build().unwrap()).await;
    let client = connect(&server).await;
    client.close();
    assert!(!client.is_running());

    let err = client
        .send(Message::plain_text("x", "y"), REQUEST_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::ConnectionClosed));

    server.close().await;
}

#[tokio::test]
async fn test_server_close_fails_pending_requests() {
    let server = echo_server(local_config().build().unwrap()).await;
    server
        .create_queue("idle", 1, QueueKind::Bounded, false)
        .await
        .unwrap();
    let client = connect(&server).await;

    let pending = client.poll_async("idle", None).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.close().await;

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending poll was not released");
    assert!(matches!(result, Err(IpcError::ConnectionClosed)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_transport() {
    let dir = temp_dir();
    let path = temp_socket_path(&dir);
    let config = courier::ipc::ServerConfig::builder(ConnectionUri::unix(&path))
        .build()
        .unwrap();
    let server = echo_server(config).await;
    assert!(path.exists());

    let client = connect(&server).await;
    let response = client
        .send(Message::plain_text("unix", "local"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.payload_text().unwrap(), "local");

    client.close();
    server.close().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn test_server_status_counts() {
    let server = echo_server(local_config().build().unwrap()).await;
    server.create_topic("t").await.unwrap();
    server
        .create_queue("q", 5, QueueKind::Bounded, false)
        .await
        .unwrap();
    let client = connect(&server).await;
    client
        .send(Message::plain_text("a", "b"), REQUEST_TIMEOUT)
        .await
        .unwrap();

    let status = client.server_status().await.unwrap();
    assert!(status.running);
    assert_eq!(status.queues, 1);
    assert_eq!(status.topics, 1);
    assert_eq!(status.active_connections, 1);
    assert!(status.handled_requests >= 1);

    server.close().await;
}

#[tokio::test]
async fn test_same_message_sent_twice() {
    let server = echo_server(local_config().build().unwrap()).await;
    server
        .create_queue("left", 5, QueueKind::Bounded, false)
        .await
        .unwrap();
    server
        .create_queue("right", 5, QueueKind::Bounded, false)
        .await
        .unwrap();
    let client = connect(&server).await;

    let msg = Message::plain_text("dup", "twice");
    let first = client.send_async(msg.clone()).unwrap();
    let second = client.send_async(msg.clone()).unwrap();
    assert_ne!(first.request_id(), second.request_id());
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap().payload_text().unwrap(), "twice");
    assert_eq!(second.unwrap().payload_text().unwrap(), "twice");

    let left = client
        .offer_async("left", msg.clone(), Some(Duration::ZERO))
        .unwrap();
    let right = client
        .offer_async("right", msg, Some(Duration::ZERO))
        .unwrap();
    let (left, right) = tokio::join!(left, right);
    assert_eq!(left.unwrap().response_status(), ResponseStatus::Ok);
    assert_eq!(right.unwrap().response_status(), ResponseStatus::Ok);
    assert_eq!(client.queue_status("left").await.unwrap().size, 1);
    assert_eq!(client.queue_status("right").await.unwrap().size, 1);

    server.close().await;
}

#[tokio::test]
async fn test_pipelined_offers_arrive_in_order() {
    let server = echo_server(local_config().build().unwrap()).await;
    server
        .create_queue("sequence", 500, QueueKind::Bounded, false)
        .await
        .unwrap();
    let producer = connect(&server).await;
    let consumer = connect(&server).await;

    let pending: Vec<_> = (0..300)
        .map(|i| {
            producer
                .offer_async(
                    "sequence",
                    Message::plain_text("n", &i.to_string()),
                    Some(Duration::from_millis(300)),
                )
                .unwrap()
        })
        .collect();
    for response in futures::future::join_all(pending).await {
        assert_eq!(response.unwrap().response_status(), ResponseStatus::Ok);
    }

    for i in 0..300 {
        let polled = consumer
            .poll("sequence", Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(polled.payload_text().unwrap(), i.to_string());
    }

    server.close().await;
}

#[tokio::test]
async fn test_disconnected_poller_takes_nothing() {
    let server = echo_server(local_config().build().unwrap()).await;
    server
        .create_queue("work", 10, QueueKind::Bounded, false)
        .await
        .unwrap();
    let producer = connect(&server).await;
    let consumer = connect(&server).await;

    let _abandoned = consumer.poll_async("work", None).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    consumer.close();
    drop(consumer);

    let mut gone = false;
    for _ in 0..100 {
        if server.status().await.active_connections == 1 {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "consumer connection was not cleaned up");

    producer
        .offer("work", Message::plain_text("job", "1"), Some(Duration::ZERO))
        .await
        .unwrap();
    let polled = producer
        .poll("work", Some(Duration::from_millis(300)))
        .await
        .unwrap();
    assert_eq!(polled.response_status(), ResponseStatus::Ok);
    assert_eq!(polled.payload_text().unwrap(), "1");

    server.close().await;
}

#[tokio::test]
async fn test_blocking_offer_resumes_when_space_frees() {
    let server = echo_server(local_config().build().unwrap()).await;
    server
        .create_queue("narrow", 1, QueueKind::Bounded, false)
        .await
        .unwrap();
    let producer = connect(&server).await;
    let consumer = connect(&server).await;

    producer
        .offer("narrow", Message::plain_text("n", "a"), Some(Duration::ZERO))
        .await
        .unwrap();
    let blocked = producer
        .offer_async("narrow", Message::plain_text("n", "b"), None)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.queue_status("narrow").await.size, 1);

    let first = consumer.poll("narrow", Some(Duration::ZERO)).await.unwrap();
    assert_eq!(first.payload_text().unwrap(), "a");

    let offered = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("blocked offer never resumed")
        .unwrap();
    assert_eq!(offered.response_status(), ResponseStatus::Ok);

    let second = consumer
        .poll("narrow", Some(Duration::from_millis(300)))
        .await
        .unwrap();
    assert_eq!(second.payload_text().unwrap(), "b");

    server.close().await;
}

#[tokio::test]
async fn test_removed_queue_releases_waiting_poll() {
    let server = echo_server(local_config().build().unwrap()).await;
    server
        .create_queue("doomed", 5, QueueKind::Bounded, false)
        .await
        .unwrap();
    let client = connect(&server).await;

    let pending = client.poll_async("doomed", None).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.remove_queue("doomed").await.unwrap());

    let response = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("poll on a removed queue never returned")
        .unwrap();
    assert_eq!(response.response_status(), ResponseStatus::QueueNotFound);

    server.close().await;
}

#[tokio::test]
async fn test_heartbeats_keep_connection_open() {
    let config = local_config()
        .heartbeat_interval(Duration::from_millis(100))
        .build()
        .unwrap();
    let server = echo_server(config).await;
    let client = connect(&server).await;
    assert_eq!(
        client.server_settings().heartbeat_interval(),
        Duration::from_millis(100)
    );

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(client.is_running());
    let response = client
        .send(Message::plain_text("ping", "still here"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.payload_text().unwrap(), "still here");

    server.close().await;
}

#[tokio::test]
async fn test_slow_subscriber_does_not_stall_runtime() {
    let server = echo_server(local_config().build().unwrap()).await;
    server.create_topic("slow").await.unwrap();
    let subscriber = connect(&server).await;
    let publisher = connect(&server).await;

    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let (s, f) = (started.clone(), finished.clone());
    subscriber
        .subscribe("slow", move |_msg: Message| {
            s.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(800));
            f.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    publisher
        .publish("slow", Message::plain_text("tick", "1"))
        .await
        .unwrap();
    assert!(wait_for(|| started.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);

    // The callback is still sleeping; this runtime must keep serving
    let began = std::time::Instant::now();
    publisher
        .send(Message::plain_text("ping", "pong"), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert!(began.elapsed() < Duration::from_millis(400));
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    assert!(wait_for(|| finished.load(Ordering::SeqCst) == 1, Duration::from_secs(3)).await);
    server.close().await;
}
