//! Endpoint lifecycle, topic endpoints and connection endpoints.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use fabric_protocol::EventPacket;
    use fabric_transport::{Outbound, SocketMode, SocketRole, inproc_in_use};
    use fabric_server::*;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn server() -> Server {
        Server::new(ServerConfig::default())
    }

    fn next_packet(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<EventPacket> {
        match rx.try_recv() {
            Ok(Outbound::Text(text)) => EventPacket::parse(&text).ok(),
            _ => None,
        }
    }

    /// Collects delivered messages and wakes the test on each one.
    fn collector(endpoint: &TopicEndpoint) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        endpoint.onmessage(move |message| {
            let _ = tx.send(message);
        });
        rx
    }

    async fn expect_message(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("callback channel closed")
    }

    async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<Value>) {
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn second_activation_is_rejected() {
        let server = server();
        let publisher = TopicEndpoint::publisher("inproc://endpoint-tests-twice").build();

        publisher.activate(&server).await.unwrap();
        assert_eq!(publisher.state(), ActivationState::Active);

        let err = publisher.activate(&server).await.unwrap_err();
        assert!(matches!(err, FabricError::AlreadyActive(id) if id == publisher.id()));
        publisher.close();
    }

    #[tokio::test]
    async fn closed_endpoint_cannot_come_back() {
        let server = server();
        let publisher = TopicEndpoint::publisher("inproc://endpoint-tests-closed").build();
        publisher.activate(&server).await.unwrap();
        publisher.close();
        assert_eq!(publisher.state(), ActivationState::Closed);

        let err = publisher.activate(&server).await.unwrap_err();
        assert!(matches!(err, FabricError::Closed(_)));
    }

    #[test]
    fn closing_an_inactive_endpoint_does_nothing() {
        let subscriber = TopicEndpoint::subscriber("inproc://endpoint-tests-idle").build();
        subscriber.close();
        subscriber.close();
        assert_eq!(subscriber.state(), ActivationState::Inactive);
    }

    #[tokio::test]
    async fn failed_activation_leaves_endpoint_inactive() {
        let server = server();
        let bad = TopicEndpoint::publisher("nowhere").build();
        let err = bad.activate(&server).await.unwrap_err();
        assert!(matches!(err, FabricError::Transport(_)));
        assert_eq!(bad.state(), ActivationState::Inactive);
    }

    #[test]
    fn endpoint_ids_are_unique() {
        let a = ConnectionEndpoint::new();
        let b = ConnectionEndpoint::new();
        assert_ne!(a.id(), b.id());
    }

    // ─────────────────────────────────────────────────────────────────────
    // TopicEndpoint: construction and filters
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn builders_default_by_role() {
        let publisher = TopicEndpoint::publisher("inproc://x").build();
        assert_eq!(publisher.role(), SocketRole::Publish);
        assert_eq!(publisher.mode(), SocketMode::Bind);

        let subscriber = TopicEndpoint::subscriber("inproc://x").bind().build();
        assert_eq!(subscriber.role(), SocketRole::Subscribe);
        assert_eq!(subscriber.mode(), SocketMode::Bind);
        assert_eq!(subscriber.address(), "inproc://x");
    }

    #[test]
    fn filter_add_then_remove_restores_the_set() {
        let subscriber = TopicEndpoint::subscriber("inproc://endpoint-tests-filters")
            .filter("a")
            .build();

        subscriber.add_filter("b").unwrap();
        subscriber.add_filter("b").unwrap();
        assert_eq!(subscriber.filters(), vec!["a".to_string(), "b".to_string()]);

        subscriber.remove_filter("b").unwrap();
        subscriber.remove_filter("missing").unwrap();
        assert_eq!(subscriber.filters(), vec!["a".to_string()]);
    }

    #[test]
    fn publishers_have_no_filters() {
        let publisher = TopicEndpoint::publisher("inproc://x").filter("ignored").build();
        assert!(publisher.filters().is_empty());

        let err = publisher.add_filter("a").unwrap_err();
        assert!(matches!(err, FabricError::InvalidOperation(_)));
        let err = publisher.remove_filter("a").unwrap_err();
        assert!(matches!(err, FabricError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn send_needs_an_active_publisher() {
        let publisher = TopicEndpoint::publisher("inproc://endpoint-tests-inactive").build();
        let err = publisher.send(json!("x")).await.unwrap_err();
        assert!(matches!(err, FabricError::NotActive(_)));

        let subscriber = TopicEndpoint::subscriber("inproc://endpoint-tests-inactive").build();
        let err = subscriber.send(json!("x")).await.unwrap_err();
        assert!(matches!(err, FabricError::InvalidOperation(_)));
    }

    // ─────────────────────────────────────────────────────────────────────
    // TopicEndpoint: end to end over inproc
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn subscriber_filters_and_demultiplexes() {
        let addr = "inproc://endpoint-tests-sensors";
        let server = server();

        let publisher = TopicEndpoint::publisher(addr).build();
        let subscriber = TopicEndpoint::subscriber(addr)
            .filter("temp.")
            .plugin(FrameSelect { index: 2 })
            .build();
        let mut received = collector(&subscriber);

        publisher.activate(&server).await.unwrap();
        subscriber.activate(&server).await.unwrap();

        publisher
            .send(json!(["humidity.kitchen", "", "40"]))
            .await
            .unwrap();
        publisher.send(json!(["temp.kitchen", "", "23"])).await.unwrap();

        assert_eq!(expect_message(&mut received).await, json!("23"));
        expect_silence(&mut received).await;

        publisher.close();
        subscriber.close();
    }

    #[tokio::test]
    async fn subscriber_without_filters_hears_nothing() {
        let addr = "inproc://endpoint-tests-unfiltered";
        let server = server();

        let publisher = TopicEndpoint::publisher(addr).build();
        let subscriber = TopicEndpoint::subscriber(addr).build();
        let mut received = collector(&subscriber);
        publisher.activate(&server).await.unwrap();
        subscriber.activate(&server).await.unwrap();

        publisher.send(json!(["anything"])).await.unwrap();
        expect_silence(&mut received).await;

        subscriber.add_filter("").unwrap();
        // The filter reaches the socket task before the next message does.
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.send(json!(["anything"])).await.unwrap();
        assert_eq!(expect_message(&mut received).await, json!(["anything"]));

        publisher.close();
        subscriber.close();
    }

    #[tokio::test]
    async fn removed_filter_stops_delivery() {
        let addr = "inproc://endpoint-tests-remove";
        let server = server();

        let publisher = TopicEndpoint::publisher(addr).build();
        let subscriber = TopicEndpoint::subscriber(addr).filter("a").filter("b").build();
        let mut received = collector(&subscriber);
        publisher.activate(&server).await.unwrap();
        subscriber.activate(&server).await.unwrap();

        subscriber.remove_filter("a").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        publisher.send(json!(["a1"])).await.unwrap();
        publisher.send(json!(["b1"])).await.unwrap();
        assert_eq!(expect_message(&mut received).await, json!(["b1"]));
        expect_silence(&mut received).await;

        publisher.close();
        subscriber.close();
    }

    #[tokio::test]
    async fn send_chain_can_drop_a_message() {
        let addr = "inproc://endpoint-tests-dropped";
        let server = server();

        let publisher = TopicEndpoint::publisher(addr)
            .plugin(FnPlugin::send("only-objects", |m| m.is_object().then_some(m)))
            .plugin(TopicEnvelope::new("topic"))
            .build();
        let subscriber = TopicEndpoint::subscriber(addr)
            .filter("")
            .plugin(FrameSelect { index: 2 })
            .plugin(JsonDecode)
            .build();
        let mut received = collector(&subscriber);
        publisher.activate(&server).await.unwrap();
        subscriber.activate(&server).await.unwrap();

        publisher.send(json!("not an object")).await.unwrap();
        expect_silence(&mut received).await;

        publisher
            .send(json!({"topic": "temp.kitchen", "value": 23}))
            .await
            .unwrap();
        let message = expect_message(&mut received).await;
        assert_eq!(message["value"], json!(23));

        publisher.close();
        subscriber.close();
    }

    #[tokio::test]
    async fn routes_fire_inside_the_receive_chain() {
        let addr = "inproc://endpoint-tests-routes";
        let server = server();

        let hits = Arc::new(AtomicUsize::new(0));
        let route = Arc::new(MessageRoute::new());
        let counter = hits.clone();
        route.on("kind", "reading", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let publisher = TopicEndpoint::publisher(addr).build();
        let subscriber = TopicEndpoint::subscriber(addr)
            .filter("")
            .plugin(FrameSelect { index: 0 })
            .plugin(JsonDecode)
            .shared_plugin(route.clone())
            .build();
        let mut received = collector(&subscriber);
        publisher.activate(&server).await.unwrap();
        subscriber.activate(&server).await.unwrap();

        publisher.send(json!({"kind": "reading"})).await.unwrap();
        publisher.send(json!({"kind": "status"})).await.unwrap();

        assert_eq!(expect_message(&mut received).await, json!({"kind": "reading"}));
        assert_eq!(expect_message(&mut received).await, json!({"kind": "status"}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        publisher.close();
        subscriber.close();
    }

    #[tokio::test]
    async fn second_bind_on_an_address_fails() {
        let addr = "inproc://endpoint-tests-bound";
        let server = server();
        let first = TopicEndpoint::publisher(addr).build();
        let second = TopicEndpoint::publisher(addr).build();

        first.activate(&server).await.unwrap();
        assert!(second.activate(&server).await.is_err());
        assert!(!second.is_active());
        first.close();
    }

    #[tokio::test]
    async fn close_releases_the_address_at_once() {
        let addr = "inproc://endpoint-tests-rebind";
        let server = server();
        let first = TopicEndpoint::publisher(addr).build();
        first.activate(&server).await.unwrap();
        assert!(inproc_in_use(addr));

        first.close();
        assert!(!inproc_in_use(addr));

        let second = TopicEndpoint::publisher(addr).build();
        second.activate(&server).await.unwrap();
        assert!(second.is_active());
        second.close();
    }

    #[tokio::test]
    async fn closed_subscriber_frees_its_bound_address() {
        let addr = "inproc://endpoint-tests-rebind-sub";
        let server = server();
        let first = TopicEndpoint::subscriber(addr).bind().filter("").build();
        first.activate(&server).await.unwrap();
        first.close();

        let second = TopicEndpoint::subscriber(addr).bind().filter("").build();
        let mut rx = collector(&second);
        second.activate(&server).await.unwrap();
        let publisher = TopicEndpoint::publisher(addr).connect().build();
        publisher.activate(&server).await.unwrap();

        publisher.send(json!(["after"])).await.unwrap();
        assert_eq!(expect_message(&mut rx).await, json!(["after"]));
        publisher.close();
        second.close();
    }

    // ─────────────────────────────────────────────────────────────────────
    // ConnectionEndpoint
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn activation_needs_a_handle() {
        let server = server();
        let endpoint = ConnectionEndpoint::new();
        let err = endpoint.activate(&server).await.unwrap_err();
        assert!(matches!(err, FabricError::NoHandle(_)));
        assert!(!endpoint.is_active());
    }

    #[tokio::test]
    async fn routes_registered_early_are_replayed_on_attach() {
        let server = server();
        let (handle, _rx) = server.hub().accept();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let endpoint = ConnectionEndpoint::new();
        let s = seen.clone();
        endpoint.on("ping", move |_, args| s.lock().extend_from_slice(args));

        endpoint.activate_with(&server, Some(handle.clone())).unwrap();
        assert!(handle.dispatch(&EventPacket::new("ping", vec![json!(1)])));
        assert_eq!(*seen.lock(), vec![json!(1)]);
    }

    #[test]
    fn routes_registered_late_reach_the_handle() {
        let hub = fabric_transport::Hub::new();
        let (handle, mut rx) = hub.accept();
        let endpoint = ConnectionEndpoint::with_handle(handle.clone());

        endpoint.on("echo", |endpoint, args| {
            endpoint.emit("echoed", args.to_vec());
        });
        handle.dispatch(&EventPacket::new("echo", vec![json!("hi")]));

        let packet = next_packet(&mut rx).unwrap();
        assert_eq!(packet.event, "echoed");
        assert_eq!(packet.args, vec![json!("hi")]);
    }

    #[test]
    fn dropped_route_stops_dispatch() {
        let hub = fabric_transport::Hub::new();
        let (handle, _rx) = hub.accept();
        let endpoint = ConnectionEndpoint::with_handle(handle.clone());
        endpoint.on("a", |_, _| {});
        endpoint.on("b", |_, _| {});

        assert!(endpoint.drop_route("a"));
        assert_eq!(endpoint.routes(), vec!["b".to_string()]);
        assert!(!handle.has_listener("a"));
        assert!(!handle.dispatch(&EventPacket::new("a", vec![])));
    }

    #[test]
    fn emit_after_disconnect_is_quiet() {
        let hub = fabric_transport::Hub::new();
        let (handle, mut rx) = hub.accept();
        let endpoint = ConnectionEndpoint::with_handle(handle.clone());

        assert!(endpoint.emit("hello", vec![]));
        assert_eq!(next_packet(&mut rx).unwrap().event, "hello");

        handle.disconnect();
        assert!(!endpoint.is_connected());
        assert!(!endpoint.emit("hello", vec![]));
        endpoint.join("room");
        assert!(endpoint.rooms().is_empty());
    }

    #[test]
    fn emit_without_a_handle_is_quiet() {
        let endpoint = ConnectionEndpoint::new();
        assert!(!endpoint.emit("hello", vec![json!(1)]));
        endpoint.store("k", json!(1));
        assert_eq!(endpoint.retrieve("k"), None);
        assert_eq!(endpoint.connection_id(), None);
    }

    #[test]
    fn ondisconnect_runs_once_with_the_endpoint() {
        let hub = fabric_transport::Hub::new();
        let (handle, _rx) = hub.accept();
        let endpoint = ConnectionEndpoint::with_handle(handle.clone());

        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        endpoint.ondisconnect(move |endpoint| c.lock().push(endpoint.id()));

        handle.disconnect();
        handle.disconnect();
        assert_eq!(*calls.lock(), vec![endpoint.id()]);
    }

    #[test]
    fn ondisconnect_registered_after_the_fact_runs_at_once() {
        let hub = fabric_transport::Hub::new();
        let (handle, _rx) = hub.accept();
        let endpoint = ConnectionEndpoint::with_handle(handle.clone());
        handle.disconnect();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        endpoint.ondisconnect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.disconnect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_from_inside_ondisconnect_completes() {
        let server = server();
        let (handle, _rx) = server.hub().accept();
        let endpoint = ConnectionEndpoint::new();
        endpoint.activate_with(&server, Some(handle.clone())).unwrap();

        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        endpoint.ondisconnect(move |endpoint| {
            endpoint.close();
            c.fetch_add(1, Ordering::SeqCst);
        });

        handle.disconnect();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.state(), ActivationState::Closed);
    }

    #[test]
    fn join_and_leave_go_through_the_transport() {
        let hub = fabric_transport::Hub::new();
        let (handle, _rx) = hub.accept();
        let endpoint = ConnectionEndpoint::with_handle(handle);

        endpoint.join("lobby");
        endpoint.join("games");
        let mut rooms = endpoint.rooms();
        rooms.sort();
        assert_eq!(rooms, vec!["games".to_string(), "lobby".to_string()]);

        endpoint.leave("games");
        assert_eq!(endpoint.rooms(), vec!["lobby".to_string()]);
    }

    #[test]
    fn values_are_kept_with_the_connection() {
        let hub = fabric_transport::Hub::new();
        let (handle, _rx) = hub.accept();
        let endpoint = ConnectionEndpoint::with_handle(handle.clone());

        endpoint.store("user", json!({"name": "ada"}));
        assert_eq!(endpoint.retrieve("user"), Some(json!({"name": "ada"})));
        assert_eq!(handle.get("user"), Some(json!({"name": "ada"})));
        assert_eq!(endpoint.retrieve("missing"), None);
    }

    #[tokio::test]
    async fn close_disconnects_and_silences_routes() {
        let server = server();
        let (handle, mut rx) = server.hub().accept();
        let endpoint = ConnectionEndpoint::new();
        endpoint.on("ping", |_, _| {});
        endpoint.activate_with(&server, Some(handle.clone())).unwrap();

        endpoint.close();
        assert_eq!(endpoint.state(), ActivationState::Closed);
        assert!(handle.is_disconnected());
        assert!(!handle.has_listener("ping"));
        assert_eq!(rx.try_recv().ok(), Some(Outbound::Close));
    }

    // ─────────────────────────────────────────────────────────────────────
    // ListenerEndpoint
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn listener_surfaces_registered_clients() {
        let server = server();
        let listener = ListenerEndpoint::new();
        let connected = Arc::new(Mutex::new(Vec::new()));
        let c = connected.clone();
        listener.onconnect(move |endpoint| c.lock().push(endpoint));
        listener.activate(&server).await.unwrap();

        let (handle, _rx) = server.hub().accept();

        let connected = connected.lock();
        assert_eq!(connected.len(), 1);
        let endpoint = &connected[0];
        assert!(endpoint.is_active());
        assert_eq!(endpoint.connection_id().as_deref(), Some(handle.id()));
        assert!(server.client(handle.id()).is_some());
    }

    #[tokio::test]
    async fn listener_callback_can_be_replaced() {
        let server = server();
        let listener = ListenerEndpoint::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        listener.onconnect(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        listener.activate(&server).await.unwrap();
        let _a = server.hub().accept();

        let s = second.clone();
        listener.onconnect(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let _b = server.hub().accept();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(server.client_count(), 2);
    }

    #[tokio::test]
    async fn closed_listener_stops_accepting() {
        let server = server();
        let listener = ListenerEndpoint::new();
        listener.activate(&server).await.unwrap();
        listener.close();

        let _conn = server.hub().accept();
        assert_eq!(server.client_count(), 0);
    }
}
