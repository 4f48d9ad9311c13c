//! Hub and connection tests: accept, groups, group send, disconnect.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fabric_protocol::EventPacket;
    use fabric_transport::{Connection, Hub, Outbound};
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    fn next_text(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> Option<EventPacket> {
        match rx.try_recv() {
            Ok(Outbound::Text(text)) => Some(EventPacket::parse(&text).unwrap()),
            _ => None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accept
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn accept_runs_connect_hook() {
        let hub = Hub::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        hub.on_connection(Arc::new(move |conn: Connection| {
            seen_clone.lock().push(conn.id().to_string());
        }));

        let (a, _rx_a) = hub.accept();
        let (b, _rx_b) = hub.accept();

        assert_ne!(a.id(), b.id());
        assert_eq!(*seen.lock(), vec![a.id().to_string(), b.id().to_string()]);
        assert_eq!(hub.connection_count(), 2);
        assert!(hub.connection(a.id()).is_some());
    }

    #[test]
    fn replacing_hook_affects_later_connections_only() {
        let hub = Hub::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        hub.on_connection(Arc::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let _c1 = hub.accept();

        let s = second.clone();
        hub.on_connection(Arc::new(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        }));
        let _c2 = hub.accept();
        let _c3 = hub.accept();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn group_send_reaches_members_only() {
        let hub = Hub::new();
        let (a, mut rx_a) = hub.accept();
        let (b, mut rx_b) = hub.accept();
        let (_c, mut rx_c) = hub.accept();

        a.join("lobby");
        b.join("lobby");
        let mut members = hub.members("lobby");
        members.sort();
        let mut expected = vec![a.id().to_string(), b.id().to_string()];
        expected.sort();
        assert_eq!(members, expected);

        let delivered = hub.emit_to("lobby", &EventPacket::new("chat", vec![json!("hi")]));
        assert_eq!(delivered, 2);

        assert_eq!(next_text(&mut rx_a).unwrap().args, vec![json!("hi")]);
        assert_eq!(next_text(&mut rx_b).unwrap().event, "chat");
        assert!(next_text(&mut rx_c).is_none());
    }

    #[test]
    fn leave_removes_membership() {
        let hub = Hub::new();
        let (a, _rx) = hub.accept();
        a.join("x");
        a.join("y");
        assert_eq!(a.groups(), vec!["x".to_string(), "y".to_string()]);

        a.leave("x");
        assert_eq!(a.groups(), vec!["y".to_string()]);
        assert!(hub.members("x").is_empty());
    }

    #[test]
    fn namespaced_group_names() {
        let hub = Hub::with_namespace("chat");
        assert_eq!(hub.namespace(), "/chat");
        assert_eq!(hub.group_name("room1"), "/chat/room1");

        let (a, _rx) = hub.accept();
        a.join("room1");
        assert_eq!(hub.groups_of(a.id()), vec!["room1".to_string()]);
        assert_eq!(hub.members("room1"), vec![a.id().to_string()]);

        let root = Hub::new();
        assert_eq!(root.group_name("room1"), "room1");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound dispatch
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn dispatch_reaches_registered_listener() {
        let hub = Hub::new();
        let (conn, _rx) = hub.accept();
        let got: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let got_clone = got.clone();
        conn.on(
            "ping",
            Arc::new(move |args: &[Value]| got_clone.lock().extend_from_slice(args)),
        );

        assert!(conn.dispatch(&EventPacket::new("ping", vec![json!(1)])));
        assert!(!conn.dispatch(&EventPacket::new("other", vec![])));
        assert_eq!(*got.lock(), vec![json!(1)]);

        assert!(conn.off("ping"));
        assert!(!conn.has_listener("ping"));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Disconnect
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn disconnect_releases_groups_and_fires_hooks_once() {
        let hub = Hub::new();
        let (conn, mut rx) = hub.accept();
        conn.join("lobby");

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        conn.on_disconnect(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        conn.disconnect();
        conn.disconnect();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(conn.is_disconnected());
        assert!(hub.members("lobby").is_empty());
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }

    #[test]
    fn disconnected_connection_ignores_emit_and_join() {
        let hub = Hub::new();
        let (conn, _rx) = hub.accept();
        conn.disconnect();

        assert!(!conn.emit("x", vec![]));
        conn.join("lobby");
        assert!(hub.members("lobby").is_empty());
    }

    #[test]
    fn hook_registered_after_disconnect_runs_immediately() {
        let hub = Hub::new();
        let (conn, _rx) = hub.accept();
        conn.disconnect();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        conn.on_disconnect(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_connection_store() {
        let hub = Hub::new();
        let (conn, _rx) = hub.accept();
        assert!(conn.get("user").is_none());
        conn.set("user", json!({"name": "ada"}));
        assert_eq!(conn.get("user"), Some(json!({"name": "ada"})));
    }
}
