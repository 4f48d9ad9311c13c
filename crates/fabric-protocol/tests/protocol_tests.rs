//! Protocol layer tests: event packets and frame conversion.

#[cfg(test)]
mod tests {
    use fabric_protocol::*;
    use serde_json::json;

    // ─────────────────────────────────────────────────────────────────────
    // EventPacket
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn packet_wire_shape() {
        let packet = EventPacket::new("join", vec![json!("lobby")]);
        let value: serde_json::Value = serde_json::from_str(&packet.to_text().unwrap()).unwrap();
        assert_eq!(value, json!({"event": "join", "args": ["lobby"]}));
    }

    #[test]
    fn parse_defaults_missing_args() {
        let packet = EventPacket::parse(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(packet.event, "ping");
        assert!(packet.args.is_empty());
        assert!(packet.first_arg().is_none());
    }

    #[test]
    fn parse_keeps_arguments_in_order() {
        let packet =
            EventPacket::parse(r#"{"event":"publish","args":["lobby",{"n":1}]}"#).unwrap();
        assert_eq!(packet.first_arg(), Some(&json!("lobby")));
        assert_eq!(packet.args[1], json!({"n": 1}));
    }

    #[test]
    fn parse_rejects_malformed_packets() {
        assert!(matches!(
            EventPacket::parse(r#"{"event":""}"#),
            Err(ProtocolError::InvalidPacket(_))
        ));
        assert!(matches!(EventPacket::parse("not json"), Err(ProtocolError::Json(_))));
        assert!(EventPacket::parse(r#"{"args":[]}"#).is_err());
    }

    #[test]
    fn reserved_event_names() {
        assert_eq!(Events::CONNECTED, "connected");
        assert_eq!(Events::MESSAGE, "message");
        assert_ne!(Events::JOIN, Events::LEAVE);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Frames
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn decode_frames_is_lossy() {
        let raw: Vec<Vec<u8>> = vec![b"temp.kitchen".to_vec(), vec![], vec![0xff, b'a']];
        let frames = decode_frames(raw);
        assert_eq!(frames[0], "temp.kitchen");
        assert_eq!(frames[1], "");
        assert!(frames[2].ends_with('a'));
    }

    #[test]
    fn frames_enter_chains_as_string_arrays() {
        let frames: Frames = vec!["t".into(), "".into(), "23".into()];
        assert_eq!(frames_to_value(&frames), json!(["t", "", "23"]));
    }

    #[test]
    fn send_chain_output_flattens_to_frames() {
        assert!(value_to_frames(json!(null)).is_empty());
        assert_eq!(value_to_frames(json!("one")), vec!["one".to_string()]);
        assert_eq!(
            value_to_frames(json!(["topic", "", {"v": 1}])),
            vec!["topic".to_string(), "".to_string(), r#"{"v":1}"#.to_string()]
        );
        assert_eq!(value_to_frames(json!(42)), vec!["42".to_string()]);
    }
}
