use waxmpp_codec::{CodecError, Node, Reader, Writer, MESSAGE_START};
use waxmpp_crypto::KeyStream;

fn read_one(reader: &mut Reader, bytes: &[u8]) -> Node {
    reader.feed(bytes);
    reader.next_node().unwrap().expect("complete frame")
}

// ── Structural round-trips ────────────────────────────────────────────────────

#[test]
fn roundtrip_bare_node() {
    let node = Node::new("presence");
    let frame = Writer::new().node(&node).unwrap();
    assert_eq!(read_one(&mut Reader::new(), &frame), node);
}

#[test]
fn roundtrip_attributes_in_order() {
    let node = Node::new("message")
        .with_attribute("to", "31000000000@s.whatsapp.net")
        .with_attribute("type", "text")
        .with_attribute("id", "message-1700000000-1")
        .with_attribute("t", "1700000000");
    let frame = Writer::new().node(&node).unwrap();
    let parsed = read_one(&mut Reader::new(), &frame);
    assert_eq!(parsed, node);
    let keys: Vec<_> = parsed.attributes().iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, ["to", "type", "id", "t"]);
}

#[test]
fn roundtrip_payload() {
    let node = Node::new("body").with_data(&b"hello \xf0\x9f\x8c\x8d"[..]);
    let frame = Writer::new().node(&node).unwrap();
    assert_eq!(read_one(&mut Reader::new(), &frame), node);
}

#[test]
fn roundtrip_nested_children() {
    let node = Node::new("iq")
        .with_attribute("type", "result")
        .with_attribute("id", "42")
        .with_child(
            Node::new("query")
                .with_attribute("seconds", "120")
                .with_child(Node::new("item").with_attribute("jid", "x@s.whatsapp.net")),
        )
        .with_child(Node::new("ping"));
    let frame = Writer::new().node(&node).unwrap();
    assert_eq!(read_one(&mut Reader::new(), &frame), node);
}

#[test]
fn children_win_over_payload() {
    let mut node = Node::new("message");
    node.push_child(Node::new("body"));
    node.set_data(b"ignored".to_vec());
    let frame = Writer::new().node(&node).unwrap();
    let parsed = read_one(&mut Reader::new(), &frame);
    assert_eq!(parsed.children().len(), 1);
    assert_eq!(parsed.data(), None);
}

#[test]
fn roundtrip_large_payload_uses_long_form() {
    let node = Node::new("body").with_data(vec![0x42u8; 70_000]);
    let frame = Writer::new().node(&node).unwrap();
    assert_eq!(read_one(&mut Reader::new(), &frame), node);
}

// ── Incremental feeding ───────────────────────────────────────────────────────

#[test]
fn byte_at_a_time_equals_one_shot() {
    let nodes = [
        Node::new("presence").with_attribute("name", "Bob"),
        Node::new("message")
            .with_attribute("to", "31000000000@s.whatsapp.net")
            .with_child(Node::new("body").with_data(&b"hi"[..])),
        Node::new("ack").with_attribute("id", "message-1700000000-2"),
    ];
    let mut w = Writer::new();
    let stream: Vec<u8> = nodes.iter().flat_map(|n| w.node(n).unwrap()).collect();

    let mut one_shot = Reader::new();
    one_shot.feed(&stream);
    let mut a = Vec::new();
    while let Some(n) = one_shot.next_node().unwrap() {
        a.push(n);
    }

    let mut dribble = Reader::new();
    let mut b = Vec::new();
    for byte in &stream {
        dribble.feed(std::slice::from_ref(byte));
        while let Some(n) = dribble.next_node().unwrap() {
            b.push(n);
        }
    }

    assert_eq!(a, b);
    assert_eq!(a.len(), nodes.len());
}

#[test]
fn short_read_returns_none_without_consuming() {
    let frame = Writer::new().node(&Node::new("presence")).unwrap();
    let mut r = Reader::new();
    r.feed(&frame[..frame.len() - 1]);
    assert_eq!(r.next_node().unwrap(), None);
    assert_eq!(r.next_node().unwrap(), None);
    r.feed(&frame[frame.len() - 1..]);
    assert_eq!(r.next_node().unwrap(), Some(Node::new("presence")));
}

// ── Encrypted frames ──────────────────────────────────────────────────────────

fn keystream_pair() -> (KeyStream, KeyStream) {
    let cipher = [7u8; 20];
    let mac = [9u8; 20];
    (KeyStream::new(cipher, mac), KeyStream::new(cipher, mac))
}

#[test]
fn encrypted_roundtrip_in_lockstep() {
    let (tx, rx) = keystream_pair();
    let mut w = Writer::new();
    w.set_keystream(tx);
    let mut r = Reader::new();
    r.set_keystream(rx);

    for i in 0..4 {
        let node = Node::new("message")
            .with_attribute("id", format!("message-1700000000-{i}"))
            .with_child(Node::new("body").with_data(&b"sealed"[..]));
        let frame = w.node(&node).unwrap();
        assert_eq!(frame[0] & 0x80, 0x80, "encrypted bit must be set");
        assert_eq!(read_one(&mut r, &frame), node);
    }
}

#[test]
fn perturbed_mac_is_fatal() {
    let (tx, rx) = keystream_pair();
    let mut w = Writer::new();
    w.set_keystream(tx);
    let mut r = Reader::new();
    r.set_keystream(rx);

    let mut frame = w.node(&Node::new("presence")).unwrap();
    frame[3] ^= 0x01; // first MAC byte
    r.feed(&frame);
    assert!(matches!(r.next_node(), Err(CodecError::Mac(_))));
}

#[test]
fn encrypted_frame_without_keys_is_fatal() {
    let (tx, _) = keystream_pair();
    let mut w = Writer::new();
    w.set_keystream(tx);
    let frame = w.node(&Node::new("presence")).unwrap();

    let mut r = Reader::new();
    r.feed(&frame);
    assert_eq!(r.next_node(), Err(CodecError::EncryptedWithoutKeys));
}

// ── Stream prologue ───────────────────────────────────────────────────────────

#[test]
fn stream_start_carries_magic_and_header() {
    let out = Writer::new().start_stream("s.whatsapp.net", "S40-2.4.7-443");
    assert_eq!(&out[..3], &MESSAGE_START);

    let mut r = Reader::new();
    let node = read_one(&mut r, &out[3..]);
    assert_eq!(node.tag(), "start");
    assert_eq!(node.attribute("to"), Some("s.whatsapp.net"));
    assert_eq!(node.attribute("resource"), Some("S40-2.4.7-443"));
}

// ── Malformed input ───────────────────────────────────────────────────────────

#[test]
fn unknown_token_is_fatal() {
    // 2-byte body: list of one element whose tag is reserved token 0x02.
    let body = [0xf8, 0x01, 0x02];
    let mut frame = vec![0x00, 0x00, body.len() as u8];
    frame.extend_from_slice(&body);

    let mut r = Reader::new();
    r.feed(&frame);
    assert!(matches!(
        r.next_node(),
        Err(CodecError::UnexpectedByte { byte: 0x02 })
    ));
}

#[test]
fn trailing_bytes_are_fatal() {
    let mut frame = Writer::new().node(&Node::new("presence")).unwrap();
    // Lengthen the declared frame by one byte of garbage.
    let len = frame.len() - 3 + 1;
    frame[2] = len as u8;
    frame.push(0xAB);

    let mut r = Reader::new();
    r.feed(&frame);
    assert!(matches!(r.next_node(), Err(CodecError::TrailingBytes { .. })));
}
