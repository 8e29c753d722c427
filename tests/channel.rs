mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bytes::Bytes;
use common::*;
use tokio::io::AsyncWriteExt;
use wsflow::{
    send, BufferedTextMessage, CloseMessage, CloseState, ExtensionFunction, FrameType,
    MessageDispatcher, Options, PeerConnections, ReceiveListener, Role, WebSocketChannel,
    WebSocketError,
};

fn frame(fin: bool, opcode: u8, payload: &[u8]) -> RawFrame {
    RawFrame {
        fin,
        rsv: 0,
        opcode,
        masked: false,
        payload: payload.to_vec(),
    }
}

#[tokio::test]
async fn test_hello_round_trip() {
    let (channel, mut peer) = pair(Options::default());
    peer.send(FIN | TEXT, b"hello").await;

    let inbound = channel.receive().await.unwrap();
    assert_eq!(inbound.frame_type(), FrameType::Text);
    let mut message = BufferedTextMessage::for_channel(&channel);
    message.read(&inbound).await.unwrap();
    assert!(message.is_complete());
    assert_eq!(message.data(), "hello");
    drop(inbound);

    send::send_text(&channel, message.data()).await.unwrap();
    assert_eq!(peer.read_frame().await, frame(true, TEXT, b"hello"));
}

#[tokio::test]
async fn test_ping_overtakes_fragmented_message() {
    let (channel, mut peer) = pair(Options::default().with_buffer_size(4));

    let mut sink = channel.send(FrameType::Binary).unwrap();
    sink.write_all(b"abcd").await.unwrap();
    sink.flush().await.unwrap();

    // queued behind the fragmented message
    let queued = {
        let channel = channel.clone();
        tokio::spawn(async move { send::send_text(&channel, "next").await })
    };

    send::send_ping(&channel, b"p").await.unwrap();
    sink.write_all(b"efgh").await.unwrap();
    sink.flush().await.unwrap();
    sink.write_all(b"ij").await.unwrap();
    sink.shutdown().await.unwrap();
    queued.await.unwrap().unwrap();

    assert_eq!(peer.read_frame().await, frame(false, BINARY, b"abcd"));
    assert_eq!(peer.read_frame().await, frame(true, PING, b"p"));
    assert_eq!(peer.read_frame().await, frame(false, CONTINUATION, b"efgh"));
    assert_eq!(peer.read_frame().await, frame(true, CONTINUATION, b"ij"));
    assert_eq!(peer.read_frame().await, frame(true, TEXT, b"next"));
}

#[tokio::test]
async fn test_messages_keep_sender_order() {
    let (channel, mut peer) = pair(Options::default());

    let mut first = channel.send(FrameType::Text).unwrap();
    let mut second = channel.send(FrameType::Binary).unwrap();

    let later = tokio::spawn(async move {
        second.write_all(b"2").await?;
        second.shutdown().await
    });

    first.write_all(b"1").await.unwrap();
    first.shutdown().await.unwrap();
    later.await.unwrap().unwrap();

    assert_eq!(peer.read_frame().await, frame(true, TEXT, b"1"));
    assert_eq!(peer.read_frame().await, frame(true, BINARY, b"2"));
}

#[tokio::test]
async fn test_dropped_sink_releases_its_turn() {
    let (channel, mut peer) = pair(Options::default());

    let unused = channel.send(FrameType::Text).unwrap();
    let waiting = {
        let channel = channel.clone();
        tokio::spawn(async move { send::send_binary(&channel, b"x").await })
    };
    tokio::task::yield_now().await;
    drop(unused);

    waiting.await.unwrap().unwrap();
    assert_eq!(peer.read_frame().await, frame(true, BINARY, b"x"));
}

#[tokio::test]
async fn test_peer_initiated_close_is_echoed() {
    let (channel, mut peer) = pair(Options::default());
    peer.send(FIN | CLOSE, &close_payload(1000, "bye")).await;

    let inbound = channel.receive().await.unwrap();
    assert_eq!(inbound.frame_type(), FrameType::Close);
    let message = CloseMessage::decode(&inbound.read_to_end().await.unwrap()).unwrap();
    drop(inbound);

    assert!(matches!(
        channel.send(FrameType::Text),
        Err(WebSocketError::CloseFrameReceived)
    ));

    send::send_close(&channel, &message).await.unwrap();
    assert_eq!(channel.close_state(), CloseState::Closed);
    assert!(channel.is_close_initiated_by_peer());
    assert!(channel.is_terminated());

    assert_eq!(
        peer.read_frame().await,
        frame(true, CLOSE, &close_payload(1000, "bye"))
    );
    assert!(peer.read_to_end().await.is_empty());
}

#[tokio::test]
async fn test_locally_initiated_close() {
    let (channel, mut peer) = pair(Options::default());

    channel.send_close().await.unwrap();
    assert_eq!(channel.close_state(), CloseState::CloseSent);

    let close = peer.read_frame().await;
    assert_eq!(close, frame(true, CLOSE, &close_payload(1000, "")));

    peer.send(FIN | CLOSE, &close.payload).await;
    let inbound = channel.receive().await.unwrap();
    inbound.read_to_end().await.unwrap();
    assert_eq!(channel.close_state(), CloseState::Closed);
    assert!(!channel.is_close_initiated_by_peer());
    assert_eq!(channel.close_code(), Some(wsflow::CloseCode::Normal));

    channel.close().await.unwrap();
    assert!(peer.read_to_end().await.is_empty());
}

#[tokio::test]
async fn test_utf8_split_across_reads() {
    let (channel, mut peer) = pair(Options::default());
    let text = "zß水🍌".as_bytes();
    let wire = encode(FIN | TEXT, text, peer.mask);

    // stop in the middle of the four-byte emoji
    let split = wire.len() - 2;
    peer.send_raw(&wire[..split]).await;

    let inbound = channel.receive().await.unwrap();
    let first = inbound.read_payload(64).await.unwrap().unwrap();
    assert_eq!(first.len(), text.len() - 2);

    peer.send_raw(&wire[split..]).await;
    let second = inbound.read_payload(64).await.unwrap().unwrap();
    assert_eq!([&first[..], &second[..]].concat(), text);
    assert_eq!(inbound.read_payload(64).await.unwrap(), None);
    assert!(inbound.is_complete());
}

#[tokio::test]
async fn test_utf8_sequences_across_fragments() {
    let (channel, mut peer) = pair(Options::default());
    peer.send(TEXT, b"a\xc3").await;
    peer.send(CONTINUATION, b"\xa9\xe2\x82").await;
    peer.send(CONTINUATION, b"\xac").await;
    peer.send(FIN | CONTINUATION, b"").await;

    let mut message = BufferedTextMessage::for_channel(&channel);
    while !message.is_complete() {
        let inbound = channel.receive().await.unwrap();
        message.read(&inbound).await.unwrap();
    }
    assert_eq!(message.data(), "aé€");
}

async fn assert_closed_with_1007(peer: &mut RawPeer) {
    let close = peer.read_frame().await;
    assert_eq!(close.opcode, CLOSE);
    assert_eq!(&close.payload[..2], &1007u16.to_be_bytes());
}

#[tokio::test]
async fn test_utf8_sequence_cut_by_empty_final_fragment() {
    let (channel, mut peer) = pair(Options::default());
    peer.send(TEXT, b"a\xc3").await;
    peer.send(FIN | CONTINUATION, b"").await;

    let mut message = BufferedTextMessage::for_channel(&channel);
    let first = channel.receive().await.unwrap();
    message.read(&first).await.unwrap();
    drop(first);

    assert!(matches!(
        channel.receive().await,
        Err(WebSocketError::InvalidUTF8)
    ));
    assert_closed_with_1007(&mut peer).await;
}

#[tokio::test]
async fn test_utf8_sequence_cut_by_short_final_fragment() {
    let (channel, mut peer) = pair(Options::default());
    peer.send(TEXT, b"a\xe2").await;
    peer.send(FIN | CONTINUATION, b"\x82").await;

    let mut message = BufferedTextMessage::for_channel(&channel);
    let first = channel.receive().await.unwrap();
    message.read(&first).await.unwrap();
    drop(first);

    let last = channel.receive().await.unwrap();
    assert!(matches!(
        message.read(&last).await,
        Err(WebSocketError::InvalidUTF8)
    ));
    assert_closed_with_1007(&mut peer).await;
}

struct Ignore;

impl ReceiveListener for Ignore {}

#[tokio::test]
async fn test_oversized_message_closes_with_1009() {
    let options = Options::default()
        .with_buffer_size(4)
        .with_max_message_size(8);
    let (channel, mut peer) = pair(options);
    let pool = channel.buffer_pool().clone();

    peer.send(BINARY, b"abcdef").await;
    peer.send(FIN | CONTINUATION, b"ghijkl").await;

    let mut dispatcher = MessageDispatcher::new(Ignore);
    assert!(matches!(
        dispatcher.run(&channel).await,
        Err(WebSocketError::MessageTooBig { limit: 8 })
    ));

    let close = peer.read_frame().await;
    assert_eq!(close.opcode, CLOSE);
    assert_eq!(&close.payload[..2], &1009u16.to_be_bytes());

    assert!(channel.is_terminated());
    assert_eq!(pool.outstanding(), 0);
}

#[tokio::test]
async fn test_peer_eof_without_close() {
    let (channel, mut peer) = pair(Options::default());
    peer.io.shutdown().await.unwrap();

    assert!(matches!(
        channel.receive().await,
        Err(WebSocketError::ConnectionClosed)
    ));

    let close = peer.read_frame().await;
    assert_eq!(close.opcode, CLOSE);
    assert_eq!(&close.payload[..2], &1001u16.to_be_bytes());
    assert!(channel.is_terminated());
}

#[tokio::test]
async fn test_client_role_masks_outbound() {
    let (io, remote) = tokio::io::duplex(64 * 1024);
    let channel = WebSocketChannel::new(io, Options::default().with_role(Role::Client));
    let mut peer = RawPeer::new(remote, false);

    peer.send(FIN | BINARY, b"from server").await;
    let inbound = channel.receive().await.unwrap();
    assert!(!inbound.is_masked());
    assert_eq!(&inbound.read_to_end().await.unwrap()[..], b"from server");
    drop(inbound);

    send::send_binary(&channel, b"from client").await.unwrap();
    let sent = peer.read_frame().await;
    assert!(sent.masked);
    assert_eq!(sent.payload, b"from client");
}

struct Xor {
    disposed: Arc<AtomicUsize>,
}

impl Xor {
    fn apply(payload: Bytes) -> Bytes {
        payload.iter().map(|b| b ^ 0x55).collect()
    }
}

impl ExtensionFunction for Xor {
    fn name(&self) -> &str {
        "x-xor"
    }

    fn rsv_bits(&self) -> u8 {
        0b100
    }

    fn transform_for_write(
        &mut self,
        payload: Bytes,
        _frame_type: FrameType,
        _last: bool,
    ) -> wsflow::Result<Bytes> {
        Ok(Self::apply(payload))
    }

    fn transform_for_read(
        &mut self,
        payload: Bytes,
        _frame_type: FrameType,
        _last: bool,
    ) -> wsflow::Result<Bytes> {
        Ok(Self::apply(payload))
    }

    fn dispose(&mut self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_extension_transforms_flagged_messages() {
    let disposed = Arc::new(AtomicUsize::new(0));
    let (io, remote) = tokio::io::duplex(64 * 1024);
    let channel = WebSocketChannel::builder(io)
        .extension(Xor {
            disposed: disposed.clone(),
        })
        .build();
    let mut peer = RawPeer::new(remote, true);
    assert_eq!(channel.extension_names(), vec!["x-xor".to_owned()]);

    let encoded: Vec<u8> = b"hello".iter().map(|b| b ^ 0x55).collect();
    peer.send(FIN | RSV1 | TEXT, &encoded).await;
    peer.send(FIN | BINARY, b"raw").await;

    let inbound = channel.receive().await.unwrap();
    assert_eq!(inbound.rsv(), 0b100);
    assert_eq!(&inbound.read_to_end().await.unwrap()[..], b"hello");
    drop(inbound);

    let inbound = channel.receive().await.unwrap();
    assert_eq!(&inbound.read_to_end().await.unwrap()[..], b"raw");
    drop(inbound);

    send::send_text(&channel, "hi").await.unwrap();
    let sent = peer.read_frame().await;
    assert_eq!(sent.rsv, 0b100);
    assert_eq!(sent.payload, vec![b'h' ^ 0x55, b'i' ^ 0x55]);

    channel.force_close();
    channel.force_close();
    channel.close().await.unwrap();
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_broadcast_to_peers() {
    let peers = PeerConnections::new();
    let mut remotes = Vec::new();
    let mut channels = Vec::new();
    for _ in 0..2 {
        let (io, remote) = tokio::io::duplex(64 * 1024);
        channels.push(WebSocketChannel::builder(io).peers(peers.clone()).build());
        remotes.push(RawPeer::new(remote, true));
    }
    assert_eq!(peers.len(), 2);

    for channel in peers.snapshot() {
        send::send_text(&channel, "all").await.unwrap();
    }
    for remote in remotes.iter_mut() {
        assert_eq!(remote.read_frame().await, frame(true, TEXT, b"all"));
    }

    channels[0].close().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert!(!peers.contains(channels[0].id()));
    assert!(peers.contains(channels[1].id()));
}

#[test]
fn test_blocking_calls_off_runtime() {
    let (channel, mut peer) = pair(Options::default());
    futures::executor::block_on(peer.send(FIN | BINARY, b"data"));

    let inbound = channel.receive_blocking().unwrap();
    let payload = inbound.read_payload_blocking(16).unwrap().unwrap();
    assert_eq!(&payload[..], b"data");
    drop(inbound);

    send::send_binary_blocking(&channel, b"back").unwrap();
    let reply = futures::executor::block_on(peer.read_frame());
    assert_eq!(reply, frame(true, BINARY, b"back"));

    channel.close_blocking().unwrap();
    assert!(channel.is_terminated());
}

#[tokio::test]
async fn test_blocking_calls_rejected_on_runtime() {
    let (channel, _peer) = pair(Options::default());

    assert!(matches!(
        channel.receive_blocking(),
        Err(WebSocketError::BlockingOnIoThread)
    ));
    assert!(matches!(
        channel.close_blocking(),
        Err(WebSocketError::BlockingOnIoThread)
    ));
    assert!(channel.is_open());
}
