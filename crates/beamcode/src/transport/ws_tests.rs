// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use super::*;

#[test]
fn ws_consumer_transport_tracks_buffered_amount_until_drained() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    let transport = WsConsumerTransport { tx, buffered: Arc::clone(&buffered) };

    transport.send("hello".to_owned()).unwrap();
    assert_eq!(buffered.load(Ordering::SeqCst), 5);

    match rx.try_recv().unwrap() {
        WsOutbound::Text(text) => assert_eq!(text, "hello"),
        WsOutbound::Close(..) => panic!("expected a text frame"),
    }
}

#[test]
fn ws_consumer_transport_close_enqueues_a_close_command() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transport = WsConsumerTransport { tx, buffered: Arc::new(AtomicUsize::new(0)) };
    transport.close(4001, "bye");
    match rx.try_recv().unwrap() {
        WsOutbound::Close(code, reason) => {
            assert_eq!(code, 4001);
            assert_eq!(reason, "bye");
        }
        WsOutbound::Text(_) => panic!("expected a close frame"),
    }
}
