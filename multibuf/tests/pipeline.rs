//! End-to-end tests of the receive pipeline: pooled buffers, buffer swaps,
//! fragment streams, and frame decoding driven through the public API the way
//! a connection manager would drive it.

use multibuf::{
    mocks::{EchoCommand, EchoDecoder, FrameBuilder},
    BufferPool, DecodeOutcome, DecoderConfig, Error, FrameDecoder, PoolConfig, ReceiveState,
};
use prometheus_client::registry::Registry;
use rand::Rng;
use std::{sync::mpsc, thread, time::Duration};

fn pool(buffer_size: usize, min: usize, max: usize) -> BufferPool {
    let mut registry = Registry::default();
    BufferPool::new(
        PoolConfig {
            buffer_size,
            min_buffers: min,
            max_buffers: max,
        },
        &mut registry,
    )
}

fn connection(pool: BufferPool) -> ReceiveState<EchoDecoder> {
    ReceiveState::new(pool, FrameDecoder::new(EchoDecoder, DecoderConfig::default()))
        .expect("fresh pool cannot be closed")
}

/// Feeds `data` into the connection in chunks of at most `max_chunk` bytes,
/// decoding after every receive, and returns the commands in arrival order.
fn feed_chunked(
    state: &mut ReceiveState<EchoDecoder>,
    data: &[u8],
    max_chunk: usize,
    rng: &mut impl Rng,
) -> Vec<EchoCommand> {
    let mut commands = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let chunk = rng.gen_range(1..=max_chunk.min(data.len() - offset));
        let mut sent = 0;
        while sent < chunk {
            let n = state
                .receive_with(|free| {
                    let n = (chunk - sent).min(free.len());
                    free[..n].copy_from_slice(&data[offset + sent..offset + sent + n]);
                    n
                })
                .expect("pool closed mid-stream");
            sent += n;
        }
        offset += chunk;

        loop {
            match state.try_decode_next().expect("well-formed stream") {
                DecodeOutcome::FrameReady { command, .. } => commands.push(command),
                DecodeOutcome::NeedMoreData => break,
            }
        }
    }
    commands
}

#[test]
fn test_random_splits_preserve_frame_stream() {
    // Small buffers against large frames: every decode path (mid-header
    // splits, mid-payload splits, buffer swaps, multiple frames per receive)
    // gets exercised across iterations.
    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        let builder = FrameBuilder::typed();
        let mut expected = Vec::new();
        let mut wire = Vec::new();
        for tag in 0..25i16 {
            let payload: Vec<u8> = (0..rng.gen_range(0..200)).map(|_| rng.gen()).collect();
            wire.extend_from_slice(&builder.frame(tag, &payload));
            expected.push((tag, payload));
        }

        let mut state = connection(pool(64, 2, 16));
        let commands = feed_chunked(&mut state, &wire, 48, &mut rng);

        assert_eq!(commands.len(), expected.len());
        for (command, (tag, payload)) in commands.iter().zip(&expected) {
            assert_eq!(command.type_tag, *tag);
            assert_eq!(command.payload.as_ref(), &payload[..]);
        }
        assert!(!state.has_any_data());
    }
}

#[test]
fn test_legacy_protocol_end_to_end() {
    let mut rng = rand::thread_rng();
    let builder = FrameBuilder::untyped();
    let mut wire = Vec::new();
    for i in 0..10u8 {
        wire.extend_from_slice(&builder.frame(0, &[i; 33]));
    }

    let p = pool(64, 2, 8);
    let mut state = ReceiveState::new(
        p,
        FrameDecoder::new(
            EchoDecoder,
            DecoderConfig {
                client_version: 4000,
                ..DecoderConfig::default()
            },
        ),
    )
    .expect("fresh pool cannot be closed");

    let commands = feed_chunked(&mut state, &wire, 17, &mut rng);
    assert_eq!(commands.len(), 10);
    for (i, command) in commands.iter().enumerate() {
        assert_eq!(command.type_tag, 0);
        assert_eq!(command.payload.as_ref(), &[i as u8; 33]);
    }
}

#[test]
fn test_saturated_pool_backpressures_second_connection() {
    // Two buffers, both pinned by the first connection (one as its current
    // receive buffer, one via an undecoded fragment). Opening a second
    // connection must block until the first releases a buffer by decoding.
    let p = pool(64, 2, 2);
    let mut first = connection(p.clone());

    // Fill the first connection's buffer completely with the start of a
    // frame, forcing it to swap to (and pin) the second buffer.
    let frame = FrameBuilder::typed().frame(1, &[0x5a; 80]);
    let mut sent = 0;
    while sent < frame.len() {
        let n = first
            .receive_with(|free| {
                let n = (frame.len() - sent - 1).min(free.len()).max(1);
                free[..n].copy_from_slice(&frame[sent..sent + n]);
                n
            })
            .expect("pool closed mid-stream");
        sent += n;
        if sent + 1 >= frame.len() {
            break;
        }
    }
    assert_eq!(p.busy(), 2);

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let p = p.clone();
        thread::spawn(move || {
            let second = connection(p);
            tx.send(()).unwrap();
            drop(second);
        })
    };
    assert!(
        rx.recv_timeout(Duration::from_millis(100)).is_err(),
        "second connection acquired from a saturated pool"
    );

    // Deliver the final byte and decode: the first buffer's fragments drain
    // and it returns to the pool, unblocking the second connection.
    first
        .receive_with(|free| {
            free[0] = frame[frame.len() - 1];
            1
        })
        .expect("pool closed mid-stream");
    match first.try_decode_next().expect("well-formed stream") {
        DecodeOutcome::FrameReady { command, .. } => {
            assert_eq!(command.payload.as_ref(), &[0x5a; 80]);
        }
        DecodeOutcome::NeedMoreData => panic!("frame was complete"),
    }

    rx.recv_timeout(Duration::from_secs(5))
        .expect("second connection still blocked after decode");
    waiter.join().unwrap();
}

#[test]
fn test_desync_is_terminal_for_connection() {
    let p = pool(64, 1, 2);
    let mut state = connection(p.clone());
    state
        .receive_with(|free| {
            free[..12].copy_from_slice(b"garbage#####");
            12
        })
        .expect("pool closed");

    assert!(matches!(
        state.try_decode_next(),
        Err(Error::FramingDesync(_))
    ));

    // Teardown after a framing error must still return every buffer.
    drop(state);
    assert_eq!(p.busy(), 0);
    assert_eq!(p.idle(), 1);
}

#[test]
fn test_dispose_fails_pending_connection_setup() {
    let p = pool(64, 1, 1);
    let _held = connection(p.clone());

    let waiter = {
        let p = p.clone();
        thread::spawn(move || {
            ReceiveState::new(p, FrameDecoder::new(EchoDecoder, DecoderConfig::default()))
                .map(|_| ())
        })
    };
    thread::sleep(Duration::from_millis(50));
    p.dispose();

    assert!(matches!(waiter.join().unwrap(), Err(Error::PoolClosed)));
}
