use super::*;
use crate::storage::PieceStore;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[test]
fn test_bitfield_set_and_get() {
    let mut bf = Bitfield::new(100);
    assert!(!bf.has(0));

    bf.set(0);
    assert!(bf.has(0));

    bf.set(99);
    assert!(bf.has(99));
    assert_eq!(bf.count(), 2);

    // Bits never set stay clear, even neighbors within the same byte.
    assert!(!bf.has(1));
    assert!(!bf.has(98));
}

#[test]
fn test_bitfield_out_of_range_is_a_noop() {
    let mut bf = Bitfield::new(8);
    bf.set(8);
    bf.set(1000);
    assert_eq!(bf.count(), 0);
    assert!(!bf.has(1000));
}

#[test]
fn test_bitfield_new_and_full() {
    for n in [1usize, 7, 8, 9, 64, 133] {
        let empty = Bitfield::new(n);
        assert_eq!(empty.len(), n);
        assert!(!empty.is_complete());

        let full = Bitfield::full(n);
        assert_eq!(full.len(), n);
        assert!(full.is_complete());
        assert_eq!(full.count(), n);
    }
}

#[test]
fn test_bitfield_completeness_ignores_spare_bits() {
    // 12 pieces occupy one and a half bytes; the low nibble of the second
    // byte is padding and must not count toward completeness.
    let mut bf = Bitfield::new(12);
    for i in 0..12 {
        bf.set(i);
    }
    assert!(bf.is_complete());
    assert_eq!(bf.as_bytes(), &[0xFF, 0xF0]);
}

#[test]
fn test_bitfield_from_bytes_clears_spare_bits() {
    // A remote peer set padding bits it shouldn't have.
    let bf = Bitfield::from_bytes(Bytes::from_static(&[0xFF, 0xFF]), 12);
    assert_eq!(bf.count(), 12);
    assert_eq!(bf.as_bytes(), &[0xFF, 0xF0]);
}

#[test]
fn test_bitfield_from_bytes_short_payload() {
    let bf = Bitfield::from_bytes(Bytes::from_static(&[0x80]), 16);
    assert!(bf.has(0));
    assert!(!bf.has(8));
    assert_eq!(bf.as_bytes().len(), 2);
}

#[test]
fn test_has_piece_missing_from() {
    let mut local = Bitfield::new(4);
    local.set(0);
    local.set(2);
    let remote = Bitfield::full(4);

    // The remote holds piece 1, which we lack.
    assert!(local.has_piece_missing_from(&remote).unwrap());
    // Nobody offers anything beyond what a peer itself holds.
    assert!(!remote.has_piece_missing_from(&local).unwrap());
    // Identical bitfields offer nothing.
    assert!(!local.has_piece_missing_from(&local.clone()).unwrap());
}

#[test]
fn test_has_piece_missing_from_length_mismatch() {
    let local = Bitfield::new(4);
    let remote = Bitfield::new(8);
    assert!(matches!(
        local.has_piece_missing_from(&remote),
        Err(PeerError::BitfieldMismatch { ours: 4, theirs: 8 })
    ));
}

#[test]
fn test_bitfield_iter() {
    let mut bf = Bitfield::new(5);
    bf.set(1);
    bf.set(4);
    let bits: Vec<bool> = bf.iter().collect();
    assert_eq!(bits, vec![false, true, false, false, true]);
    // The iteration restarts from scratch each time.
    assert_eq!(bf.iter().count(), 5);
}

#[test]
fn test_handshake_encode_decode() {
    for peer_id in [0u32, 1001, 424242, u32::MAX] {
        let encoded = Handshake::new(peer_id).encode();
        assert_eq!(encoded.len(), HANDSHAKE_LEN);
        let decoded = Handshake::decode(&encoded).unwrap();
        assert_eq!(decoded.peer_id, peer_id);
    }
}

#[test]
fn test_handshake_rejects_corruption() {
    let good = Handshake::new(1001).encode();

    // Corrupting the magic header at any position must be rejected.
    for i in 0..MAGIC.len() {
        let mut bad = good.to_vec();
        bad[i] ^= 0x01;
        assert!(Handshake::decode(&bad).is_err(), "magic byte {i}");
    }

    // Any non-zero padding byte must be rejected.
    for i in MAGIC.len()..MAGIC.len() + 10 {
        let mut bad = good.to_vec();
        bad[i] = 0x7F;
        assert!(Handshake::decode(&bad).is_err(), "padding byte {i}");
    }

    assert!(Handshake::decode(&good[..31]).is_err());
}

#[test]
fn test_message_encode_decode() {
    let messages = vec![
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { index: 42 },
        Message::Bitfield(Bytes::from_static(&[0xA5, 0x0F])),
        Message::Request { index: 7 },
        Message::Piece {
            index: 3,
            data: Bytes::from_static(b"piece payload bytes"),
        },
    ];

    for message in messages {
        let encoded = message.encode();

        // The length prefix covers the type byte plus the payload.
        let declared = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(declared as usize, encoded.len() - 4);

        let decoded = Message::decode(encoded).unwrap();
        assert_eq!(decoded, message);
    }
}

#[test]
fn test_message_decode_rejects_bad_input() {
    assert!(Message::decode(Bytes::from_static(&[0, 0])).is_err());

    // Zero-length frame.
    assert!(Message::decode(Bytes::from_static(&[0, 0, 0, 0])).is_err());

    // Unknown type byte.
    let unknown = Bytes::from_static(&[0, 0, 0, 1, 9]);
    assert!(matches!(
        Message::decode(unknown),
        Err(PeerError::InvalidMessageType(9))
    ));

    // Declared length longer than the data.
    let truncated = Bytes::from_static(&[0, 0, 0, 5, 4, 0]);
    assert!(Message::decode(truncated).is_err());
}

#[test]
fn test_request_table_reserve_and_release() {
    let table = RequestTable::new();

    assert!(table.try_reserve(3, 1001));
    assert!(!table.try_reserve(3, 1002));

    table.release(3);
    assert!(table.try_reserve(3, 1002));

    assert!(table.try_reserve(5, 1002));
    assert!(table.try_reserve(7, 1003));
    table.release_all_for(1002);
    assert!(table.try_reserve(3, 1001));
    assert!(table.try_reserve(5, 1001));
    assert!(!table.try_reserve(7, 1001));
}

#[test]
fn test_request_table_reserve_random() {
    let table = RequestTable::new();
    assert!(table.try_reserve(1, 1001));

    // Only unreserved candidates are eligible.
    let picked = table.reserve_random(&[0, 1, 2], 1002).unwrap();
    assert_ne!(picked, 1);

    let second = table.reserve_random(&[0, 1, 2], 1002).unwrap();
    assert_ne!(second, picked);
    assert_ne!(second, 1);

    assert_eq!(table.reserve_random(&[0, 1, 2], 1002), None);
}

#[test]
fn test_request_table_concurrent_reservation() {
    let table = Arc::new(RequestTable::new());

    let handles: Vec<_> = (0..32)
        .map(|peer| {
            let table = table.clone();
            std::thread::spawn(move || table.try_reserve(7, peer))
        })
        .collect();

    let granted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&granted| granted)
        .count();
    assert_eq!(granted, 1);
}

#[test]
fn test_request_table_concurrent_random_reservations_are_distinct() {
    let table = Arc::new(RequestTable::new());
    let candidates: Vec<u32> = (0..16).collect();

    let handles: Vec<_> = (0..16)
        .map(|peer| {
            let table = table.clone();
            let candidates = candidates.clone();
            std::thread::spawn(move || table.reserve_random(&candidates, peer))
        })
        .collect();

    let mut picked: Vec<u32> = handles
        .into_iter()
        .map(|h| h.join().unwrap().expect("a candidate was available"))
        .collect();
    picked.sort_unstable();
    picked.dedup();
    assert_eq!(picked.len(), 16);
}

#[tokio::test]
async fn test_transport_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = PeerTransport::new(stream);

        let handshake = transport.receive_handshake().await.unwrap();
        assert_eq!(handshake.peer_id, 1002);
        transport
            .send_handshake(&Handshake::new(1001))
            .await
            .unwrap();

        let (mut reader, mut writer) = transport.into_split();
        match reader.receive_message().await.unwrap() {
            Message::Request { index } => {
                writer
                    .send_message(&Message::Piece {
                        index,
                        data: Bytes::from_static(b"0123456789abcdef"),
                    })
                    .await
                    .unwrap();
            }
            other => panic!("unexpected message: {other:?}"),
        }
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut transport = PeerTransport::new(stream);
    transport
        .send_handshake(&Handshake::new(1002))
        .await
        .unwrap();
    let handshake = transport.receive_handshake().await.unwrap();
    assert_eq!(handshake.peer_id, 1001);

    let (mut reader, mut writer) = transport.into_split();
    writer
        .send_message(&Message::Request { index: 4 })
        .await
        .unwrap();
    match reader.receive_message().await.unwrap() {
        Message::Piece { index, data } => {
            assert_eq!(index, 4);
            assert_eq!(data.as_ref(), b"0123456789abcdef");
        }
        other => panic!("unexpected message: {other:?}"),
    }

    server.await.unwrap();
}

struct TestNeighbor {
    neighbor: Arc<Neighbor>,
    rx: mpsc::UnboundedReceiver<Message>,
}

fn test_neighbor(id: u32, interested: bool, rate: u64) -> TestNeighbor {
    let (tx, rx) = mpsc::unbounded_channel();
    let neighbor = Arc::new(Neighbor::new(id, tx));
    {
        let mut state = neighbor.state.lock();
        state.interested = interested;
        state.download_rate = rate;
    }
    TestNeighbor { neighbor, rx }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

async fn incomplete_store(temp: &TempDir) -> Arc<PieceStore> {
    Arc::new(
        PieceStore::open(temp.path().join("peer_1"), "file.dat", 64, 16, false)
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn test_preferred_selection_by_rate() {
    let temp = TempDir::new().unwrap();
    let store = incomplete_store(&temp).await;
    let neighbors = Arc::new(Neighbors::new());

    let mut fast = test_neighbor(1, true, 9);
    let mut mid = test_neighbor(2, true, 5);
    let mut slow = test_neighbor(3, true, 1);
    let mut aloof = test_neighbor(4, false, 100);
    for n in [&fast, &mid, &slow, &aloof] {
        neighbors.insert(n.neighbor.clone());
    }

    let scheduler = ChokeScheduler::new(
        neighbors.clone(),
        store,
        2,
        Duration::from_secs(5),
        Duration::from_secs(15),
    );
    scheduler.tick_preferred();

    // Exactly the two fastest interested neighbors are unchoked.
    assert_eq!(drain(&mut fast.rx), vec![Message::Unchoke]);
    assert_eq!(drain(&mut mid.rx), vec![Message::Unchoke]);
    assert!(drain(&mut slow.rx).is_empty());
    assert!(drain(&mut aloof.rx).is_empty());
    assert_eq!(fast.neighbor.state.lock().slot, ChokeSlot::Preferred);

    // Rates were reset; a newly fast neighbor displaces a previous pick,
    // which receives a CHOKE transition.
    slow.neighbor.state.lock().download_rate = 7;
    mid.neighbor.state.lock().download_rate = 6;
    scheduler.tick_preferred();

    assert_eq!(drain(&mut slow.rx), vec![Message::Unchoke]);
    assert!(drain(&mut mid.rx).is_empty());
    assert_eq!(drain(&mut fast.rx), vec![Message::Choke]);
    assert_eq!(fast.neighbor.state.lock().slot, ChokeSlot::Choked);
}

#[tokio::test]
async fn test_preferred_selection_breaks_ties_by_peer_id() {
    let temp = TempDir::new().unwrap();
    let store = incomplete_store(&temp).await;
    let neighbors = Arc::new(Neighbors::new());

    let mut low = test_neighbor(10, true, 4);
    let mut high = test_neighbor(20, true, 4);
    neighbors.insert(low.neighbor.clone());
    neighbors.insert(high.neighbor.clone());

    let scheduler = ChokeScheduler::new(
        neighbors,
        store,
        1,
        Duration::from_secs(5),
        Duration::from_secs(15),
    );
    scheduler.tick_preferred();

    assert_eq!(drain(&mut low.rx), vec![Message::Unchoke]);
    assert!(drain(&mut high.rx).is_empty());
}

#[tokio::test]
async fn test_optimistic_rotation() {
    let temp = TempDir::new().unwrap();
    let store = incomplete_store(&temp).await;
    let neighbors = Arc::new(Neighbors::new());

    let mut peers: Vec<TestNeighbor> = (1..=3).map(|id| test_neighbor(id, true, 0)).collect();
    for p in &peers {
        neighbors.insert(p.neighbor.clone());
    }

    let scheduler = ChokeScheduler::new(
        neighbors,
        store,
        1,
        Duration::from_secs(5),
        Duration::from_secs(15),
    );
    scheduler.tick_optimistic();

    let mut unchoked = Vec::new();
    for p in &mut peers {
        if drain(&mut p.rx).contains(&Message::Unchoke) {
            unchoked.push(p.neighbor.id);
        }
    }
    assert_eq!(unchoked.len(), 1);

    let optimistic: Vec<u32> = peers
        .iter()
        .filter(|p| p.neighbor.state.lock().slot == ChokeSlot::Optimistic)
        .map(|p| p.neighbor.id)
        .collect();
    assert_eq!(unchoked, optimistic);
}

#[tokio::test]
async fn test_optimistic_spares_promoted_neighbor() {
    let temp = TempDir::new().unwrap();
    let store = incomplete_store(&temp).await;
    let neighbors = Arc::new(Neighbors::new());

    let mut promoted = test_neighbor(1, true, 3);
    promoted.neighbor.state.lock().slot = ChokeSlot::Preferred;
    let mut idle = test_neighbor(2, false, 0);
    neighbors.insert(promoted.neighbor.clone());
    neighbors.insert(idle.neighbor.clone());

    let scheduler = ChokeScheduler::new(
        neighbors,
        store,
        1,
        Duration::from_secs(5),
        Duration::from_secs(15),
    );
    scheduler.tick_optimistic();

    // The preferred neighbor keeps its slot and no uninterested peer is
    // handed the optimistic one.
    assert!(drain(&mut promoted.rx).is_empty());
    assert!(drain(&mut idle.rx).is_empty());
    assert_eq!(promoted.neighbor.state.lock().slot, ChokeSlot::Preferred);
}

#[test]
fn test_broadcast_have_skips_source() {
    let neighbors = Neighbors::new();
    let mut source = test_neighbor(1, false, 0);
    let mut other = test_neighbor(2, false, 0);
    neighbors.insert(source.neighbor.clone());
    neighbors.insert(other.neighbor.clone());

    neighbors.broadcast_have(5, 1);

    assert!(drain(&mut source.rx).is_empty());
    assert_eq!(drain(&mut other.rx), vec![Message::Have { index: 5 }]);
}
