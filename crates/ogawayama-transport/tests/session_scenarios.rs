//! End-to-end behaviour of a session segment shared by a server and a client.
//!
//! Both sides live in this process but only talk through the mapped segments.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ogawayama_transport::{
    ClientSession, ConnectionQueue, PhaseKind, ResponseSlotTable, ServerSession, SharedSegment,
    TransportConfig, TransportError, session_segment_name,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn unique_db(tag: &str) -> String {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    format!(
        "ogw-it-{tag}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

fn config() -> TransportConfig {
    TransportConfig::default()
        .with_timeout(Duration::from_millis(50))
        .with_wire_capacities(4096, 4096)
        .with_result_sets(4, 2, 1024)
}

fn connect(db: &str, id: u64) -> (ServerSession, ClientSession) {
    let server = ServerSession::create(db, id, &config()).unwrap();
    let client = ClientSession::open(db, id, &config()).unwrap();
    (server, client)
}

#[test]
fn request_frame_reaches_the_server_intact() {
    init_tracing();
    let db = unique_db("request");
    let (server, client) = connect(&db, 1);

    client.request_wire().write(b"abcdefgh", 1).unwrap();

    let header = server.request_wire().peek(true).unwrap().unwrap();
    assert_eq!(header.index, 1);
    assert_eq!(header.length, 8);
    let mut payload = vec![0u8; header.length as usize];
    server.request_wire().read(&mut payload).unwrap();
    assert_eq!(payload, b"abcdefgh");
}

#[test]
fn result_set_chunks_then_end_of_records() {
    init_tracing();
    let db = unique_db("rows");
    let (server, client) = connect(&db, 1);

    let wires = server.result_sets().acquire("rs-1").unwrap();
    let mut writer = wires.acquire_writer().unwrap();
    let mut reader = client.open_result_set("rs-1").unwrap();

    writer.write(b"row_11_data").unwrap();
    writer.write(b"row_12_data").unwrap();
    writer.commit().unwrap();
    writer.write(b"row_21_data").unwrap();
    writer.write(b"row_22_data").unwrap();
    writer.commit().unwrap();
    writer.commit().unwrap();

    let handle = reader.search(true).unwrap().unwrap();
    assert_eq!(
        reader.get_chunk(handle, true).unwrap().unwrap(),
        b"row_11_datarow_12_data"
    );
    reader.dispose(handle);
    assert_eq!(
        reader.get_chunk(handle, true).unwrap().unwrap(),
        b"row_21_datarow_22_data"
    );
    reader.dispose(handle);
    assert!(reader.get_chunk(handle, true).unwrap().unwrap().is_empty());
    assert!(reader.is_eor());
}

#[test]
fn admission_follows_ticket_order() {
    init_tracing();
    let db = unique_db("admit");
    let server = ConnectionQueue::create(&db, &config()).unwrap();
    let client_a = ConnectionQueue::open(&db, &config()).unwrap();
    let client_b = ConnectionQueue::open(&db, &config()).unwrap();

    for _ in 0..4 {
        let ticket = client_a.request().unwrap();
        server.accept(ticket).unwrap();
    }
    let fifth = client_a.request().unwrap();
    let sixth = client_b.request().unwrap();
    assert_eq!((fifth, sixth), (5, 6));

    assert!(matches!(
        server.accept(6),
        Err(TransportError::ProtocolViolation(_))
    ));
    server.accept(5).unwrap();
    server.accept(6).unwrap();
    assert!(client_a.check(5, false).unwrap());
    assert!(client_b.check(6, true).unwrap());
}

#[test]
fn blocked_read_fails_with_peer_failure_when_server_dies() {
    init_tracing();
    let db = unique_db("crash");
    let (server, client) = connect(&db, 1);
    let name = session_segment_name(&db, 1);
    assert!(SharedSegment::is_alive(&name));

    let started = Instant::now();
    thread::scope(|s| {
        let reader = s.spawn(|| client.response_wire().peek(true));
        thread::sleep(Duration::from_millis(20));
        drop(server);
        let result = reader.join().unwrap();
        assert!(matches!(result, Err(TransportError::PeerFailure)));
    });
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(!SharedSegment::is_alive(&name));
}

#[test]
fn two_phase_responses_are_demultiplexed_by_slot() {
    init_tracing();
    let db = unique_db("slots");
    let (server, client) = connect(&db, 1);
    let slots = ResponseSlotTable::new(4, Duration::from_millis(50));

    let first = slots.claim().unwrap();
    let second = slots.claim().unwrap();
    client.request_wire().write(b"q1", first.get()).unwrap();
    client.request_wire().write(b"q2", second.get()).unwrap();

    // Server answers out of order: second request first, first as two phases.
    let mut indexes = Vec::new();
    for _ in 0..2 {
        let (header, _) = server.request_wire().read_message(true).unwrap().unwrap();
        indexes.push(header.index);
    }
    let response = server.response_wire();
    response.write(b"a2", indexes[1]).unwrap();
    response
        .write_with_kind(b"rs-name", indexes[0], PhaseKind::Head)
        .unwrap();
    response
        .write_with_kind(b"done", indexes[0], PhaseKind::Body)
        .unwrap();

    for _ in 0..3 {
        let (header, payload) = client.response_wire().read_message(true).unwrap().unwrap();
        slots
            .note_arrival(header.index, header.kind, Bytes::from(payload))
            .unwrap();
    }
    assert_eq!(&slots.consume(second).unwrap()[..], b"a2");
    assert_eq!(&slots.consume(first).unwrap()[..], b"rs-name");
    assert_eq!(&slots.consume(first).unwrap()[..], b"done");
    assert_eq!(slots.in_use(), 0);
}

#[test]
fn released_result_set_is_swept_after_client_closes() {
    init_tracing();
    let db = unique_db("sweep");
    let (server, client) = connect(&db, 1);
    let pool = server.result_sets();

    let wires = pool.acquire("rs").unwrap();
    wires.acquire_writer().unwrap().finish().unwrap();
    let reader = client.open_result_set("rs").unwrap();
    assert!(reader.is_eor());
    wires.release();
    assert_eq!(pool.sweep(), 0);

    drop(reader);
    assert_eq!(pool.sweep(), 1);
    assert_eq!(pool.active(), 0);
    assert!(matches!(
        client.open_result_set("rs"),
        Err(TransportError::NotFound(_))
    ));
}
