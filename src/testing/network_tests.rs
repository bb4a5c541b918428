//! Loopback tests for the non-blocking network layer.
//!
//! These tests use real sockets and real I/O threads:
//! - Protocol negotiation fed one byte at a time
//! - Cluster, binary client and text protocols
//! - Concurrent producers on one connection
//! - Handler migration between input threads

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tracing::info;

    use crate::error::{Error, NetworkError, Result};
    use crate::executor::{Operation, OperationExecutor, OperationHandler};
    use crate::network::{
        ChannelInitializer, Connection, ConnectionListener, ConnectionManager,
        ExecutorPacketDispatcher, Packet, PacketDispatcher, Protocol, ProtocolInitializer,
        ResponseHandler, CLIENT_BINARY, CLUSTER, PROTOCOL, PROTOCOL_BUFFER,
    };
    use crate::testing::utils::{detached_connection, init_tracing, loopback_config, TrickleReader};
    use crate::testing::{
        EchoTextHandler, OverlapProbe, ProbeOperation, RecordingClientHandler, RecordingDispatcher,
        TestAssertions, TestMetrics,
    };
    use crate::types::ConnectionId;

    const WAIT: Duration = Duration::from_secs(10);
    const MAX_FRAME: usize = 1024 * 1024;

    fn start_manager(initializer: Arc<dyn ChannelInitializer>, inputs: usize) -> (ConnectionManager, SocketAddr) {
        init_tracing();
        let manager = ConnectionManager::new(loopback_config(inputs, 1), initializer).unwrap();
        let address = manager.start().unwrap();
        (manager, address)
    }

    fn cluster_manager(dispatcher: Arc<RecordingDispatcher>, inputs: usize) -> (ConnectionManager, SocketAddr) {
        start_manager(Arc::new(ProtocolInitializer::new(dispatcher, MAX_FRAME)), inputs)
    }

    fn sequenced(stream: u8, seq: u32) -> Packet {
        let mut payload = vec![stream];
        payload.extend_from_slice(&seq.to_be_bytes());
        Packet::operation(payload, stream as i32)
    }

    fn parse_sequenced(packet: &Packet) -> (u8, u32) {
        let p = packet.payload();
        (p[0], u32::from_be_bytes([p[1], p[2], p[3], p[4]]))
    }

    /// Connect a raw socket and wait until the manager has registered it.
    fn raw_connect(manager: &ConnectionManager, address: SocketAddr) -> TcpStream {
        let before = manager.connection_count();
        let socket = TcpStream::connect(address).unwrap();
        socket.set_read_timeout(Some(WAIT)).unwrap();
        TestAssertions::assert_eventually(
            || manager.connection_count() > before,
            WAIT,
            "server should register the connection",
        );
        socket
    }

    #[derive(Default)]
    struct RecordingListener {
        added: Mutex<Vec<ConnectionId>>,
        closed: Mutex<Vec<(ConnectionId, String)>>,
    }

    impl ConnectionListener for RecordingListener {
        fn on_connection_added(&self, connection: &Arc<Connection>) {
            self.added.lock().push(connection.id());
        }

        fn on_connection_closed(&self, connection: &Arc<Connection>, reason: &str) {
            self.closed.lock().push((connection.id(), reason.to_string()));
        }
    }

    #[test]
    fn test_writer_liveness_with_concurrent_producers() {
        const PRODUCERS: u8 = 4;
        const PER_PRODUCER: u32 = 500;

        let received = RecordingDispatcher::new();
        let (server, address) = cluster_manager(received.clone(), 1);
        let (client, _) = cluster_manager(RecordingDispatcher::new(), 1);
        let connection = client.connect(address).unwrap();
        assert!(connection.is_client_mode());
        assert_eq!(connection.endpoint(), Some(address));

        let metrics = Mutex::new(TestMetrics::new());
        thread::scope(|s| {
            for producer in 0..PRODUCERS {
                let connection = &connection;
                let metrics = &metrics;
                s.spawn(move || {
                    let start = Instant::now();
                    for seq in 0..PER_PRODUCER {
                        if !connection.write_packet(sequenced(producer, seq)) {
                            metrics.lock().record_error("write_rejected");
                        }
                        if seq % 50 == 0 {
                            thread::yield_now();
                        }
                    }
                    metrics.lock().record_latency(start.elapsed());
                });
            }
        });
        let total = PRODUCERS as usize * PER_PRODUCER as usize;
        TestAssertions::assert_eventually(
            || received.packet_count() == total,
            WAIT,
            "every written frame should arrive",
        );
        info!("{}", metrics.lock().report());
        assert_eq!(metrics.lock().total_errors(), 0);

        let mut per_producer: BTreeMap<u8, Vec<u32>> = BTreeMap::new();
        for packet in received.packets() {
            let (producer, seq) = parse_sequenced(&packet);
            assert_eq!(packet.partition_id(), producer as i32);
            assert!(packet.connection().is_some());
            per_producer.entry(producer).or_default().push(seq);
        }
        assert_eq!(per_producer.len(), PRODUCERS as usize);
        for seqs in per_producer.values() {
            assert_eq!(*seqs, (0..PER_PRODUCER).collect::<Vec<_>>());
        }

        TestAssertions::assert_eventually(
            || connection.write_queue().is_empty() && !connection.write_queue().is_scheduled(),
            WAIT,
            "writer should drain and unschedule",
        );
        assert_eq!(connection.stats().frames_written.get(), total as u64);

        // A write after the writer went idle must still be delivered.
        assert!(connection.write_packet(sequenced(0, PER_PRODUCER)));
        TestAssertions::assert_eventually(
            || received.packet_count() == total + 1,
            WAIT,
            "late write should arrive",
        );

        assert!(client.shutdown());
        assert!(server.shutdown());
    }

    #[test]
    fn test_handshake_one_byte_at_a_time() {
        let received = RecordingDispatcher::new();
        let (server, address) = cluster_manager(received.clone(), 1);
        let mut socket = raw_connect(&server, address);

        for byte in CLUSTER {
            socket.write_all(&[*byte]).unwrap();
            socket.flush().unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        let frame = Packet::operation(&b"hello"[..], 7).encode().unwrap();
        for byte in frame.iter() {
            socket.write_all(&[*byte]).unwrap();
            thread::sleep(Duration::from_millis(1));
        }

        TestAssertions::assert_eventually(|| received.packet_count() == 1, WAIT, "packet should arrive");
        let packet = &received.packets()[0];
        assert_eq!(packet.partition_id(), 7);
        assert_eq!(packet.payload(), &Bytes::from_static(b"hello"));

        // The accepting side answers with its own tag once the protocol is known.
        let mut tag = [0u8; 3];
        socket.read_exact(&mut tag).unwrap();
        assert_eq!(&tag, CLUSTER);

        let connection = server.connections().pop().unwrap();
        assert_eq!(connection.attributes().get::<Protocol>(PROTOCOL), Some(Protocol::Cluster));
        assert!(!connection.attributes().contains(PROTOCOL_BUFFER));
        assert!(!connection.is_client_mode());
        assert_eq!(connection.stats().normal_frames_read.get(), 1);
    }

    #[test]
    fn test_initializer_accumulates_partial_tag() {
        let dispatcher = RecordingDispatcher::new();
        let initializer = ProtocolInitializer::new(dispatcher, MAX_FRAME);
        let (connection, _io, _peer) = detached_connection(false);
        let mut source = TrickleReader::new(b"HZC");

        assert!(initializer.init_inbound(&connection, &mut source).unwrap().is_none());
        assert!(connection.attributes().contains(PROTOCOL_BUFFER));
        source.arm();
        assert!(initializer.init_inbound(&connection, &mut source).unwrap().is_none());
        assert!(!initializer.is_outbound_ready(&connection));
        assert!(initializer.init_outbound(&connection).unwrap().is_none());

        source.arm();
        let init = initializer.init_inbound(&connection, &mut source).unwrap().unwrap();
        assert!(init.buffer.is_empty());
        assert_eq!(connection.attributes().get::<Protocol>(PROTOCOL), Some(Protocol::Cluster));
        assert!(!connection.attributes().contains(PROTOCOL_BUFFER));
        assert_eq!(connection.stats().bytes_read.get(), 3);

        assert!(initializer.is_outbound_ready(&connection));
        let outbound = initializer.init_outbound(&connection).unwrap().unwrap();
        assert_eq!(outbound.prefix, Bytes::from_static(CLUSTER));
    }

    #[test]
    fn test_initializer_text_fallback() {
        let (connection, _io, _peer) = detached_connection(false);
        let mut source = TrickleReader::new(b"GET");

        let strict = ProtocolInitializer::new(RecordingDispatcher::new(), MAX_FRAME);
        for _ in 0..2 {
            assert!(strict.init_inbound(&connection, &mut source).unwrap().is_none());
            source.arm();
        }
        let err = strict.init_inbound(&connection, &mut source).unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::HandshakeFailed(_))));

        let (connection, _io, _peer) = detached_connection(false);
        let mut source = TrickleReader::new(b"GET");
        let text = ProtocolInitializer::new(RecordingDispatcher::new(), MAX_FRAME)
            .with_text_handler(EchoTextHandler::new());
        for _ in 0..2 {
            assert!(text.init_inbound(&connection, &mut source).unwrap().is_none());
            source.arm();
        }
        let init = text.init_inbound(&connection, &mut source).unwrap().unwrap();
        // The tag is the start of the first command.
        assert_eq!(&init.buffer[..], b"GET");
        let outbound = text.init_outbound(&connection).unwrap().unwrap();
        assert!(outbound.prefix.is_empty());
    }

    #[test]
    fn test_client_mode_speaks_first() {
        let initializer = ProtocolInitializer::new(RecordingDispatcher::new(), MAX_FRAME);
        let (connection, _io, _peer) = detached_connection(true);
        assert!(initializer.is_outbound_ready(&connection));
        let outbound = initializer.init_outbound(&connection).unwrap().unwrap();
        assert_eq!(outbound.prefix, Bytes::from_static(CLUSTER));
    }

    #[test]
    fn test_text_protocol_round_trip() {
        let commands = EchoTextHandler::new();
        let initializer = ProtocolInitializer::new(RecordingDispatcher::new(), MAX_FRAME)
            .with_text_handler(commands.clone());
        let (server, address) = start_manager(Arc::new(initializer), 1);
        let mut socket = raw_connect(&server, address);

        socket.write_all(b"GET /health\r\nSTATS\n").unwrap();
        let mut reader = BufReader::new(socket.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "OK GET /health\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "OK STATS\n");

        assert_eq!(commands.commands(), vec!["GET /health".to_string(), "STATS".to_string()]);
        let connection = server.connections().pop().unwrap();
        assert_eq!(connection.attributes().get::<Protocol>(PROTOCOL), Some(Protocol::Text));
    }

    #[test]
    fn test_client_binary_protocol() {
        let messages = RecordingClientHandler::new();
        let initializer = ProtocolInitializer::new(RecordingDispatcher::new(), MAX_FRAME)
            .with_client_handler(messages.clone());
        let (server, address) = start_manager(Arc::new(initializer), 1);
        let mut socket = raw_connect(&server, address);

        let mut wire = CLIENT_BINARY.to_vec();
        for message in [&b"ping"[..], &b"pong!"[..]] {
            wire.extend_from_slice(&(message.len() as u32).to_le_bytes());
            wire.extend_from_slice(message);
        }
        // Split inside the second length prefix.
        socket.write_all(&wire[..10]).unwrap();
        thread::sleep(Duration::from_millis(20));
        socket.write_all(&wire[10..]).unwrap();

        TestAssertions::assert_eventually(|| messages.messages().len() == 2, WAIT, "messages should arrive");
        assert_eq!(
            messages.messages(),
            vec![Bytes::from_static(b"ping"), Bytes::from_static(b"pong!")]
        );
    }

    #[test]
    fn test_unknown_protocol_closes_connection() {
        let (server, address) = cluster_manager(RecordingDispatcher::new(), 1);
        let listener = Arc::new(RecordingListener::default());
        server.add_listener(listener.clone());
        let mut socket = raw_connect(&server, address);

        socket.write_all(b"XYZ").unwrap();
        let mut buf = [0u8; 8];
        match socket.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0, "server should not answer an unknown protocol"),
            Err(e) => assert_ne!(e.kind(), std::io::ErrorKind::WouldBlock, "server did not close"),
        }

        TestAssertions::assert_eventually(|| server.connection_count() == 0, WAIT, "connection should be dropped");
        assert_eq!(listener.added.lock().len(), 1);
        let closed = listener.closed.lock().clone();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].1, "read failed");
    }

    #[test]
    fn test_peer_close_notifies_listener() {
        let (server, address) = cluster_manager(RecordingDispatcher::new(), 1);
        let listener = Arc::new(RecordingListener::default());
        server.add_listener(listener.clone());
        let (client, _) = cluster_manager(RecordingDispatcher::new(), 1);

        let connection = client.connect(address).unwrap();
        TestAssertions::assert_eventually(|| server.connection_count() == 1, WAIT, "server should accept");
        connection.close("test finished", None);
        assert!(!connection.is_alive());
        assert!(!connection.write_packet(sequenced(0, 0)));
        assert_eq!(client.connection_count(), 0);

        TestAssertions::assert_eventually(|| server.connection_count() == 0, WAIT, "server should notice EOF");
        assert_eq!(listener.closed.lock()[0].1, "connection closed by peer");

        assert!(client.shutdown());
        assert!(matches!(client.connect(address), Err(Error::Shutdown)));
    }

    #[test]
    fn test_urgent_frames_and_responses() {
        let received = RecordingDispatcher::new();
        let (server, address) = cluster_manager(received.clone(), 1);
        let (client, _) = cluster_manager(RecordingDispatcher::new(), 1);
        let connection = client.connect(address).unwrap();

        connection.write_packet(Packet::operation(&b"normal"[..], 1));
        connection.write_packet(Packet::operation(&b"urgent"[..], 1).urgent());
        connection.write_packet(Packet::response(&b"r1"[..]));
        connection.write_packet(Packet::response(&b"r2"[..]));

        TestAssertions::assert_eventually(
            || received.packet_count() == 2 && received.responses().len() == 2,
            WAIT,
            "frames should arrive",
        );
        let responses: Vec<_> = received.responses().iter().map(|p| p.payload().clone()).collect();
        assert_eq!(responses, vec![Bytes::from_static(b"r1"), Bytes::from_static(b"r2")]);

        let accepted = server.connections().pop().unwrap();
        assert_eq!(accepted.stats().priority_frames_read.get(), 1);
        assert_eq!(accepted.stats().normal_frames_read.get(), 3);
    }

    #[test]
    fn test_rebalance_migrates_live_reader() {
        let received = RecordingDispatcher::new();
        let (server, address) = cluster_manager(received.clone(), 2);
        let (client, _) = cluster_manager(RecordingDispatcher::new(), 1);

        // Readers land on input threads 0, 1, 0 in accept order.
        let mut connections = Vec::new();
        for expected in 1..=3 {
            connections.push(client.connect(address).unwrap());
            TestAssertions::assert_eventually(
                || server.connection_count() == expected,
                WAIT,
                "server should accept in order",
            );
        }
        let inputs = server.input_threads().to_vec();
        let readers_on = |thread: usize| {
            server
                .connections()
                .iter()
                .filter(|c| c.reader_handler().owner() == inputs[thread])
                .count()
        };
        assert_eq!(readers_on(0), 2);
        assert_eq!(readers_on(1), 1);

        let mut sent = 0;
        for round in 0..40u32 {
            for i in 0..5 {
                connections[0].write_packet(sequenced(0, round * 5 + i));
                sent += 1;
            }
            thread::sleep(Duration::from_millis(2));
        }
        connections[2].write_packet(sequenced(2, 0));
        sent += 1;
        TestAssertions::assert_eventually(|| received.packet_count() == sent, WAIT, "traffic should arrive");

        assert_eq!(server.rebalance(), 1);
        TestAssertions::assert_eventually(|| readers_on(1) == 2, WAIT, "one reader should move");
        assert_eq!(readers_on(0), 1);

        // Every connection keeps working after the move.
        for (stream, connection) in connections.iter().enumerate() {
            for seq in 1..=50 {
                connection.write_packet(sequenced(stream as u8, 1000 + seq));
                sent += 1;
            }
        }
        TestAssertions::assert_eventually(
            || received.packet_count() == sent,
            WAIT,
            "traffic after migration should arrive",
        );
        let mut per_stream: BTreeMap<u8, Vec<u32>> = BTreeMap::new();
        for packet in received.packets() {
            let (stream, seq) = parse_sequenced(&packet);
            per_stream.entry(stream).or_default().push(seq);
        }
        for seqs in per_stream.values() {
            assert!(seqs.windows(2).all(|w| w[0] < w[1]), "frames reordered: {seqs:?}");
        }
        assert_eq!(server.io_metrics().len(), 3);
    }

    struct ProbeHandler {
        probe: Arc<OverlapProbe>,
    }

    impl OperationHandler for ProbeHandler {
        fn decode(&self, packet: &Packet) -> Result<Box<dyn Operation>> {
            Ok(Box::new(ProbeOperation::new(packet.partition_id(), self.probe.clone())))
        }
    }

    #[derive(Default)]
    struct CollectingResponses {
        responses: Mutex<Vec<Bytes>>,
    }

    impl ResponseHandler for CollectingResponses {
        fn on_responses(&self, responses: Vec<Packet>) {
            self.responses
                .lock()
                .extend(responses.into_iter().map(|p| p.payload().clone()));
        }
    }

    #[test]
    fn test_packets_flow_into_executor() {
        init_tracing();
        let probe = OverlapProbe::new(8);
        let config = crate::config::ExecutorConfig::new()
            .with_partition_count(8)
            .with_partition_threads(2)
            .with_generic_threads(2);
        let executor = Arc::new(
            OperationExecutor::with_handler(config, Arc::new(ProbeHandler { probe: probe.clone() })).unwrap(),
        );
        executor.start().unwrap();
        let responses = Arc::new(CollectingResponses::default());
        let dispatcher: Arc<dyn PacketDispatcher> =
            Arc::new(ExecutorPacketDispatcher::new(executor.clone(), responses.clone()));
        let (server, address) = start_manager(Arc::new(ProtocolInitializer::new(dispatcher, MAX_FRAME)), 1);
        let (client, _) = cluster_manager(RecordingDispatcher::new(), 1);
        let connection = client.connect(address).unwrap();

        for pid in 0..8 {
            connection.write_packet(Packet::operation(&b"op"[..], pid));
        }
        connection.write_packet(Packet::response(&b"done"[..]));

        TestAssertions::assert_eventually(|| probe.executions() == 8, WAIT, "decoded operations should run");
        TestAssertions::assert_eventually(
            || responses.responses.lock().len() == 1,
            WAIT,
            "response should bypass the executor",
        );
        assert_eq!(probe.violations(), 0);
        assert_eq!(executor.metrics().error_count, 0);

        assert!(client.shutdown());
        assert!(server.shutdown());
        assert!(executor.shutdown());
    }
}
