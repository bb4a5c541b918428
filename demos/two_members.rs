//! Two members on loopback: one sends container writes, the other executes
//! them on its partition threads and then hands a partition to a third
//! service instance.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example two_members

use gridcore::executor::{Operation, OperationExecutor, OperationHandler};
use gridcore::network::{DiscardingResponseHandler, ExecutorPacketDispatcher};
use gridcore::replication::{
    migrate_partition, MigrationEndpoint, PartitionMigrationEvent, PutOperation,
    ReplicatedContainerService,
};
use gridcore::{
    ConnectionManager, ExecutorConfig, NetworkConfig, Packet, ProtocolInitializer,
};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const PARTITIONS: usize = 31;

/// Decodes `(container, value)` payloads into puts.
struct ContainerHandler {
    service: Arc<ReplicatedContainerService>,
}

impl OperationHandler for ContainerHandler {
    fn decode(&self, packet: &Packet) -> gridcore::Result<Box<dyn Operation>> {
        let (container, value): (String, Vec<u8>) = bincode::deserialize(packet.payload())?;
        Ok(Box::new(PutOperation::new(self.service.clone(), container, value)))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let service = ReplicatedContainerService::new("containers", "member-b", PARTITIONS);
    let executor = Arc::new(OperationExecutor::with_handler(
        ExecutorConfig::new()
            .with_partition_count(PARTITIONS)
            .with_partition_threads(4)
            .with_generic_threads(2),
        Arc::new(ContainerHandler {
            service: service.clone(),
        }),
    )?);
    executor.start()?;

    let loopback = SocketAddr::from(([127, 0, 0, 1], 0));
    let dispatcher = Arc::new(ExecutorPacketDispatcher::new(
        executor.clone(),
        Arc::new(DiscardingResponseHandler),
    ));
    let member_b = ConnectionManager::new(
        NetworkConfig::new(loopback).with_input_threads(2),
        Arc::new(ProtocolInitializer::new(dispatcher, 16 * 1024 * 1024)),
    )?;
    let address = member_b.start()?;

    let member_a = ConnectionManager::new(
        NetworkConfig::new(loopback),
        Arc::new(ProtocolInitializer::new(
            Arc::new(ExecutorPacketDispatcher::new(
                executor.clone(),
                Arc::new(DiscardingResponseHandler),
            )),
            16 * 1024 * 1024,
        )),
    )?;
    member_a.start()?;
    let connection = member_a.connect(address)?;

    let writes = 1_000;
    for i in 0..writes {
        let container = format!("counter-{}", i % 100);
        let partition_id = service.partition_of(&container);
        let payload = bincode::serialize(&(container, format!("{i}").into_bytes()))?;
        connection.write_packet(Packet::operation(payload, partition_id));
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while executor.metrics().completed_count < writes && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let metrics = executor.metrics();
    info!(
        completed = metrics.completed_count,
        errors = metrics.error_count,
        containers = service.len(),
        "writes executed"
    );

    // Move the busiest partition to a fresh member.
    let partition_id = (0..PARTITIONS as i32)
        .max_by_key(|pid| service.containers_in(*pid).len())
        .unwrap_or(0);
    let newcomer = ReplicatedContainerService::new("containers", "member-c", PARTITIONS);
    let event = PartitionMigrationEvent::new(MigrationEndpoint::Source, partition_id, 0, -1);
    let outcome = migrate_partition(
        &executor,
        service.clone(),
        newcomer.clone(),
        event,
        0,
        Duration::from_secs(5),
    )?;
    if outcome.committed {
        info!(
            partition_id,
            entries = outcome.entries,
            remaining = service.containers_in(partition_id).len(),
            moved = newcomer.containers_in(partition_id).len(),
            "partition migrated"
        );
    } else {
        warn!(partition_id, "migration rolled back");
    }

    for io in member_b.io_metrics() {
        info!(thread = %io.name, events = io.event_count, handlers = io.handler_count, "I/O thread");
    }

    member_a.shutdown();
    member_b.shutdown();
    executor.shutdown();
    Ok(())
}
