//! Operations and handlers that record what happened to them.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::executor::{CallContext, Operation};
use crate::network::{ClientMessageHandler, Connection, Packet, PacketDispatcher, TextCommandHandler};
use crate::types::{CallId, PartitionId, Response};

/// Detects two threads executing in the same partition at once.
pub struct OverlapProbe {
    occupancy: Box<[AtomicUsize]>,
    violations: AtomicUsize,
    executions: AtomicU64,
    threads: Mutex<BTreeMap<PartitionId, BTreeSet<String>>>,
}

impl OverlapProbe {
    pub fn new(partition_count: usize) -> Arc<Self> {
        Arc::new(Self {
            occupancy: (0..partition_count).map(|_| AtomicUsize::new(0)).collect(),
            violations: AtomicUsize::new(0),
            executions: AtomicU64::new(0),
            threads: Mutex::new(BTreeMap::new()),
        })
    }

    /// Mark the partition occupied until the guard drops.
    pub fn enter(&self, partition_id: PartitionId) -> ProbeGuard<'_> {
        let slot = &self.occupancy[partition_id as usize];
        if slot.fetch_add(1, Ordering::SeqCst) != 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        let name = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        self.threads.lock().entry(partition_id).or_default().insert(name);
        ProbeGuard { probe: self, slot }
    }

    /// Times a partition was entered while already occupied.
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Names of the threads that executed each partition.
    pub fn threads_by_partition(&self) -> BTreeMap<PartitionId, BTreeSet<String>> {
        self.threads.lock().clone()
    }
}

pub struct ProbeGuard<'a> {
    probe: &'a OverlapProbe,
    slot: &'a AtomicUsize,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.slot.fetch_sub(1, Ordering::SeqCst);
        self.probe.executions.fetch_add(1, Ordering::SeqCst);
    }
}

/// Occupies its partition in an [`OverlapProbe`] for `hold`.
pub struct ProbeOperation {
    partition_id: PartitionId,
    probe: Arc<OverlapProbe>,
    hold: Duration,
    urgent: bool,
    tag: u64,
    log: Option<Arc<Mutex<Vec<u64>>>>,
}

impl ProbeOperation {
    pub fn new(partition_id: PartitionId, probe: Arc<OverlapProbe>) -> Self {
        Self {
            partition_id,
            probe,
            hold: Duration::ZERO,
            urgent: false,
            tag: 0,
            log: None,
        }
    }

    pub fn hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    /// Append `tag` to `log` when executed.
    pub fn logged(mut self, tag: u64, log: Arc<Mutex<Vec<u64>>>) -> Self {
        self.tag = tag;
        self.log = Some(log);
        self
    }
}

impl fmt::Debug for ProbeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeOperation")
            .field("partition_id", &self.partition_id)
            .field("urgent", &self.urgent)
            .field("tag", &self.tag)
            .finish()
    }
}

impl Operation for ProbeOperation {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn is_urgent(&self) -> bool {
        self.urgent
    }

    fn service_name(&self) -> &str {
        "probe"
    }

    fn run(self: Box<Self>, _ctx: &CallContext<'_>) -> Result<Response> {
        let _occupied = self.probe.enter(self.partition_id);
        if !self.hold.is_zero() {
            std::thread::sleep(self.hold);
        }
        if let Some(log) = &self.log {
            log.lock().push(self.tag);
        }
        Ok(Response::value(self.tag.to_be_bytes().to_vec()))
    }
}

type OperationFn = Box<dyn FnOnce(&CallContext<'_>) -> Result<Response> + Send>;

/// An operation running an arbitrary closure.
pub struct FnOperation {
    partition_id: PartitionId,
    f: OperationFn,
    urgent: bool,
    backup: bool,
    call_id: CallId,
    caller: Option<SocketAddr>,
}

impl FnOperation {
    pub fn new<F>(partition_id: PartitionId, f: F) -> Self
    where
        F: FnOnce(&CallContext<'_>) -> Result<Response> + Send + 'static,
    {
        Self {
            partition_id,
            f: Box::new(f),
            urgent: false,
            backup: false,
            call_id: 0,
            caller: None,
        }
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn backup(mut self) -> Self {
        self.backup = true;
        self
    }

    pub fn with_call(mut self, call_id: CallId, caller: SocketAddr) -> Self {
        self.call_id = call_id;
        self.caller = Some(caller);
        self
    }
}

impl fmt::Debug for FnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("partition_id", &self.partition_id)
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

impl Operation for FnOperation {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn is_urgent(&self) -> bool {
        self.urgent
    }

    fn is_backup(&self) -> bool {
        self.backup
    }

    fn call_id(&self) -> CallId {
        self.call_id
    }

    fn caller(&self) -> Option<SocketAddr> {
        self.caller
    }

    fn run(self: Box<Self>, ctx: &CallContext<'_>) -> Result<Response> {
        (self.f)(ctx)
    }
}

/// Keeps every packet it is handed, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    packets: Mutex<Vec<Packet>>,
    responses: Mutex<Vec<Packet>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.packets.lock().clone()
    }

    pub fn packet_count(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn responses(&self) -> Vec<Packet> {
        self.responses.lock().clone()
    }
}

impl PacketDispatcher for RecordingDispatcher {
    fn dispatch(&self, packet: Packet) -> Result<()> {
        self.packets.lock().push(packet);
        Ok(())
    }

    fn dispatch_responses(&self, responses: Vec<Packet>) -> Result<()> {
        self.responses.lock().extend(responses);
        Ok(())
    }
}

/// Keeps every binary client message.
#[derive(Debug, Default)]
pub struct RecordingClientHandler {
    messages: Mutex<Vec<Bytes>>,
}

impl RecordingClientHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<Bytes> {
        self.messages.lock().clone()
    }
}

impl ClientMessageHandler for RecordingClientHandler {
    fn on_message(&self, _connection: &Arc<Connection>, message: Bytes) -> Result<()> {
        self.messages.lock().push(message);
        Ok(())
    }
}

/// Records text commands and answers each with `OK <command>\n`.
#[derive(Debug, Default)]
pub struct EchoTextHandler {
    commands: Mutex<Vec<String>>,
}

impl EchoTextHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

impl TextCommandHandler for EchoTextHandler {
    fn on_command(&self, connection: &Arc<Connection>, command: String) -> Result<()> {
        connection.write(Bytes::from(format!("OK {command}\n")));
        self.commands.lock().push(command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_counts_overlap() {
        let probe = OverlapProbe::new(4);
        {
            let _a = probe.enter(1);
            let _b = probe.enter(1);
            let _c = probe.enter(2);
        }
        assert_eq!(probe.violations(), 1);
        assert_eq!(probe.executions(), 3);
        let _again = probe.enter(1);
        assert_eq!(probe.violations(), 1);
    }
}
