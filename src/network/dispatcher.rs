//! Where decoded frames go.

use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::executor::{OperationExecutor, Task};
use crate::network::connection::Connection;
use crate::network::Packet;

/// Receives member packets decoded by the I/O threads.
///
/// Called on an I/O thread: implementations must hand the packet off, not
/// execute it.
pub trait PacketDispatcher: Send + Sync {
    fn dispatch(&self, packet: Packet) -> Result<()>;

    /// Responses decoded from one read, in wire order.
    fn dispatch_responses(&self, responses: Vec<Packet>) -> Result<()> {
        for response in responses {
            self.dispatch(response)?;
        }
        Ok(())
    }
}

/// Completes invocations waiting on responses.
pub trait ResponseHandler: Send + Sync {
    fn on_responses(&self, responses: Vec<Packet>);
}

/// Receives length-prefixed binary client messages.
pub trait ClientMessageHandler: Send + Sync {
    fn on_message(&self, connection: &Arc<Connection>, message: Bytes) -> Result<()>;
}

/// Receives text protocol command lines, without the line terminator.
pub trait TextCommandHandler: Send + Sync {
    fn on_command(&self, connection: &Arc<Connection>, command: String) -> Result<()>;
}

/// Routes member packets into the operation executor.
///
/// Responses bypass the executor queues and go to the response handler.
pub struct ExecutorPacketDispatcher {
    executor: Arc<OperationExecutor>,
    responses: Arc<dyn ResponseHandler>,
}

impl ExecutorPacketDispatcher {
    pub fn new(executor: Arc<OperationExecutor>, responses: Arc<dyn ResponseHandler>) -> Self {
        Self {
            executor,
            responses,
        }
    }
}

impl PacketDispatcher for ExecutorPacketDispatcher {
    fn dispatch(&self, packet: Packet) -> Result<()> {
        if packet.is_response() {
            self.responses.on_responses(vec![packet]);
            return Ok(());
        }
        self.executor.execute(Task::Packet(packet))
    }

    fn dispatch_responses(&self, responses: Vec<Packet>) -> Result<()> {
        debug_assert!(responses.iter().all(Packet::is_response));
        self.responses.on_responses(responses);
        Ok(())
    }
}

/// Drops responses. Useful for members that never issue remote calls.
#[derive(Debug, Default)]
pub struct DiscardingResponseHandler;

impl ResponseHandler for DiscardingResponseHandler {
    fn on_responses(&self, responses: Vec<Packet>) {
        debug!(count = responses.len(), "discarding responses");
    }
}
