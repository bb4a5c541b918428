//! Non-blocking TCP networking.
//!
//! ```text
//!            acceptor ──accept──┐          connect()
//!                               ▼              │
//!                    ConnectionManager ◀───────┘
//!                     │ round-robin │
//!          ┌──────────┘             └───────────┐
//!          ▼                                    ▼
//!   input I/O threads                    output I/O threads
//!   ChannelReader                        ChannelWriter ◀── WriteQueue ◀── Connection::write
//!      │ ProtocolInitializer                │ ProtocolInitializer
//!      ▼                                    ▼
//!   InboundHandler                       OutboundHandler
//!      │
//!      ▼
//!   PacketDispatcher ──▶ OperationExecutor
//! ```
//!
//! Every I/O thread drains its task queue before it selects, so work handed
//! to it from another thread is never stranded behind a blocking select.
//! Handlers move between threads only through the owning thread's task
//! queue, see [`HandlerShared::request_migration`].

mod balancer;
mod connection;
mod dispatcher;
mod handlers;
mod initializer;
mod io_thread;
mod manager;
mod packet;
mod reader;
mod writer;

pub use balancer::{IoBalancer, Migration};
pub use connection::{AttributeMap, Connection};
pub use dispatcher::{
    ClientMessageHandler, DiscardingResponseHandler, ExecutorPacketDispatcher, PacketDispatcher,
    ResponseHandler, TextCommandHandler,
};
pub use handlers::{
    ClientInboundHandler, InboundHandler, OutboundHandler, PacketInboundHandler,
    PacketOutboundHandler, StreamOutboundHandler, TextInboundHandler,
};
pub use initializer::{
    ChannelInitializer, InboundInit, OutboundInit, Protocol, ProtocolInitializer, CLIENT_BINARY,
    CLUSTER, PROTOCOL, PROTOCOL_BUFFER, PROTOCOL_LENGTH,
};
pub use io_thread::{
    HandlerRole, HandlerShared, IoTask, IoThreadConfig, IoThreadHandle, NonBlockingIoThread,
    SelectionHandler,
};
pub use manager::{ConnectionListener, ConnectionManager};
pub use packet::{flags, Packet, HEADER_SIZE, PACKET_VERSION};
pub use reader::ChannelReader;
pub use writer::{ChannelWriter, OutboundFrame, WriteQueue};
