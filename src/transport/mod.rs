//! Transport layer for P2P messaging.
//!
//! This module moves envelopes between engines: length-prefixed framing,
//! the inbound dispatcher with its replay guard, and the outbound connection
//! pool and batch sender.

pub mod batch;
pub mod dispatcher;
pub mod pool;
pub mod protocol;
pub mod replay;

pub use batch::BatchSender;
pub use dispatcher::{Dispatcher, DispatcherStats, InboundHandler};
pub use pool::{ConnectionPool, PooledConnection};
pub use protocol::{read_frame, write_frame};
pub use replay::ReplayGuard;
