//! Core library for the trafcacc multipath accelerator.
//!
//! trafcacc carries ordered byte streams ("virtual connections") across many
//! parallel TCP and UDP links between a frontend and a backend. Data packets
//! are striped over the live links; control packets go out on every link and
//! the receiver drops the copies.
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! - `proto`: Wire packet format and commands
//! - `transport`: TCP framing, UDP datagrams and link halves
//! - `endpoint`: `proto://host:port-range` address lists
//! - `sequencer`: Per-connection ordering and duplicate suppression
//! - `queue`: Ordered payload queues between the sequencer and readers
//! - `upstream`: Physical links and the pool that selects among them
//! - `node`: Engine state shared by every link of one process
//! - `conn`: Virtual connections with read, write and close
//! - `dialer`: Frontend link management and connection opening
//! - `listener`: Backend link acceptance and connection accepting
//! - `control`: Role and engine configuration
//! - `accelerate`: TCP forwarder for either role
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use trafcacc_core::{parse_endpoints, Dialer, EngineConfig};
//!
//! let dialer = Dialer::new(EngineConfig::default());
//! dialer.setup(&parse_endpoints("tcp://10.0.0.2:41000-41003,udp://10.0.1.2:42000")?);
//! let conn = dialer.dial().await?;
//! conn.write(b"hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod accelerate;
pub mod conn;
pub mod control;
pub mod dialer;
pub mod endpoint;
pub mod listener;
pub mod node;
pub mod proto;
pub mod queue;
pub mod sequencer;
pub mod transport;
pub mod upstream;

pub use accelerate::accelerate;
pub use conn::{Conn, ConnError, ConnState};
pub use control::{BackendConfig, EngineConfig, FrontendConfig, Role};
pub use dialer::{DialError, Dialer};
pub use endpoint::{parse_endpoints, Endpoint};
pub use listener::{ListenError, Listener};
pub use proto::{Cmd, Packet, PacketHeader, ProtocolVersion};
