//! The connection-level transport: listener, protocol sniffing, TLS and
//! graceful shutdown, multiplexed by the [`Gateway`].

mod gateway;
pub(crate) mod sniff;
mod tls;

pub use gateway::Gateway;
pub use tls::{Certificate, Identity};
