// Replication client: a line-oriented TCP subscriber that demultiplexes
// the upstream homeserver's logical streams.
mod client;
mod registry;

pub use client::{ConnectionState, ReplicationClient, ReplicationConfig, StreamSubscription};
pub use registry::{RawUpdate, StreamRegistry, StreamUpdate};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("replication socket error")]
    Io(#[from] std::io::Error),
    #[error("replication protocol error")]
    Protocol(#[from] fedrelay_wire::Error),
    #[error("replication server reported an error: {0}")]
    Remote(String),
    #[error("replication connection closed by server")]
    ConnectionClosed,
}
