// Federation sender service: replication in, signed transactions out.
pub mod config;
pub mod devices;
pub mod events;
pub mod http;
pub mod observability;
pub mod presence;
pub mod replication;
pub mod sender;
