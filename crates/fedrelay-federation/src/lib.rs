// Federation data model and the outbound transaction queue.
//
// This crate owns everything between "a pump produced an item for a remote"
// and "the transport was asked to deliver a signed transaction": wire shapes
// for PDUs and EDUs, per-destination batching under the 50/100 caps,
// transaction-id minting, retry backoff, and the per-destination sender
// tasks bounded by a global semaphore.
mod backoff;
mod edu;
mod pdu;
mod queue;
mod transaction;

pub use backoff::{BackoffConfig, BackoffEntry, BackoffRegistry, FailureKind};
pub use edu::{
    format_presence_content, EduEvent, PresenceState, PresenceStatus, EDU_DEVICE_LIST_UPDATE,
    EDU_DIRECT_TO_DEVICE, EDU_PRESENCE, EDU_TYPING,
};
pub use pdu::{server_part, PduBody, PduEvent, PduV1, Signatures};
pub use queue::{
    FederationTransport, NoopSentHook, QueueConfig, SendError, SentHook, TransactionQueue,
};
pub use transaction::{
    unix_millis, Transaction, TransactionIdGenerator, MAX_EDUS_PER_TRANSACTION,
    MAX_PDUS_PER_TRANSACTION,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed stored event: {0}")]
    MalformedEvent(String),
}
