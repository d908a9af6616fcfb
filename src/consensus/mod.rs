pub mod availability;
pub mod committee;
pub mod data;
pub mod message;
pub mod persist;
pub mod processor;
pub mod qc;
pub mod store;

pub use availability::AvailabilityState;
pub use committee::{Committee, Quorums};
pub use data::DataState;
pub use message::*;
pub use processor::{ConsensusMessage, ConsensusState, PersistedInner};
pub use qc::*;
