//! Membership core for the beach-harbor chat collector.
//!
//! Three actors connected by bounded queues:
//! - [`classifier`] turns upstream lines into exported events and membership
//!   signals for the local account;
//! - [`desired`] owns the durable set of rooms the account should be in;
//! - [`rectifier`] issues rate-limited JOIN/PART commands until actual
//!   membership matches that set.

pub mod classifier;
pub mod command;
pub mod desired;
pub mod error;
pub mod event;
pub mod line;
pub mod persist;
pub mod rate_limit;
pub mod rectifier;
pub mod room;

pub use classifier::{run_classifier, Classified, Classifier, SkipReason};
pub use command::OutboundCommand;
pub use desired::{
    DesiredHandle, DesiredSnapshot, DesiredStore, Intent, IntentSubmitter, StoreConfig,
    SubmitError,
};
pub use error::PipelineError;
pub use event::{ChatMessage, MembershipChange, MembershipOp, TypedEvent};
pub use line::{ParseError, ParsedLine};
pub use persist::StoreError;
pub use rate_limit::TokenBucket;
pub use rectifier::{Rectifier, RectifierConfig, RectifierError, RoomPhase, RoomState};
pub use room::RoomName;
