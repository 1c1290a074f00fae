pub mod entities;
pub mod errors;
pub mod events;
pub mod links;
pub mod ports;
pub mod repositories;
pub mod retry_policy;
pub mod state_machine;

pub use entities::*;
pub use errors::{ErrorClass, StageError};
pub use events::{Event, EventPayload};
pub use links::{detect_links, Link, LinkKind};
pub use ports::*;
pub use repositories::{IdentityRepository, ItemRepository};
pub use retry_policy::{decide, Escalation, RetryDecision};
pub use state_machine::{can_transition, FailureOutcome, ItemStateMachine, TransitionOutcome};
