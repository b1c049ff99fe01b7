pub mod engine;
pub mod policy;
pub mod selection;
pub mod states;

pub use engine::{record_outcome, Applied, WorkflowEngine};
pub use policy::{Permissions, ProjectRouting, WorkflowPolicy};
pub use selection::{lowest_bid, QuoteChoice};
pub use states::{
    ActionPayload, DecisionInput, DecisionKind, FundsTransferInput, QuoteSelectionInput,
    TransitionOutcome, WorkflowAction,
};
