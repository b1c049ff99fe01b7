pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod workflow;

pub use audit::{AuditContext, AuditEvent, AuditSink, InMemoryAuditSink, NoopAuditSink};
pub use config::{AppConfig, ConfigError, LoadOptions};
pub use domain::approval::{ApprovalRecord, Decision, Stage};
pub use domain::quote::{QuoteId, QuoteUpload, SelectedQuote, SelectionMethod, VendorQuote};
pub use domain::request::{
    Currency, NewRequest, ProjectDetails, Request, RequestCode, RequestId, RequestItem,
    RequestState, RequestType,
};
pub use domain::user::{Actor, NewUser, Role, User, UserId};
pub use errors::{
    ApplicationError, DomainError, ErrorEnvelope, FieldIssue, Recovery, ValidationError,
};
pub use gateway::{QuoteUploadBody, RequestGateway, SubmitBody};
pub use workflow::{
    ActionPayload, Applied, DecisionInput, DecisionKind, FundsTransferInput, Permissions,
    ProjectRouting, QuoteChoice, QuoteSelectionInput, WorkflowAction, WorkflowEngine,
    WorkflowPolicy,
};
