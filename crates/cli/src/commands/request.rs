use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Args, Subcommand};
use rust_decimal::Decimal;
use serde_json::json;

use procura_client::{DecisionForm, HttpGateway, InMemoryNoticeSink, ReviewSession, SessionError};
use procura_core::domain::quote::{QuoteId, QuoteUpload};
use procura_core::domain::request::{
    Currency, NewRequest, ProjectDetails, Request, RequestId, RequestItem, RequestType,
};
use procura_core::domain::user::UserId;
use procura_core::errors::{ApplicationError, DomainError, Recovery};
use procura_core::gateway::RequestGateway;
use procura_core::workflow::{QuoteSelectionInput, WorkflowEngine};

use crate::commands::{prepare, CommandResult};

#[derive(Debug, Args)]
pub struct RequestArgs {
    /// User id to act as; the role is resolved by the backend.
    #[arg(long = "as", value_name = "USER_ID")]
    pub actor: i64,
    #[command(subcommand)]
    pub command: RequestCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum RequestCommand {
    #[command(about = "Create a draft request owned by the actor")]
    Create(CreateArgs),
    #[command(about = "Show a request with its quotes and approval history")]
    Show { id: i64 },
    #[command(about = "List requests waiting on the actor's decision")]
    Pending,
    #[command(about = "List requests raised by the actor")]
    Mine,
    #[command(about = "Submit a draft for approval")]
    Submit { id: i64 },
    #[command(about = "Approve the stage the request is waiting on")]
    Approve {
        id: i64,
        #[arg(long)]
        comment: Option<String>,
        #[arg(long, help = "Payout channel, recorded at final approval")]
        payout_channel: Option<String>,
        #[arg(long, help = "Quote to select inline when approving as accountant")]
        quote_id: Option<String>,
    },
    #[command(about = "Reject the stage the request is waiting on")]
    Reject {
        id: i64,
        #[arg(long)]
        comment: String,
    },
    #[command(about = "Attach a vendor quote")]
    UploadQuote {
        id: i64,
        #[arg(long)]
        vendor: String,
        #[arg(long)]
        total: Decimal,
        #[arg(long)]
        file_url: String,
        #[arg(long)]
        notes: Option<String>,
    },
    #[command(about = "Select a quote by id, or the lowest bid")]
    SelectQuote {
        id: i64,
        #[arg(long, conflicts_with = "lowest", required_unless_present = "lowest")]
        quote_id: Option<String>,
        #[arg(long)]
        lowest: bool,
    },
    #[command(about = "Record the funds transfer for a final-approved request")]
    Transfer {
        id: i64,
        #[arg(long)]
        reference: String,
    },
}

/// Fields of a new draft. Project fields are only sent for project requests
/// or when given explicitly, so validation can flag misuse.
#[derive(Debug, Clone, Args)]
pub struct CreateArgs {
    #[arg(long = "type", value_parser = parse_request_type, default_value = "purchase")]
    pub request_type: RequestType,
    #[arg(long)]
    pub title: String,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long, help = "Desired cost of the whole request")]
    pub cost: Decimal,
    #[arg(long, value_parser = parse_currency, default_value = "USD")]
    pub currency: Currency,
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub needed_by: Option<NaiveDate>,
    #[arg(
        long = "item",
        value_name = "NAME:QTY:UNIT_PRICE",
        value_parser = parse_item,
        help = "Purchase line item; repeat for several"
    )]
    pub items: Vec<RequestItem>,
    #[arg(long)]
    pub client_name: Option<String>,
    #[arg(long)]
    pub project_description: Option<String>,
    #[arg(long)]
    pub total_cost: Option<Decimal>,
    #[arg(long)]
    pub total_benefit: Option<Decimal>,
    #[arg(long)]
    pub total_price: Option<Decimal>,
}

impl CreateArgs {
    pub fn into_draft(self) -> NewRequest {
        let project = ProjectDetails {
            client_name: self.client_name,
            project_description: self.project_description,
            total_cost: self.total_cost,
            total_benefit: self.total_benefit,
            total_price: self.total_price,
        };
        let send_project =
            self.request_type == RequestType::Project || project != ProjectDetails::default();
        NewRequest {
            request_type: self.request_type,
            title: self.title,
            description: self.description,
            desired_cost: self.cost,
            currency: self.currency,
            needed_by_date: self.needed_by,
            items: self.items,
            project: send_project.then_some(project),
        }
    }
}

fn parse_request_type(raw: &str) -> Result<RequestType, String> {
    RequestType::parse(raw).ok_or_else(|| format!("unknown request type `{raw}`"))
}

fn parse_currency(raw: &str) -> Result<Currency, String> {
    Currency::parse(raw).ok_or_else(|| format!("unsupported currency `{raw}`"))
}

/// `NAME:QTY:UNIT_PRICE`, split from the right so names may contain colons.
fn parse_item(raw: &str) -> Result<RequestItem, String> {
    let mut parts = raw.rsplitn(3, ':');
    let (Some(price), Some(quantity), Some(name)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected NAME:QTY:UNIT_PRICE, got `{raw}`"));
    };
    Ok(RequestItem {
        name: name.to_string(),
        quantity: quantity
            .trim()
            .parse()
            .map_err(|_| format!("quantity `{quantity}` is not a whole number"))?,
        unit_price: price
            .trim()
            .parse()
            .map_err(|_| format!("unit price `{price}` is not a decimal"))?,
    })
}

impl RequestCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "request.create",
            Self::Show { .. } => "request.show",
            Self::Pending => "request.pending",
            Self::Mine => "request.mine",
            Self::Submit { .. } => "request.submit",
            Self::Approve { .. } => "request.approve",
            Self::Reject { .. } => "request.reject",
            Self::UploadQuote { .. } => "request.upload_quote",
            Self::SelectQuote { .. } => "request.select_quote",
            Self::Transfer { .. } => "request.transfer",
        }
    }
}

pub fn run(args: RequestArgs) -> CommandResult {
    let name = args.command.name();
    let (config, runtime) = match prepare(name) {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let gateway = match HttpGateway::new(&config.backend) {
        Ok(gateway) => gateway,
        Err(error) => return application_failure(name, &error, Vec::new()),
    };
    let engine = WorkflowEngine::new(config.workflow.policy());

    runtime.block_on(execute(Arc::new(gateway), engine, UserId(args.actor), args.command))
}

/// Runs one request command against any gateway.
pub async fn execute(
    gateway: Arc<dyn RequestGateway>,
    engine: WorkflowEngine,
    actor_id: UserId,
    command: RequestCommand,
) -> CommandResult {
    let name = command.name();
    let actor = match gateway.current_user(actor_id).await {
        Ok(user) => user.actor(),
        Err(error) => return application_failure(name, &error, Vec::new()),
    };

    let notices = InMemoryNoticeSink::default();
    let session = ReviewSession::new(gateway.clone(), actor, engine, Arc::new(notices.clone()));

    let result = match command {
        RequestCommand::Create(args) => {
            gateway.create_draft(&actor, args.into_draft()).await.map_err(SessionError::Rejected)
        }
        RequestCommand::Pending => {
            return listing(name, gateway.list_pending_approvals(&actor).await);
        }
        RequestCommand::Mine => return listing(name, gateway.list_my_requests(&actor).await),
        RequestCommand::Show { id } => session.open(RequestId(id)).await,
        RequestCommand::Submit { id } => match session.open(RequestId(id)).await {
            Ok(_) => session.submit().await,
            Err(error) => Err(error),
        },
        RequestCommand::Approve { id, comment, payout_channel, quote_id } => {
            let mut form = DecisionForm::approve();
            form.comment = comment.unwrap_or_default();
            form.payout_channel = payout_channel.unwrap_or_default();
            form.quote_id = quote_id.map(QuoteId);
            decide(&session, RequestId(id), form).await
        }
        RequestCommand::Reject { id, comment } => {
            decide(&session, RequestId(id), DecisionForm::reject(comment)).await
        }
        RequestCommand::UploadQuote { id, vendor, total, file_url, notes } => {
            let upload = QuoteUpload { vendor_name: vendor, quote_total: total, file_url, notes };
            match session.open(RequestId(id)).await {
                Ok(_) => session.upload_quote(upload).await,
                Err(error) => Err(error),
            }
        }
        RequestCommand::SelectQuote { id, quote_id, lowest } => {
            let input = match quote_id {
                Some(quote_id) if !lowest => QuoteSelectionInput::manual(QuoteId(quote_id)),
                _ => QuoteSelectionInput::lowest_bid(),
            };
            match session.open(RequestId(id)).await {
                Ok(_) => session.select_quote(input).await,
                Err(error) => Err(error),
            }
        }
        RequestCommand::Transfer { id, reference } => match session.open(RequestId(id)).await {
            Ok(_) => session.transfer_funds(&reference).await,
            Err(error) => Err(error),
        },
    };

    let messages = notices.notices().into_iter().map(|notice| notice.message).collect::<Vec<_>>();
    match result {
        Ok(request) => {
            let message = format!("{} is {}", request.display_code(), request.state);
            CommandResult::success_with(
                name,
                message,
                Some(json!({ "request": request, "notices": messages })),
            )
        }
        // A conflict leaves the session holding the winner's version; report it.
        Err(SessionError::Rejected(error)) if error.is_conflict() => {
            let current = session.current().await;
            CommandResult::failure_with(
                name,
                error_class(&error),
                error.to_string(),
                exit_code(&error),
                Some(json!({ "request": current, "notices": messages })),
            )
        }
        Err(SessionError::Rejected(error)) => application_failure(name, &error, messages),
        Err(error) => CommandResult::failure(name, "session", error.to_string(), 1),
    }
}

async fn decide(
    session: &ReviewSession,
    id: RequestId,
    mut form: DecisionForm,
) -> Result<Request, SessionError> {
    session.open(id).await?;
    session.decide(&mut form).await
}

fn listing(name: &str, result: Result<Vec<Request>, ApplicationError>) -> CommandResult {
    match result {
        Ok(requests) => {
            let summary = requests
                .iter()
                .map(|request| {
                    json!({
                        "id": request.id,
                        "code": request.display_code(),
                        "title": request.title,
                        "state": request.state,
                        "version": request.version,
                    })
                })
                .collect::<Vec<_>>();
            CommandResult::success_with(
                name,
                format!("{} request(s)", requests.len()),
                Some(json!({ "requests": summary })),
            )
        }
        Err(error) => application_failure(name, &error, Vec::new()),
    }
}

fn application_failure(name: &str, error: &ApplicationError, notices: Vec<String>) -> CommandResult {
    let data = (!notices.is_empty()).then(|| json!({ "notices": notices }));
    CommandResult::failure_with(name, error_class(error), error.to_string(), exit_code(error), data)
}

pub fn error_class(error: &ApplicationError) -> &'static str {
    match error {
        ApplicationError::Domain(DomainError::Validation(_)) => "validation",
        ApplicationError::Domain(DomainError::ForbiddenTransition { .. }) => "forbidden_transition",
        ApplicationError::Domain(DomainError::InsufficientRole { .. }) => "insufficient_role",
        ApplicationError::Domain(DomainError::CommentRequired) => "comment_required",
        ApplicationError::Domain(DomainError::MustSelectQuoteFirst) => "must_select_quote_first",
        ApplicationError::Domain(DomainError::NoQuotesAvailable) => "no_quotes_available",
        ApplicationError::Domain(DomainError::UnknownQuote { .. }) => "unknown_quote",
        ApplicationError::AlreadyProcessed { .. } => "already_processed",
        ApplicationError::NotFound { .. } => "not_found",
        ApplicationError::Unauthenticated(_) => "unauthenticated",
        ApplicationError::Persistence(_) => "persistence",
        ApplicationError::Server(_) => "server",
        ApplicationError::Configuration(_) => "configuration",
    }
}

fn exit_code(error: &ApplicationError) -> u8 {
    match error.recovery() {
        Recovery::Retry => 4,
        Recovery::FixInput => 6,
        Recovery::None => 7,
        Recovery::Refresh => 8,
    }
}
