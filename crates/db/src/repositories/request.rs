use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use procura_core::domain::approval::{ApprovalId, ApprovalRecord, Decision, Stage};
use procura_core::domain::quote::{QuoteId, SelectedQuote, SelectionMethod, VendorQuote};
use procura_core::domain::request::{
    Currency, NewRequest, ProjectDetails, Request, RequestCode, RequestId, RequestItem,
    RequestState, RequestType,
};
use procura_core::domain::user::UserId;

use super::{extends_history, RepositoryError, RequestRepository};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "id, code, request_type, title, description, desired_cost, currency,
    state, current_approver_id, requester_id, client_name, project_description, total_cost,
    total_benefit, total_price, selected_quote_id, selection_method, selected_by, selected_at,
    payout_channel, payout_reference, needed_by_date, created_at, state_changed_at,
    funds_transferred_at, state_version";

pub struct SqlRequestRepository {
    pool: DbPool,
}

impl SqlRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn hydrate(&self, mut request: Request) -> Result<Request, RepositoryError> {
        request.items = sqlx::query(
            "SELECT name, quantity, unit_price FROM request_item
             WHERE request_id = ? ORDER BY position",
        )
        .bind(request.id.0)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(row_to_item)
        .collect::<Result<Vec<_>, _>>()?;

        request.quotes = sqlx::query(
            "SELECT id, vendor_name, quote_total, file_url, notes, uploaded_by, uploaded_at
             FROM vendor_quote WHERE request_id = ? ORDER BY position",
        )
        .bind(request.id.0)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(row_to_quote)
        .collect::<Result<Vec<_>, _>>()?;

        request.approvals = sqlx::query(
            "SELECT id, stage, approver_id, decision, comment, created_at, decided_at
             FROM request_approval WHERE request_id = ? ORDER BY position",
        )
        .bind(request.id.0)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(row_to_approval)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(request)
    }

    async fn hydrate_all(&self, rows: Vec<SqliteRow>) -> Result<Vec<Request>, RepositoryError> {
        let decoded = rows.iter().map(row_to_request).collect::<Result<Vec<_>, _>>()?;
        let mut requests = Vec::with_capacity(decoded.len());
        for request in decoded {
            requests.push(self.hydrate(request).await?);
        }
        Ok(requests)
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(raw)
        .map_err(|e| RepositoryError::Decode(format!("{field} `{raw}` is not a decimal: {e}")))
}

fn parse_optional_decimal(
    raw: Option<String>,
    field: &str,
) -> Result<Option<Decimal>, RepositoryError> {
    raw.map(|value| parse_decimal(&value, field)).transpose()
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{field} `{raw}` is not RFC 3339: {e}")))
}

fn parse_optional_timestamp(
    raw: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    raw.map(|value| parse_timestamp(&value, field)).transpose()
}

fn unknown(field: &str, raw: &str) -> RepositoryError {
    RepositoryError::Decode(format!("unknown {field} `{raw}`"))
}

fn to_i64(value: u64, field: &str) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| RepositoryError::Decode(format!("{field} {value} overflows")))
}

fn row_to_request(row: &SqliteRow) -> Result<Request, RepositoryError> {
    let type_str: String = column(row, "request_type")?;
    let request_type = RequestType::parse(&type_str).ok_or_else(|| unknown("request type", &type_str))?;
    let currency_str: String = column(row, "currency")?;
    let currency = Currency::parse(&currency_str).ok_or_else(|| unknown("currency", &currency_str))?;
    let state_str: String = column(row, "state")?;
    let state = RequestState::parse(&state_str).ok_or_else(|| unknown("state", &state_str))?;

    let project = match request_type {
        RequestType::Purchase => None,
        RequestType::Project => Some(ProjectDetails {
            client_name: column(row, "client_name")?,
            project_description: column(row, "project_description")?,
            total_cost: parse_optional_decimal(column(row, "total_cost")?, "total_cost")?,
            total_benefit: parse_optional_decimal(column(row, "total_benefit")?, "total_benefit")?,
            total_price: parse_optional_decimal(column(row, "total_price")?, "total_price")?,
        }),
    };

    let selected_quote_id: Option<String> = column(row, "selected_quote_id")?;
    let selected_quote = match selected_quote_id {
        None => None,
        Some(quote_id) => {
            let method_str: Option<String> = column(row, "selection_method")?;
            let selected_by: Option<i64> = column(row, "selected_by")?;
            let selected_at: Option<String> = column(row, "selected_at")?;
            match (method_str, selected_by, selected_at) {
                (Some(method_str), Some(selected_by), Some(selected_at)) => Some(SelectedQuote {
                    quote_id: QuoteId(quote_id),
                    method: SelectionMethod::parse(&method_str)
                        .ok_or_else(|| unknown("selection method", &method_str))?,
                    selected_by: UserId(selected_by),
                    selected_at: parse_timestamp(&selected_at, "selected_at")?,
                }),
                _ => {
                    return Err(RepositoryError::Decode(format!(
                        "selection of quote `{quote_id}` is missing its method, actor or time"
                    )))
                }
            }
        }
    };

    let needed_by_date: Option<String> = column(row, "needed_by_date")?;
    let needed_by_date = needed_by_date
        .map(|raw| {
            NaiveDate::from_str(&raw)
                .map_err(|e| RepositoryError::Decode(format!("needed_by_date `{raw}`: {e}")))
        })
        .transpose()?;

    let desired_cost: String = column(row, "desired_cost")?;
    let created_at: String = column(row, "created_at")?;
    let state_changed_at: String = column(row, "state_changed_at")?;
    let version: i64 = column(row, "state_version")?;

    Ok(Request {
        id: RequestId(column(row, "id")?),
        code: RequestCode(column(row, "code")?),
        request_type,
        title: column(row, "title")?,
        description: column(row, "description")?,
        desired_cost: parse_decimal(&desired_cost, "desired_cost")?,
        currency,
        state,
        current_approver_id: column::<Option<i64>>(row, "current_approver_id")?.map(UserId),
        requester: UserId(column(row, "requester_id")?),
        items: Vec::new(),
        project,
        quotes: Vec::new(),
        selected_quote,
        approvals: Vec::new(),
        payout_channel: column(row, "payout_channel")?,
        payout_reference: column(row, "payout_reference")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        state_changed_at: parse_timestamp(&state_changed_at, "state_changed_at")?,
        needed_by_date,
        funds_transferred_at: parse_optional_timestamp(
            column(row, "funds_transferred_at")?,
            "funds_transferred_at",
        )?,
        version: u64::try_from(version)
            .map_err(|_| RepositoryError::Decode(format!("negative state_version {version}")))?,
    })
}

fn row_to_item(row: &SqliteRow) -> Result<RequestItem, RepositoryError> {
    let quantity: i64 = column(row, "quantity")?;
    let unit_price: String = column(row, "unit_price")?;
    Ok(RequestItem {
        name: column(row, "name")?,
        quantity: u32::try_from(quantity)
            .map_err(|_| RepositoryError::Decode(format!("item quantity {quantity} out of range")))?,
        unit_price: parse_decimal(&unit_price, "unit_price")?,
    })
}

fn row_to_quote(row: &SqliteRow) -> Result<VendorQuote, RepositoryError> {
    let quote_total: String = column(row, "quote_total")?;
    let uploaded_at: String = column(row, "uploaded_at")?;
    Ok(VendorQuote {
        id: QuoteId(column(row, "id")?),
        vendor_name: column(row, "vendor_name")?,
        quote_total: parse_decimal(&quote_total, "quote_total")?,
        file_url: column(row, "file_url")?,
        notes: column(row, "notes")?,
        uploaded_by: UserId(column(row, "uploaded_by")?),
        uploaded_at: parse_timestamp(&uploaded_at, "uploaded_at")?,
    })
}

fn row_to_approval(row: &SqliteRow) -> Result<ApprovalRecord, RepositoryError> {
    let stage_str: String = column(row, "stage")?;
    let decision_str: String = column(row, "decision")?;
    let created_at: String = column(row, "created_at")?;
    Ok(ApprovalRecord {
        id: ApprovalId(column(row, "id")?),
        stage: Stage::parse(&stage_str).ok_or_else(|| unknown("stage", &stage_str))?,
        approver_id: column::<Option<i64>>(row, "approver_id")?.map(UserId),
        decision: Decision::parse(&decision_str).ok_or_else(|| unknown("decision", &decision_str))?,
        comment: column(row, "comment")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        decided_at: parse_optional_timestamp(column(row, "decided_at")?, "decided_at")?,
    })
}

#[async_trait::async_trait]
impl RequestRepository for SqlRequestRepository {
    async fn find_by_id(&self, id: RequestId) -> Result<Option<Request>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM purchase_request WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        let decoded = row.as_ref().map(row_to_request).transpose()?;
        match decoded {
            Some(request) => Ok(Some(self.hydrate(request).await?)),
            None => Ok(None),
        }
    }

    async fn insert(
        &self,
        requester: UserId,
        draft: NewRequest,
        created_at: DateTime<Utc>,
    ) -> Result<Request, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // Writing first takes the database write lock, so concurrent inserts
        // queue on the busy timeout instead of reading the same counter.
        let sequence: i64 = sqlx::query_scalar(
            "INSERT INTO request_sequence (request_type, year, last_value) VALUES (?, ?, 1)
             ON CONFLICT (request_type, year) DO UPDATE SET last_value = last_value + 1
             RETURNING last_value",
        )
        .bind(draft.request_type.as_str())
        .bind(format!("{:04}", created_at.year()))
        .fetch_one(&mut *tx)
        .await?;

        let mut request = Request::from_draft(RequestId(0), sequence, requester, draft, created_at);
        let project = request.project.clone().unwrap_or_default();

        let inserted = sqlx::query(
            "INSERT INTO purchase_request (code, request_type, title, description, desired_cost,
                 currency, state, requester_id, client_name, project_description, total_cost,
                 total_benefit, total_price, needed_by_date, created_at, state_changed_at,
                 state_version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.code.0)
        .bind(request.request_type.as_str())
        .bind(&request.title)
        .bind(&request.description)
        .bind(request.desired_cost.to_string())
        .bind(request.currency.as_str())
        .bind(request.state.as_str())
        .bind(request.requester.0)
        .bind(&project.client_name)
        .bind(&project.project_description)
        .bind(project.total_cost.map(|value| value.to_string()))
        .bind(project.total_benefit.map(|value| value.to_string()))
        .bind(project.total_price.map(|value| value.to_string()))
        .bind(request.needed_by_date.map(|date| date.to_string()))
        .bind(request.created_at.to_rfc3339())
        .bind(request.state_changed_at.to_rfc3339())
        .bind(to_i64(request.version, "state_version")?)
        .execute(&mut *tx)
        .await?;
        request.id = RequestId(inserted.last_insert_rowid());

        for (position, item) in request.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO request_item (request_id, position, name, quantity, unit_price)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(request.id.0)
            .bind(position as i64)
            .bind(&item.name)
            .bind(i64::from(item.quantity))
            .bind(item.unit_price.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(request)
    }

    async fn save(&self, request: &Request, expected_version: u64) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let selected = request.selected_quote.as_ref();

        let updated = sqlx::query(
            "UPDATE purchase_request SET
                 state = ?, current_approver_id = ?, selected_quote_id = ?, selection_method = ?,
                 selected_by = ?, selected_at = ?, payout_channel = ?, payout_reference = ?,
                 state_changed_at = ?, funds_transferred_at = ?, state_version = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(request.state.as_str())
        .bind(request.current_approver_id.map(|id| id.0))
        .bind(selected.map(|selection| selection.quote_id.0.clone()))
        .bind(selected.map(|selection| selection.method.as_str()))
        .bind(selected.map(|selection| selection.selected_by.0))
        .bind(selected.map(|selection| selection.selected_at.to_rfc3339()))
        .bind(&request.payout_channel)
        .bind(&request.payout_reference)
        .bind(request.state_changed_at.to_rfc3339())
        .bind(request.funds_transferred_at.map(|at| at.to_rfc3339()))
        .bind(to_i64(request.version, "state_version")?)
        .bind(request.id.0)
        .bind(to_i64(expected_version, "expected_version")?)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::VersionConflict {
                request_id: request.id,
                expected: expected_version,
            });
        }

        let stored_approvals = sqlx::query(
            "SELECT id, stage, approver_id, decision, comment, created_at, decided_at
             FROM request_approval WHERE request_id = ? ORDER BY position",
        )
        .bind(request.id.0)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(row_to_approval)
        .collect::<Result<Vec<_>, _>>()?;
        if !extends_history(&stored_approvals, &request.approvals) {
            return Err(RepositoryError::HistoryRewrite { request_id: request.id });
        }

        for (position, quote) in request.quotes.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO vendor_quote (id, request_id, position, vendor_name,
                     quote_total, file_url, notes, uploaded_by, uploaded_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&quote.id.0)
            .bind(request.id.0)
            .bind(position as i64)
            .bind(&quote.vendor_name)
            .bind(quote.quote_total.to_string())
            .bind(&quote.file_url)
            .bind(&quote.notes)
            .bind(quote.uploaded_by.0)
            .bind(quote.uploaded_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        for (position, approval) in request.approvals.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO request_approval (id, request_id, position, stage,
                     approver_id, decision, comment, created_at, decided_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&approval.id.0)
            .bind(request.id.0)
            .bind(position as i64)
            .bind(approval.stage.as_str())
            .bind(approval.approver_id.map(|id| id.0))
            .bind(approval.decision.as_str())
            .bind(&approval.comment)
            .bind(approval.created_at.to_rfc3339())
            .bind(approval.decided_at.map(|at| at.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_by_states(&self, states: &[RequestState]) -> Result<Vec<Request>, RepositoryError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM purchase_request WHERE state IN ({placeholders})
             ORDER BY state_changed_at ASC, id ASC"
        );
        let mut query = sqlx::query(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        self.hydrate_all(rows).await
    }

    async fn list_by_requester(&self, requester: UserId) -> Result<Vec<Request>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM purchase_request WHERE requester_id = ?
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(requester.0)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_all(rows).await
    }
}
