use std::sync::Arc;

use chrono::{Datelike, Duration, Utc};
use rust_decimal::Decimal;

use procura_core::domain::approval::{ApprovalId, ApprovalRecord, Decision, Stage};
use procura_core::domain::quote::{QuoteId, VendorQuote};
use procura_core::domain::request::{Currency, NewRequest, Request, RequestState, RequestType};
use procura_core::domain::user::{NewUser, Role, UserId};
use procura_db::{
    connect_with_settings, migrations, DemoDirectory, InMemoryRequestRepository,
    InMemoryUserRepository, RepositoryError, RequestRepository, SqlRequestRepository,
    SqlUserRepository, UserRepository,
};

type ContractResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

fn draft(title: &str) -> NewRequest {
    NewRequest {
        request_type: RequestType::Purchase,
        title: title.to_string(),
        description: None,
        desired_cost: Decimal::new(2_400, 0),
        currency: Currency::Usd,
        needed_by_date: None,
        items: Vec::new(),
        project: None,
    }
}

fn advanced(request: &Request, approver: UserId) -> Request {
    let now = Utc::now();
    let mut next = request.clone();
    next.state = RequestState::DmApproved;
    next.state_changed_at = now;
    next.version = request.version + 1;
    next.quotes.push(VendorQuote {
        id: QuoteId(format!("q-{}", request.id)),
        vendor_name: "Northwind".to_string(),
        quote_total: Decimal::new(2_250, 0),
        file_url: "https://files.example.com/northwind.pdf".to_string(),
        notes: None,
        uploaded_by: approver,
        uploaded_at: now - Duration::minutes(1),
    });
    next.approvals.push(ApprovalRecord {
        id: ApprovalId(format!("ap-{}", request.id)),
        stage: Stage::Dm,
        approver_id: Some(approver),
        decision: Decision::Approved,
        comment: None,
        created_at: request.state_changed_at,
        decided_at: Some(now),
    });
    next
}

/// The guarantees the workflow service relies on, checked against any store.
async fn request_store_contract(
    store: &dyn RequestRepository,
    requester: UserId,
    approver: UserId,
) -> ContractResult {
    let first = store.insert(requester, draft("Desks"), Utc::now()).await.map_err(|e| e.to_string())?;
    let second =
        store.insert(requester, draft("Chairs"), Utc::now()).await.map_err(|e| e.to_string())?;
    require!(first.version == 1, "new drafts start at version 1, got {}", first.version);
    require!(first.id != second.id, "ids must be unique");
    require!(
        first.display_code() != second.display_code(),
        "codes must be unique: {}",
        first.display_code()
    );

    let next = advanced(&first, approver);
    let (left, right) = tokio::join!(store.save(&next, first.version), store.save(&next, first.version));
    let winners = [left.is_ok(), right.is_ok()].iter().filter(|ok| **ok).count();
    require!(winners == 1, "exactly one save at the same version wins, got {winners}");
    let loser = left.err().or(right.err());
    require!(
        matches!(loser, Some(RepositoryError::VersionConflict { .. })),
        "the losing save reports a version conflict, got {loser:?}"
    );

    let stored = store
        .find_by_id(first.id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "saved request should be present".to_string())?;
    require!(stored.version == 2, "version advanced once, got {}", stored.version);
    require!(stored.approvals.len() == 1, "approval record appended");
    require!(stored.quotes.len() == 1, "quote appended");

    let mut rewritten = stored.clone();
    rewritten.approvals.clear();
    rewritten.version = stored.version + 1;
    let rewrite = store.save(&rewritten, stored.version).await;
    require!(
        matches!(rewrite, Err(RepositoryError::HistoryRewrite { .. })),
        "dropping approval history is refused, got {rewrite:?}"
    );

    let mut altered = stored.clone();
    if let Some(record) = altered.approvals.first_mut() {
        record.decision = Decision::Rejected;
        record.comment = Some("changed after the fact".to_string());
    }
    altered.version = stored.version + 1;
    let rewrite = store.save(&altered, stored.version).await;
    require!(
        matches!(rewrite, Err(RepositoryError::HistoryRewrite { .. })),
        "editing a recorded decision is refused, got {rewrite:?}"
    );
    let reloaded = store
        .find_by_id(first.id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "request should still be present".to_string())?;
    require!(reloaded.version == stored.version, "refused saves leave the version alone");
    require!(
        reloaded.approvals.first().map(|record| record.decision) == Some(Decision::Approved),
        "refused saves leave the recorded decision alone"
    );

    let pending =
        store.list_by_states(&[RequestState::DmApproved]).await.map_err(|e| e.to_string())?;
    require!(
        pending.iter().map(|request| request.id).collect::<Vec<_>>() == vec![first.id],
        "only the advanced request is pending at DM_APPROVED"
    );
    let mine = store.list_by_requester(requester).await.map_err(|e| e.to_string())?;
    require!(mine.len() == 2, "requester sees both drafts, got {}", mine.len());
    let others = store.list_by_requester(approver).await.map_err(|e| e.to_string())?;
    require!(others.is_empty(), "approver raised nothing");

    Ok(())
}

async fn seed_users(users: &dyn UserRepository) -> ContractResult<(UserId, UserId)> {
    let seeded = DemoDirectory::seed(users).await.map_err(|e| e.to_string())?;
    require!(seeded.seeded.len() == 6, "demo directory seeds six users");
    let lookup = |name: &'static str| async move {
        users
            .find_by_username(name)
            .await
            .map_err(|e| e.to_string())?
            .map(|user| user.id)
            .ok_or_else(|| format!("{name} should be seeded"))
    };
    Ok((lookup("uma").await?, lookup("dana").await?))
}

#[tokio::test]
async fn in_memory_store_honours_the_request_contract() -> ContractResult {
    let users = InMemoryUserRepository::default();
    let (requester, approver) = seed_users(&users).await?;
    request_store_contract(&InMemoryRequestRepository::default(), requester, approver).await
}

#[tokio::test]
async fn sql_store_honours_the_request_contract() -> ContractResult {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.map_err(|e| e.to_string())?;
    migrations::run_pending(&pool).await.map_err(|e| e.to_string())?;

    let users = SqlUserRepository::new(pool.clone());
    let (requester, approver) = seed_users(&users).await?;
    request_store_contract(&SqlRequestRepository::new(pool), requester, approver).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_drafts_on_a_shared_file_get_distinct_codes() -> ContractResult {
    let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("procura.db").display());
    let pool = connect_with_settings(&url, 8, 30).await.map_err(|e| e.to_string())?;
    migrations::run_pending(&pool).await.map_err(|e| e.to_string())?;

    let users = SqlUserRepository::new(pool.clone());
    let (requester, _) = seed_users(&users).await?;
    let store = Arc::new(SqlRequestRepository::new(pool));
    let created_at = Utc::now();

    let tasks = (0..8)
        .map(|n| {
            let store = store.clone();
            tokio::spawn(async move {
                store.insert(requester, draft(&format!("Batch {n}")), created_at).await
            })
        })
        .collect::<Vec<_>>();

    let mut codes = Vec::new();
    for task in tasks {
        let request = task.await.map_err(|e| e.to_string())?.map_err(|e| e.to_string())?;
        codes.push(request.display_code().to_string());
    }
    codes.sort();

    let year = created_at.year();
    let expected = (1..=8).map(|n| format!("PR-{year}-{n:03}")).collect::<Vec<_>>();
    require!(codes == expected, "codes are allocated once each, got {codes:?}");
    Ok(())
}

#[tokio::test]
async fn stores_agree_on_user_directory_lookups() -> ContractResult {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.map_err(|e| e.to_string())?;
    migrations::run_pending(&pool).await.map_err(|e| e.to_string())?;
    let sql = SqlUserRepository::new(pool);
    let memory = InMemoryUserRepository::default();

    for store in [&sql as &dyn UserRepository, &memory as &dyn UserRepository] {
        let manager = store
            .insert(NewUser {
                username: "mara".to_string(),
                display_name: "Mara Manager".to_string(),
                role: Role::DirectManager,
                manager_id: None,
            })
            .await
            .map_err(|e| e.to_string())?;
        let report = store
            .insert(NewUser {
                username: "rory".to_string(),
                display_name: "Rory Report".to_string(),
                role: Role::User,
                manager_id: Some(manager.id),
            })
            .await
            .map_err(|e| e.to_string())?;

        let found = store
            .find_by_id(report.id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "report should be present".to_string())?;
        require!(found.manager_id == Some(manager.id), "manager link survives a reload");
        require!(found.active, "new users are active");
        require!(store.list().await.map_err(|e| e.to_string())?.len() == 2, "two users listed");
    }

    Ok(())
}
