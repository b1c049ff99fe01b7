use std::sync::{Arc, Mutex};

use procura_core::domain::request::RequestId;
use procura_core::errors::Recovery;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A non-blocking message for the person driving the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub request_id: Option<RequestId>,
    pub recovery: Option<Recovery>,
}

impl Notice {
    pub fn info(request_id: RequestId, message: impl Into<String>) -> Self {
        Self { level: NoticeLevel::Info, message: message.into(), request_id: Some(request_id), recovery: None }
    }
}

/// Where notices go. Rendering and delivery belong to the front end.
pub trait NoticeSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

#[derive(Clone, Default)]
pub struct InMemoryNoticeSink {
    notices: Arc<Mutex<Vec<Notice>>>,
}

impl InMemoryNoticeSink {
    pub fn notices(&self) -> Vec<Notice> {
        match self.notices.lock() {
            Ok(notices) => notices.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn last(&self) -> Option<Notice> {
        self.notices().pop()
    }
}

impl NoticeSink for InMemoryNoticeSink {
    fn notify(&self, notice: Notice) {
        match self.notices.lock() {
            Ok(mut notices) => notices.push(notice),
            Err(poisoned) => poisoned.into_inner().push(notice),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNoticeSink;

impl NoticeSink for TracingNoticeSink {
    fn notify(&self, notice: Notice) {
        let request_id = notice.request_id.map(|id| id.0);
        let recovery = notice.recovery.map(|recovery| format!("{recovery:?}"));
        let recovery = recovery.as_deref();
        match notice.level {
            NoticeLevel::Info => {
                tracing::info!(event_name = "client.notice", request_id, recovery, "{}", notice.message)
            }
            NoticeLevel::Warning => {
                tracing::warn!(event_name = "client.notice", request_id, recovery, "{}", notice.message)
            }
            NoticeLevel::Error => {
                tracing::error!(event_name = "client.notice", request_id, recovery, "{}", notice.message)
            }
        }
    }
}
