pub mod http;
pub mod notice;
pub mod session;

pub use http::HttpGateway;
pub use notice::{InMemoryNoticeSink, Notice, NoticeLevel, NoticeSink, TracingNoticeSink};
pub use session::{DecisionForm, ReviewSession, SessionError};
