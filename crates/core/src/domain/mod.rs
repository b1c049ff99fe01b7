pub mod approval;
pub mod quote;
pub mod request;
pub mod user;
