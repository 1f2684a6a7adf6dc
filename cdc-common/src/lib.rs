pub mod alert;
pub mod changes;
pub mod event;
pub mod health;
pub mod history;
pub mod kafka;
pub mod metrics;
pub mod parser;
pub mod pgstore;
pub mod raw;
pub mod scd2;
pub mod schema;
pub mod store;
pub mod time;
pub mod validator;
