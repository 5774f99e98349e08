pub mod discount;
pub mod order;
pub mod profile;
pub mod scheduler;
pub mod settings;
pub mod track;
pub mod transaction;
pub mod webhook_log;
