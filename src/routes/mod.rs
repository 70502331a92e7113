pub mod audit;
pub mod calendars;
pub mod cleanup;
pub mod health;
pub mod webhooks;
