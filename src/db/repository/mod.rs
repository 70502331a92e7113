pub mod account_repository;
pub mod calendar_repository;
pub mod event_state_repository;

pub use account_repository::AccountRepository;
pub use calendar_repository::CalendarRepository;
pub use event_state_repository::EventStateRepository;
