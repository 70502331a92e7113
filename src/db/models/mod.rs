//! Database models split into separate files.

pub mod account;
pub mod calendar;
pub mod event_state;

pub use self::account::*;
pub use self::calendar::*;
pub use self::event_state::*;
