pub mod bus;
pub mod connection;
pub mod error;
pub mod events;
pub mod presence;
pub mod reactions;
pub mod router;
pub mod session;
