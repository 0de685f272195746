pub mod delivery;
pub mod error;
pub mod health;
pub mod job;
pub mod response;
pub mod retry;
