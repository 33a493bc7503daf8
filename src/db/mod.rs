pub mod audit;
pub mod message;
pub mod recipient;
pub mod user;
