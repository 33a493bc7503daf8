pub mod audit;
pub mod broadcast;
pub mod users;
