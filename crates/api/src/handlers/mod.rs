pub mod batches;
pub mod events;
pub mod health;
pub mod quota;
pub mod tasks;
