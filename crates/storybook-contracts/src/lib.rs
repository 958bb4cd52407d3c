pub mod events;
pub mod models;
pub mod outcome;
pub mod records;
pub mod request;
pub mod task;
