pub mod codes;
pub mod events;
pub mod models;
