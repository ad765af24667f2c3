// backend/src/routes/mod.rs

pub mod events;
pub mod health;
pub mod kpi;
pub mod sessions;
