pub mod auth;
pub mod core;
pub mod grid;
pub mod notifications;
pub mod registrations;
pub mod subjects;
pub mod teachers;
