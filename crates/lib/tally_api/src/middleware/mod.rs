//! Request middleware.

pub mod auth;
pub mod origin;
pub mod pipeline;
