//! HTTP middleware for the notification routes.
pub mod auth;
