//! Core library for the admissions portal client.
//!
//! - [`auth`]: token pair persistence, access token decoding and the
//!   [`SessionStore`](auth::SessionStore)
//! - [`api`]: the [`ApiClient`](api::ApiClient) that attaches bearer tokens to
//!   every request and refreshes them when they expire
//! - [`config`]: base URL, endpoint paths and storage backend selection

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, ApiRequest, ClientConfig, RefreshError, SessionChange};
pub use auth::{Identity, SessionStore, TokenPair};
pub use config::Config;
