//! REST API client module for the admissions backend.
//!
//! This module provides the `ApiClient` through which every backend call is
//! made. The backend authenticates with JWT bearer tokens obtained from the
//! login endpoint; the client attaches them and refreshes them when the
//! access token expires.

pub mod client;
pub mod error;
pub mod request;

pub use client::{ApiClient, ClientConfig, SessionChange};
pub use error::{ApiError, RefreshError};
pub use request::{ApiRequest, RequestBody};
