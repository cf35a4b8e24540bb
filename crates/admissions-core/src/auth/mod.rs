//! Authentication state for the admissions portal.
//!
//! This module provides:
//! - `TokenPair` and `Identity`: bearer tokens and the claims decoded from
//!   the access token
//! - `SessionStore`: the current session, persisted through a
//!   `SessionStorage` backend (file, OS keychain or memory)
//! - `Clock`: time source for expiry checks

pub mod clock;
pub mod session;
pub mod storage;
pub mod token;

pub use clock::{Clock, SystemClock};
#[cfg(any(test, feature = "testing"))]
pub use clock::FixedClock;
pub use session::{SessionData, SessionStore};
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, SessionStorage, SESSION_KEY};
pub use token::{Identity, TokenDecodeError, TokenPair};
