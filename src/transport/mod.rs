//! Homeserver transports.
//!
//! Only the client-server HTTP API is implemented; the in-memory homeserver
//! used by tests lives in `test_utils`.

pub mod http;

pub use http::{HttpSession, HttpSessionFactory};
