//! HTTP client (spec §4.A): issues async HTTP requests and exposes body +
//! MIME-multipart parts to protocol handlers.

mod multipart;
mod query;

pub use multipart::{Part, parse_multipart};
pub use query::{HttpClient, Method, Query};
