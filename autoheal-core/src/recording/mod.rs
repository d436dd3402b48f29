pub mod logger;
pub mod middleware;
pub mod sanitizer;
pub mod types;

pub use logger::RecordingLogger;
pub use middleware::{create_http_client, RecordingMiddleware};
pub use sanitizer::{Sanitizer, SENSITIVE_HEADERS};
pub use types::*;
