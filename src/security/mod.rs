//! Security module - Secret handling and log sanitization
//!
//! - Zeroizing, redacted-by-default token strings
//! - Redaction helpers for tokens, URLs and identifiers in logs

mod sanitizer;
mod secure_string;

pub use sanitizer::Sanitizer;
pub use secure_string::SecretString;
