//! Data models for the supplier portal gateway.
//!
//! This module contains all the data structures used across the crate:
//! - Connection targets and engines
//! - Tenant routing
//! - Query values and statements
//! - Stored-procedure calls and signatures
//! - Portal domain records

pub mod connection;
pub mod portal;
pub mod procedure;
pub mod query;
pub mod tenant;

pub use connection::*;
pub use portal::*;
pub use procedure::*;
pub use query::*;
pub use tenant::*;

/// Check that `s` is a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 128 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("Empresa"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier("a b"));
        assert!(!is_identifier(""));
    }
}
