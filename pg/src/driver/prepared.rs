//! Deterministic prepared-statement names.

use crate::protocol::auth::md5_hex;

/// Name of the prepared statement for `sql`: the lowercase hex MD5 of the
/// query text.
///
/// Equal text always maps to the same name, so separate protocol steps on
/// one connection address the same statement. 32 characters keeps it under
/// the server's 63-byte identifier limit.
pub fn statement_name(sql: &str) -> String {
    md5_hex(sql.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_name_is_md5_hex() {
        assert_eq!(statement_name("SELECT 1"), "b1698e52a0f16203489454196a0c6307");
    }

    #[test]
    fn test_statement_name_is_stable_and_distinct() {
        let sql = "SELECT id FROM users WHERE id = $1";
        assert_eq!(statement_name(sql), statement_name(sql));
        assert_ne!(statement_name(sql), statement_name("SELECT 2"));
        assert!(statement_name(sql).len() < 64);
    }
}
