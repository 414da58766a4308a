use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Regex for validating SQL identifiers (schema and table names)
    /// Must start with a letter or underscore, at most 63 characters (PostgreSQL limit)
    /// - Valid: "telemetry", "sensor_readings", "_raw2"
    /// - Invalid: "2raw", "sensor-readings", "public.readings", ""
    pub static ref SQL_IDENTIFIER_REGEX: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap();
}

/// Quote a validated identifier for interpolation into SQL
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_identifier_regex_valid() {
        assert!(SQL_IDENTIFIER_REGEX.is_match("telemetry"));
        assert!(SQL_IDENTIFIER_REGEX.is_match("sensor_readings"));
        assert!(SQL_IDENTIFIER_REGEX.is_match("_raw2"));
        assert!(SQL_IDENTIFIER_REGEX.is_match("Readings"));
        assert!(SQL_IDENTIFIER_REGEX.is_match(&"a".repeat(63)));
    }

    #[test]
    fn test_sql_identifier_regex_invalid() {
        assert!(!SQL_IDENTIFIER_REGEX.is_match("2raw")); // starts with digit
        assert!(!SQL_IDENTIFIER_REGEX.is_match("sensor-readings")); // hyphen
        assert!(!SQL_IDENTIFIER_REGEX.is_match("public.readings")); // dot
        assert!(!SQL_IDENTIFIER_REGEX.is_match("readings\"; DROP")); // injection
        assert!(!SQL_IDENTIFIER_REGEX.is_match("")); // empty
        assert!(!SQL_IDENTIFIER_REGEX.is_match(&"a".repeat(64))); // too long
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("readings"), "\"readings\"");
    }
}
