//! Runtime environment, selected by `DURCIT_ENV`.
//!
//! - `test`: config and credentials live under the repo's `tmp/`
//! - `development` / `dev`: verbose logging
//! - anything else: production

/// Runtime environment for the sync client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Default.
    Production,
    /// Local development against a dev server.
    Development,
    /// Integration tests.
    Test,
}

impl Environment {
    /// Read `DURCIT_ENV`.
    pub fn current() -> Self {
        Self::parse(std::env::var("DURCIT_ENV").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("test") => Self::Test,
            Some("development" | "dev") => Self::Development,
            _ => Self::Production,
        }
    }

    /// `env_logger` filter used when `RUST_LOG` is unset.
    pub fn default_log_filter(self) -> &'static str {
        match self {
            Self::Production => "info",
            Self::Development => "durcit_sync=debug,info",
            Self::Test => "warn",
        }
    }
}

/// Whether `DURCIT_ENV=test`.
pub fn is_test_mode() -> bool {
    Environment::current() == Environment::Test
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values() {
        assert_eq!(Environment::parse(Some("test")), Environment::Test);
        assert_eq!(Environment::parse(Some(" dev ")), Environment::Development);
        assert_eq!(Environment::parse(Some("development")), Environment::Development);
        assert_eq!(Environment::parse(Some("staging")), Environment::Production);
        assert_eq!(Environment::parse(None), Environment::Production);
    }

    #[test]
    fn test_log_filters() {
        assert_eq!(Environment::Production.default_log_filter(), "info");
        assert!(Environment::Development
            .default_log_filter()
            .contains("durcit_sync=debug"));
        assert_eq!(Environment::Test.default_log_filter(), "warn");
    }
}
