//! Runtime environment detection.
//!
//! Provides a single source of truth for determining the runtime environment
//! (test, development, production) based on the `IOTICISER_ENV` environment
//! variable.
//!
//! # Usage
//!
//! ```rust
//! use ioticiser_core::env::{Environment, is_test_mode};
//!
//! if Environment::current().is_test() {
//!     // use scratch file paths instead of platform config dirs
//! }
//!
//! if is_test_mode() {
//!     // test-specific behavior
//! }
//! ```
//!
//! # Environment Variable
//!
//! Set `IOTICISER_ENV` to one of:
//! - `test` - Test mode (uses scratch file paths, shorter timers)
//! - `system_test` - System test mode (full flow against a test container)
//! - `development` or `dev` - Development mode
//! - (anything else or unset) - Production mode

/// Application name used for platform config-dir resolution.
pub const APP_NAME: &str = "ioticiser";

/// Runtime environment for the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment - uses scratch file paths.
    Test,
    /// System test environment - full flow against a test container.
    SystemTest,
}

impl Environment {
    /// Detect current environment from `IOTICISER_ENV`.
    #[must_use]
    pub fn current() -> Self {
        match std::env::var("IOTICISER_ENV").as_deref() {
            Ok("test") => Self::Test,
            Ok("system_test") => Self::SystemTest,
            Ok("development") | Ok("dev") => Self::Development,
            _ => Self::Production,
        }
    }

    /// Returns `true` if this is the test environment (unit tests).
    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }

    /// Returns `true` if this is the system test environment.
    #[must_use]
    pub fn is_system_test(self) -> bool {
        self == Self::SystemTest
    }

    /// Returns `true` if running in any test mode (test or system_test).
    #[must_use]
    pub fn is_any_test(self) -> bool {
        matches!(self, Self::Test | Self::SystemTest)
    }

    /// Returns `true` if this is the production environment.
    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    /// Returns `true` if this is the development environment.
    #[must_use]
    pub fn is_development(self) -> bool {
        self == Self::Development
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
            Self::SystemTest => write!(f, "system_test"),
        }
    }
}

/// Convenience function to check if running in test mode (unit tests only).
#[must_use]
pub fn is_test_mode() -> bool {
    Environment::current().is_test()
}

/// Returns `true` if running in any test mode (unit tests or system tests).
///
/// Use this for timeouts, intervals, and file path fallbacks (e.g. stash and
/// config files land under a scratch directory rather than the platform
/// config dir while this is true).
#[must_use]
pub fn is_any_test() -> bool {
    Environment::current().is_any_test()
}

/// Returns `true` if on-disk state should use scratch test paths rather than
/// the platform-standard config directory.
#[must_use]
pub fn should_use_test_paths() -> bool {
    is_any_test()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_display() {
        assert_eq!(Environment::Production.to_string(), "production");
        assert_eq!(Environment::Development.to_string(), "development");
        assert_eq!(Environment::Test.to_string(), "test");
        assert_eq!(Environment::SystemTest.to_string(), "system_test");
    }

    #[test]
    fn test_environment_is_methods() {
        assert!(Environment::Test.is_test());
        assert!(!Environment::Test.is_production());
        assert!(!Environment::Test.is_development());
        assert!(!Environment::Test.is_system_test());

        assert!(Environment::Production.is_production());
        assert!(!Environment::Production.is_test());

        assert!(Environment::Development.is_development());
        assert!(!Environment::Development.is_test());

        assert!(Environment::SystemTest.is_system_test());
        assert!(!Environment::SystemTest.is_test());
        assert!(!Environment::SystemTest.is_production());
    }

    #[test]
    fn test_is_any_test() {
        assert!(Environment::Test.is_any_test());
        assert!(Environment::SystemTest.is_any_test());
        assert!(!Environment::Production.is_any_test());
        assert!(!Environment::Development.is_any_test());
    }
}
