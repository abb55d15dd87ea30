//! Error types for Crosspost

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrosspostError>;

#[derive(Error, Debug)]
pub enum CrosspostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CrosspostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CrosspostError::InvalidInput(_) => 3,
            CrosspostError::Platform(PlatformError::Authentication(_)) => 2,
            CrosspostError::Platform(_) => 1,
            CrosspostError::Config(_) => 1,
            CrosspostError::Database(_) => 1,
            CrosspostError::Credential(_) => 2,
            CrosspostError::Io(_) => 1,
        }
    }

    /// Whether the failure is a stale or invalid login
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            CrosspostError::Platform(PlatformError::Authentication(_))
        )
    }

    /// Whether the failure is an envelope/protocol violation
    pub fn is_unexpected_response(&self) -> bool {
        matches!(
            self,
            CrosspostError::Platform(PlatformError::UnexpectedResponse(_))
        )
    }

    /// Whether the failure is a timeout or connection problem
    pub fn is_transport(&self) -> bool {
        matches!(self, CrosspostError::Platform(PlatformError::Transport(_)))
    }

    /// Whether the failure is a duplicate key on insert
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            CrosspostError::Database(DbError::IntegrityViolation(_))
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Duplicate key: {0}")]
    IntegrityViolation(String),
}

impl DbError {
    /// Classify a sqlx error, splitting unique-constraint failures out
    pub fn classify(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &error {
            if db_err.is_unique_violation() {
                return DbError::IntegrityViolation(db_err.message().to_string());
            }
        }
        DbError::SqlxError(error)
    }
}

/// The raw server reply kept for diagnosing envelope violations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl std::fmt::Display for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unexpected response from [{}] (HTTP {}), body: [{}]",
            self.url, self.status, self.body
        )
    }
}

#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("{0}")]
    UnexpectedResponse(RawResponse),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),
}

impl PlatformError {
    /// Map a reqwest failure onto the transport or protocol classification
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return PlatformError::Transport(format!("request timed out: {}", error));
        }
        if error.is_connect() || error.is_request() || error.is_body() {
            return PlatformError::Transport(error.to_string());
        }
        if error.is_builder() {
            return PlatformError::Validation(error.to_string());
        }
        PlatformError::Transport(error.to_string())
    }
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Malformed {format} credential: {reason}")]
    Malformed { format: String, reason: String },

    #[error("OS keyring unavailable: {0}")]
    KeyringUnavailable(String),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawResponse {
        RawResponse {
            url: "https://m.weibo.cn/api/config".to_string(),
            status: 200,
            body: r#"{"ok":0}"#.to_string(),
        }
    }

    #[test]
    fn test_exit_code_invalid_input() {
        let error = CrosspostError::InvalidInput("Empty handle".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_authentication_error() {
        let error = CrosspostError::Platform(PlatformError::Authentication(
            "cookies expired".to_string(),
        ));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_other_platform_errors() {
        let unexpected = CrosspostError::Platform(PlatformError::UnexpectedResponse(raw()));
        let transport = CrosspostError::Platform(PlatformError::Transport("timeout".into()));
        assert_eq!(unexpected.exit_code(), 1);
        assert_eq!(transport.exit_code(), 1);
    }

    #[test]
    fn test_unexpected_response_carries_raw_body() {
        let error = PlatformError::UnexpectedResponse(raw());
        let message = format!("{}", error);
        assert!(message.contains("m.weibo.cn/api/config"));
        assert!(message.contains(r#"{"ok":0}"#));
        assert!(message.contains("HTTP 200"));
    }

    #[test]
    fn test_classification_helpers() {
        let auth: CrosspostError = PlatformError::Authentication("x".into()).into();
        assert!(auth.is_auth_failure());
        assert!(!auth.is_unexpected_response());

        let unexpected: CrosspostError = PlatformError::UnexpectedResponse(raw()).into();
        assert!(unexpected.is_unexpected_response());

        let transport: CrosspostError = PlatformError::Transport("reset".into()).into();
        assert!(transport.is_transport());

        let dup: CrosspostError = DbError::IntegrityViolation("messages.platform_post_id".into()).into();
        assert!(dup.is_integrity_violation());
    }

    #[test]
    fn test_error_message_formatting_config() {
        let error = CrosspostError::Config(ConfigError::MissingField("source.bearer_token".into()));
        assert_eq!(
            format!("{}", error),
            "Configuration error: Missing required field: source.bearer_token"
        );
    }

    #[test]
    fn test_credential_error_formatting() {
        let error = CredentialError::Malformed {
            format: "header".to_string(),
            reason: "pair without '='".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Malformed header credential: pair without '='"
        );
    }

    #[test]
    fn test_platform_error_clone() {
        let original = PlatformError::UnexpectedResponse(raw());
        let cloned = original.clone();
        assert_eq!(format!("{}", original), format!("{}", cloned));
    }

    #[test]
    fn test_error_debug_output() {
        let error = CrosspostError::Platform(PlatformError::Posting("rejected".into()));
        let debug_output = format!("{:?}", error);
        assert!(debug_output.contains("Platform"));
        assert!(debug_output.contains("Posting"));
    }
}
