use thiserror::Error;

/// Status shown when the comparison script cannot be retrieved.
pub const FETCH_FAILED_MESSAGE: &str = "Failed to fetch comparison script";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{file} is empty")]
    Empty { file: String },
    #[error("{file} could not be opened as a workbook: {source}")]
    Workbook {
        file: String,
        #[source]
        source: calamine::Error,
    },
    #[error("{file} could not be parsed as CSV: {source}")]
    Csv {
        file: String,
        #[source]
        source: csv::Error,
    },
    #[error("{file} contains no sheets")]
    NoSheets { file: String },
    #[error("{file} exceeds the limit of {limit} cells")]
    TooLarge { file: String, limit: usize },
}

impl DecodeError {
    pub fn file(&self) -> &str {
        match self {
            DecodeError::Empty { file }
            | DecodeError::Workbook { file, .. }
            | DecodeError::Csv { file, .. }
            | DecodeError::NoSheets { file }
            | DecodeError::TooLarge { file, .. } => file,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid script name '{0}'")]
    InvalidName(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("repository answered with status {0}")]
    Status(u16),
    #[error("unexpected payload: {0}")]
    Payload(String),
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unknown comparison script '{0}'")]
    UnknownScript(String),
    #[error("script does not define compareAndDisplayData(xlsx, file1, file2)")]
    MissingEntryPoint,
    #[error("script failed to compile: {0}")]
    Compile(String),
    #[error("script raised an error: {0}")]
    Runtime(String),
    #[error("script exceeded its limits: {0}")]
    LimitExceeded(String),
    #[error("script returned an invalid result: {0}")]
    InvalidResult(String),
    #[error("{file} has no column named {wanted}")]
    MissingColumn { file: String, wanted: String },
    #[error("comparison was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CompareError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("comparison task failed: {0}")]
    Internal(String),
}

impl CompareError {
    /// Message shown in the status line of the comparison form
    pub fn status_message(&self) -> String {
        match self {
            CompareError::Decode(e) => format!("Failed to read file: {}", e.file()),
            CompareError::Fetch(_) => FETCH_FAILED_MESSAGE.to_string(),
            CompareError::Exec(e) => format!("Comparison failed: {}", e),
            CompareError::Internal(_) => "An error occurred".to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CompareError::Exec(ExecError::Cancelled))
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("there are no results to export")]
    EmptyGrid,
    #[error("failed to write workbook: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),
    #[error("failed to write csv: {0}")]
    Csv(#[from] csv::Error),
}

/// Failure reported by an identity backend
///
/// `Rejected` carries the provider's error code (`EMAIL_NOT_FOUND`,
/// `INVALID_PASSWORD`, ...), which drives the user-facing message.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("identity provider rejected the request: {0}")]
    Rejected(String),
    #[error("identity provider unreachable: {0}")]
    Transport(String),
    #[error("user store failure: {0}")]
    Store(String),
}

impl AuthError {
    pub fn rejected(code: impl Into<String>) -> Self {
        AuthError::Rejected(code.into())
    }

    pub fn code(&self) -> &str {
        match self {
            AuthError::Rejected(code) => code,
            AuthError::Transport(_) => "NETWORK_REQUEST_FAILED",
            AuthError::Store(_) => "INTERNAL_ERROR",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self.code() {
            "EMAIL_NOT_FOUND" | "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS"
            | "INVALID_EMAIL" | "MISSING_PASSWORD" => "Invalid email or password",
            "USER_DISABLED" => "This account has been disabled",
            "TOO_MANY_ATTEMPTS_TRY_LATER" => "Too many failed attempts. Please try again later",
            "EMAIL_EXISTS" => "An account with this email already exists",
            "WEAK_PASSWORD" => "Password should be at least 6 characters",
            _ => "Sign-in failed. Please try again",
        }
    }
}
