use thiserror::Error;

#[derive(Debug, Error)]
pub enum SongbirdError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("backup error: {0}")]
    Backup(String),
    #[error("recording error: {0}")]
    Recording(String),
    #[error("pipeline stage failed: {0}")]
    Pipeline(String),
    #[error("session cancelled: {0}")]
    Cancelled(String),
}

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CANCELLED: i32 = 130;

impl SongbirdError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cancelled(_) => EXIT_CANCELLED,
            _ => EXIT_FAILURE,
        }
    }
}
