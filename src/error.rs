use std::path::PathBuf;

/// Error types for the console runtime
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("playback already in progress")]
    PlaybackBusy,

    #[error("run contains no commands")]
    EmptyRun,

    #[error("no recording to save")]
    EmptyRecording,

    #[error("no saved runs in {}", .0.display())]
    NoSavedRuns(PathBuf),
}

pub type Result<T> = std::result::Result<T, ConsoleError>;
