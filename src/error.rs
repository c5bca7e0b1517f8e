//! Error types for the larva_vr engine.

use thiserror::Error;

/// Result type alias used across the engine.
pub type Result<T> = std::result::Result<T, VrError>;

/// Coarse classification of a failure, used by the DAG controller and the
/// binary to decide between skipping, stopping and which exit code to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Single-frame problem; handled locally and counted.
    Transient,
    /// A ring buffer writer lapped its readers.
    Overflow,
    /// Bad configuration, calibration or protocol; raised before workers spawn.
    Configuration,
    /// Camera or projector failure during `initialize()`.
    Hardware,
    /// Anything else escaping a worker's `work()`.
    Fatal,
}

impl ErrorClass {
    /// Process exit code for errors of this class.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClass::Configuration => 1,
            ErrorClass::Hardware => 2,
            ErrorClass::Transient | ErrorClass::Overflow | ErrorClass::Fatal => 3,
        }
    }
}

/// Errors that can occur while configuring or running the engine.
#[derive(Error, Debug)]
pub enum VrError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("calibration error: {0}")]
    Calibration(String),

    #[error("unknown stimulus kind: {0}")]
    UnknownStimulus(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("camera error: {0}")]
    Camera(String),

    #[error("projector error: {0}")]
    Projector(String),

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("codec error: expected {expected} bytes, got {actual}")]
    CodecSize { expected: usize, actual: usize },

    #[error("malformed slot: {0}")]
    MalformedSlot(String),

    #[error("ring buffer overflow on '{0}'")]
    Overflow(String),

    #[error("invalid DAG: {0}")]
    Graph(String),

    #[error("worker '{worker}' failed: {reason}")]
    Worker { worker: String, reason: String },

    #[error("recorder error: {0}")]
    Recorder(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl VrError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn calibration<S: Into<String>>(msg: S) -> Self {
        Self::Calibration(msg.into())
    }

    pub fn camera<S: Into<String>>(msg: S) -> Self {
        Self::Camera(msg.into())
    }

    pub fn projector<S: Into<String>>(msg: S) -> Self {
        Self::Projector(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn worker<W: Into<String>, S: Into<String>>(worker: W, reason: S) -> Self {
        Self::Worker {
            worker: worker.into(),
            reason: reason.into(),
        }
    }

    /// Which part of the error taxonomy this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            VrError::Config(_)
            | VrError::Calibration(_)
            | VrError::UnknownStimulus(_)
            | VrError::Protocol(_)
            | VrError::Graph(_)
            | VrError::Toml(_) => ErrorClass::Configuration,
            VrError::Camera(_) | VrError::Projector(_) => ErrorClass::Hardware,
            VrError::MalformedSlot(_) | VrError::CodecSize { .. } => ErrorClass::Transient,
            VrError::Overflow(_) => ErrorClass::Overflow,
            VrError::SharedMemory(_)
            | VrError::Worker { .. }
            | VrError::Recorder(_)
            | VrError::Io(_)
            | VrError::Image(_)
            | VrError::Json(_)
            | VrError::Csv(_) => ErrorClass::Fatal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.class().exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_map_to_documented_exit_codes() {
        assert_eq!(VrError::config("bad fps").exit_code(), 1);
        assert_eq!(VrError::UnknownStimulus("SPIRAL".into()).exit_code(), 1);
        assert_eq!(VrError::camera("no device").exit_code(), 2);
        assert_eq!(VrError::projector("no window").exit_code(), 2);
        assert_eq!(VrError::worker("tracker_0", "panic").exit_code(), 3);
    }

    #[test]
    fn malformed_frames_are_transient() {
        let err = VrError::MalformedSlot("bad sentinel".into());
        assert_eq!(err.class(), ErrorClass::Transient);
        let err = VrError::CodecSize { expected: 10, actual: 4 };
        assert_eq!(err.class(), ErrorClass::Transient);
    }
}
