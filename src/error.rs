use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum CoaccessError {
    Config(String),
    Io(std::io::Error),
    Encode(Box<bincode::error::EncodeError>),
    Decode(Box<bincode::error::DecodeError>),
    Json(serde_json::Error),
    Data(String),
    ResourceExists(PathBuf),
    Cancelled {
        stage: &'static str,
        completed: usize,
        /// `None` for streaming stages whose unit count is unknown up front.
        total: Option<usize>,
    },
}

impl fmt::Display for CoaccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoaccessError::Config(e) => write!(f, "Configuration error: {}", e),
            CoaccessError::Io(e) => write!(f, "IO error: {}", e),
            CoaccessError::Encode(e) => write!(f, "Run encoding error: {}", e),
            CoaccessError::Decode(e) => write!(f, "Run decoding error: {}", e),
            CoaccessError::Json(e) => write!(f, "Archive JSON error: {}", e),
            CoaccessError::Data(e) => write!(f, "Data error: {}", e),
            CoaccessError::ResourceExists(path) => write!(
                f,
                "{} already exists; refusing to overwrite (use --resume to reuse completed stages)",
                path.display()
            ),
            CoaccessError::Cancelled {
                stage,
                completed,
                total: Some(total),
            } => write!(
                f,
                "Cancelled during {} after {}/{} units",
                stage, completed, total
            ),
            CoaccessError::Cancelled {
                stage,
                completed,
                total: None,
            } => write!(f, "Cancelled during {} after {} units", stage, completed),
        }
    }
}

impl std::error::Error for CoaccessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoaccessError::Io(e) => Some(e),
            CoaccessError::Json(e) => Some(e),
            CoaccessError::Encode(e) => Some(e.as_ref()),
            CoaccessError::Decode(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<bincode::error::EncodeError> for CoaccessError {
    fn from(err: bincode::error::EncodeError) -> Self {
        CoaccessError::Encode(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for CoaccessError {
    fn from(err: bincode::error::DecodeError) -> Self {
        CoaccessError::Decode(Box::new(err))
    }
}

impl From<std::io::Error> for CoaccessError {
    fn from(err: std::io::Error) -> Self {
        CoaccessError::Io(err)
    }
}

impl From<serde_json::Error> for CoaccessError {
    fn from(err: serde_json::Error) -> Self {
        CoaccessError::Json(err)
    }
}

impl CoaccessError {
    /// True for errors raised before any stage work starts.
    pub fn is_config(&self) -> bool {
        matches!(self, CoaccessError::Config(_))
    }
}
