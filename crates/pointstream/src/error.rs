//! Error types for the pointstream crate.

use std::fmt;

use crate::dataset::{DatasetId, NodeKey};

/// Result type for pointstream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Invalid streaming configuration, rejected before any frame runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `max_concurrent_loads` was zero.
    ZeroConcurrentLoads,
    /// `max_concurrent_hierarchy_loads` was zero.
    ZeroConcurrentHierarchyLoads,
    /// A minimum pixel size was negative or not finite.
    InvalidPixelThreshold(f64),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroConcurrentLoads => {
                write!(f, "max_concurrent_loads must be at least 1")
            }
            ConfigError::ZeroConcurrentHierarchyLoads => {
                write!(f, "max_concurrent_hierarchy_loads must be at least 1")
            }
            ConfigError::InvalidPixelThreshold(value) => {
                write!(f, "min_node_pixel_size must be finite and >= 0, got {value}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors that can occur in pointstream operations.
#[derive(Debug)]
pub enum Error {
    /// Configuration was rejected.
    Config(ConfigError),
    /// Camera data was missing or not finite.
    InvalidCamera {
        /// Which part of the view was invalid.
        detail: String,
    },
    /// A frame was stepped with no views.
    NoActiveViews,
    /// The dataset is not tracked by this context.
    UnknownDataset(DatasetId),
    /// The node does not exist in its dataset's hierarchy.
    UnknownNode(NodeKey),
    /// The node already has resident geometry.
    AlreadyResident(NodeKey),
    /// The node's parent has no resident geometry.
    ParentNotResident(NodeKey),
    /// The node still has resident children.
    ResidentChildren(NodeKey),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "invalid configuration: {e}"),
            Error::InvalidCamera { detail } => write!(f, "invalid camera: {detail}"),
            Error::NoActiveViews => write!(f, "no active views for this frame"),
            Error::UnknownDataset(id) => write!(f, "unknown dataset {id}"),
            Error::UnknownNode(key) => write!(f, "unknown node {key}"),
            Error::AlreadyResident(key) => write!(f, "node {key} is already resident"),
            Error::ParentNotResident(key) => {
                write!(f, "parent of node {key} is not resident")
            }
            Error::ResidentChildren(key) => {
                write!(f, "node {key} still has resident children")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

/// Why a tile or hierarchy load failed.
///
/// Load failures never abort a frame. The node reverts to unloaded and is
/// considered again the next time traversal wants it.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    /// Fetching the payload failed.
    Fetch {
        /// Where the payload was fetched from.
        location: String,
        /// The error message.
        message: String,
    },
    /// The payload source answered with a non-success status.
    HttpStatus {
        /// Where the payload was fetched from.
        location: String,
        /// The status code.
        status: u16,
    },
    /// The payload could not be decoded.
    Decode(pointstream_decode::DecodeError),
    /// Child metadata could not be produced.
    Hierarchy {
        /// The error message.
        message: String,
    },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Fetch { location, message } => {
                write!(f, "fetching {location} failed: {message}")
            }
            LoadError::HttpStatus { location, status } => {
                write!(f, "fetching {location} returned status {status}")
            }
            LoadError::Decode(e) => write!(f, "decode error: {e}"),
            LoadError::Hierarchy { message } => write!(f, "hierarchy error: {message}"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<pointstream_decode::DecodeError> for LoadError {
    fn from(e: pointstream_decode::DecodeError) -> Self {
        LoadError::Decode(e)
    }
}
