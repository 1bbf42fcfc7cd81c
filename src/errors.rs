use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiffimError>;

#[derive(Debug, Error)]
pub enum DiffimError {
    #[error("invalid basis configuration: {0}")]
    InvalidBasisConfig(String),
    #[error("candidate {id} has no kernel solution")]
    NotInitialized { id: usize },
    #[error("ill-conditioned fit: {0}")]
    IllConditionedFit(String),
    #[error("degenerate spatial model: {available} good candidates, {required} required")]
    DegenerateSpatialModel { available: usize, required: usize },
    #[error("no good candidates remain out of {n_candidates}")]
    NoGoodCandidates { n_candidates: usize },
    #[error("numeric overflow: {0}")]
    NumericOverflow(String),
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("out of bounds: {0}")]
    OutOfBounds(String),
    #[error("{0}")]
    IOError(#[from] std::io::Error),
    #[error("{0}")]
    InvalidFITS(String),
    #[error("bad yaml: {0}")]
    YAMLError(#[from] serde_yaml::Error),
    #[error("{0}")]
    Coordinate(String),
    #[error("bad input pattern")]
    BadPattern(#[from] glob::PatternError),
    #[error("unreadable path")]
    UnreadablePath(#[from] glob::GlobError),
}

impl DiffimError {
    /// Errors confined to one candidate; the batch carries on without it.
    pub fn is_candidate_local(&self) -> bool {
        matches!(
            self,
            DiffimError::IllConditionedFit(_) | DiffimError::NumericOverflow(_)
        )
    }
}

#[cfg(feature = "python")]
impl From<DiffimError> for pyo3::PyErr {
    fn from(value: DiffimError) -> Self {
        pyo3::exceptions::PyValueError::new_err(value.to_string())
    }
}
