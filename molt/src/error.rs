use thiserror::Error;

/// Recoverable reload failures. Internal aborts (identity-predicate
/// collisions, become validation failures) are engine bugs and panic
/// instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReloadError {
    /// The external loader failed to produce a new program image.
    #[error("load error: {0}")]
    Load(String),

    /// A replacement class failed shape validation.
    #[error("{0}")]
    Shape(String),

    /// A replacement class could not be driven to the finalized state.
    #[error("{0}")]
    Finalization(String),

    /// Class finalization was requested while the loader was running.
    #[error("class finalization is blocked while a library is loading")]
    FinalizationBlocked,

    /// StartReload while a reload context already exists. Caller error.
    #[error("reload already in progress")]
    ReloadInProgress,

    /// StartReload with no root library installed.
    #[error("no root library")]
    NoRootLibrary,
}
