//! Error types reported by the resource manager.

use err_derive::Error;

use crate::config::ConfigError;

/// Result type of this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors the resource manager reports to callers.
///
/// Load failures of individual resources are not errors; they end up as
/// `ResourceState::LoadedResourceMissing` and are resolved through fallbacks.
#[derive(Debug, Error)]
pub enum Error {
    /// A resource is missing and neither the resource nor its type provide a fallback.
    #[error(
        display = "The resource {:?} of type {:?} is missing and no fallback is available",
        id,
        type_name
    )]
    MissingResource {
        /// Name of the resource type.
        type_name: &'static str,
        /// ID of the missing resource.
        id: String,
    },
    /// Content was created for a resource that already has content.
    #[error(
        display = "The resource {:?} of type {:?} has already been created",
        id,
        type_name
    )]
    AlreadyCreated {
        /// Name of the resource type.
        type_name: &'static str,
        /// ID of the resource.
        id: String,
    },
    /// The manager has been shut down.
    #[error(display = "The resource manager has been shut down")]
    Shutdown,
    /// Reading or writing the configuration failed.
    #[error(display = "Failed to load the streaming configuration")]
    Config(#[error(source)] ConfigError),
    /// A worker thread pool could not be created.
    #[error(display = "Failed to create worker thread pool: {}", _0)]
    ThreadPool(String),
}
