use thiserror::Error;

/// Error reported by a container manager, whatever its concrete type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    /// An option or a request parameter was rejected before anything was started.
    #[error("configure request: {0}")]
    Config(String),

    #[error("generic container: {0}")]
    Start(#[source] BoxError),

    #[error("initialize: exec create user: {0}")]
    ExecCreateUser(#[source] BoxError),

    /// The user creation command ran but exited with a non-zero status.
    #[error("initialize: create user failed: {0}")]
    CreateUserFailed(String),

    #[error("initialize: exec create database: {0}")]
    ExecCreateDatabase(#[source] BoxError),

    /// The database creation command ran but exited with a non-zero status.
    #[error("initialize: create database failed: {0}")]
    CreateDatabaseFailed(String),

    #[error("resolve endpoint: {0}")]
    Endpoint(#[source] BoxError),
}

pub type Result<T> = std::result::Result<T, Error>;
