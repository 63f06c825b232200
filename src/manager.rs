//! The seam between container modules and whatever actually runs containers.

use crate::container::{ContainerRequest, ExposedPort};
use async_trait::async_trait;

/// Result of a command executed inside a running container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Interleaved stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ContainerManager: Send + Sync {
    type Container: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates the container without starting it. Pulls the image if needed.
    async fn create(&self, request: &ContainerRequest) -> Result<Self::Container, Self::Error>;

    /// Starts the container and waits until the request's readiness strategy is satisfied.
    async fn start(
        &self,
        container: &Self::Container,
        request: &ContainerRequest,
    ) -> Result<(), Self::Error>;

    async fn exec(
        &self,
        container: &Self::Container,
        command: &[String],
    ) -> Result<ExecOutput, Self::Error>;

    /// Externally reachable `host:port` for a container port. Resolved on every call.
    async fn endpoint(
        &self,
        container: &Self::Container,
        port: ExposedPort,
    ) -> Result<String, Self::Error>;

    async fn stop(&self, container: &Self::Container) -> Result<(), Self::Error>;

    async fn kill(&self, container: &Self::Container) -> Result<(), Self::Error>;
}
