pub use error::{Error, Result};
pub use iris::{IrisContainer, LaunchError};

use docker_client::DockerClient;

pub mod container;
pub mod docker_client;
pub mod error;
pub mod image;
pub mod iris;
pub mod manager;

/// Launches an IRIS container from the default image on the Docker daemon found in
/// the environment.
pub async fn start_iris<I>(
    options: I,
) -> std::result::Result<IrisContainer<DockerClient>, LaunchError<DockerClient>>
where
    I: IntoIterator<Item = iris::RequestOption>,
{
    let docker = DockerClient::from_env().map_err(|e| LaunchError {
        container: None,
        error: Error::Config(format!("docker connection: {e}")),
    })?;
    IrisContainer::run_default(docker, options).await
}
