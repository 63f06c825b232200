use crate::{
    container::{ContainerRequest, ExposedPort, ReadyStrategy},
    image::ImageReference,
    manager::{ContainerManager, ExecOutput},
};
use async_trait::async_trait;
use docker_api::{
    models::{ContainerInspect200Response, ImageBuildChunk, NetworkSettings, PortBinding},
    opts::{
        ContainerCreateOpts, ContainerStopOpts, ExecCreateOpts, ExecStartOpts, ImageListOpts,
        LogsOpts, PullOpts,
    },
    Container, Docker, Exec,
};
use futures_util::StreamExt;
use log::{debug, error, info};
use std::{
    collections::HashMap,
    env,
    fmt::Display,
    sync::RwLock,
    time::{Duration, Instant},
};

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
const DEFAULT_HOST: &str = "localhost";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// [`ContainerManager`] talking to a Docker Engine.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
    host: String,
}

impl Default for DockerClient {
    fn default() -> Self {
        Self {
            docker: Docker::unix(DEFAULT_SOCKET),
            host: DEFAULT_HOST.to_string(),
        }
    }
}

impl DockerClient {
    /// Honours `DOCKER_HOST` for the daemon and `TESTCONTAINERS_HOST_OVERRIDE` for the
    /// host published in endpoints.
    pub fn from_env() -> Result<Self, docker_api::Error> {
        let docker_host = env::var("DOCKER_HOST").ok().filter(|h| !h.is_empty());
        let docker = match &docker_host {
            Some(uri) => Docker::new(uri)?,
            None => Docker::unix(DEFAULT_SOCKET),
        };
        let host = env::var("TESTCONTAINERS_HOST_OVERRIDE")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| docker_host.as_deref().and_then(tcp_host))
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        Ok(Self { docker, host })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn image_exists_locally(
        &self,
        image: &ImageReference,
    ) -> Result<bool, docker_api::Error> {
        let images = self
            .docker
            .images()
            .list(&ImageListOpts::builder().filter(vec![image.filter()]).build())
            .await?;
        Ok(!images.is_empty())
    }

    async fn pull(&self, image: &ImageReference) -> Result<(), docker_api::Error> {
        let images = self.docker.images();
        let mut stream = images.pull(&PullOpts::builder().image(image.full_name()).build());
        while let Some(chunk) = stream.next().await {
            debug!("{}", PullProgress::from(chunk?));
        }
        Ok(())
    }
}

/// Host part of a `tcp://host:port` daemon address.
fn tcp_host(docker_host: &str) -> Option<String> {
    let address = docker_host.strip_prefix("tcp://")?;
    let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
    (!host.is_empty()).then(|| host.to_string())
}

#[async_trait]
impl ContainerManager for DockerClient {
    type Container = DockerContainer;
    type Error = docker_api::Error;

    async fn create(&self, request: &ContainerRequest) -> Result<DockerContainer, Self::Error> {
        let image = request.image();
        if !self.image_exists_locally(image).await? {
            info!("🐋 Pulling image {image}");
            self.pull(image).await?;
        }
        let opts: ContainerCreateOpts = request.into();
        let container = self.docker.containers().create(&opts).await?;
        Ok(DockerContainer::new(container))
    }

    async fn start(
        &self,
        container: &DockerContainer,
        request: &ContainerRequest,
    ) -> Result<(), Self::Error> {
        container
            .start_and_wait(request.ready_strategy(), request.start_timeout())
            .await
    }

    async fn exec(
        &self,
        container: &DockerContainer,
        command: &[String],
    ) -> Result<ExecOutput, Self::Error> {
        debug!("🐋 Exec in {}: {command:?}", container.id());
        let opts = ExecCreateOpts::builder()
            .command(command.to_vec())
            .attach_stdout(true)
            .attach_stderr(true)
            .build();
        let exec = Exec::create(self.docker.clone(), container.inner.id().clone(), &opts).await?;
        let chunks = exec
            .start(&ExecStartOpts::builder().build())
            .await?
            .collect::<Vec<_>>()
            .await;
        let mut output = Vec::new();
        for chunk in chunks {
            output.extend(chunk?.to_vec());
        }
        // The output stream may close before the daemon records the exit code.
        let exit_code = loop {
            let inspect = exec.inspect().await?;
            match ExecStatus::of(inspect.running, inspect.exit_code.map(|code| code as i64)) {
                ExecStatus::Running => tokio::time::sleep(READY_POLL_INTERVAL).await,
                ExecStatus::Exited(exit_code) => break exit_code,
                ExecStatus::Unknown => {
                    return Err(docker_api::Error::StringError(format!(
                        "exec in container {} finished without an exit code",
                        container.id()
                    )))
                }
            }
        };
        Ok(ExecOutput {
            exit_code,
            output: String::from_utf8_lossy(&output).to_string(),
        })
    }

    async fn endpoint(
        &self,
        container: &DockerContainer,
        port: ExposedPort,
    ) -> Result<String, Self::Error> {
        let inspect = container.inner.inspect().await?;
        let ports = RunningState::extract_port_mapping(inspect.network_settings);
        match ports.get(&port) {
            Some(host_port) => Ok(format!("{}:{host_port}", self.host)),
            None => Err(docker_api::Error::StringError(format!(
                "port {port} of container {} is not mapped",
                container.id()
            ))),
        }
    }

    async fn stop(&self, container: &DockerContainer) -> Result<(), Self::Error> {
        let name = container.stop(ContainerStopOpts::builder().build()).await?;
        info!("🐋 Container {name} is stopped");
        Ok(())
    }

    async fn kill(&self, container: &DockerContainer) -> Result<(), Self::Error> {
        let name = container
            .stop(ContainerStopOpts::builder().signal("SIGKILL").build())
            .await?;
        info!("🐋 Container {name} killed");
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ExecStatus {
    Running,
    Exited(i64),
    Unknown,
}

impl ExecStatus {
    fn of(running: Option<bool>, exit_code: Option<i64>) -> Self {
        match (running, exit_code) {
            (Some(true), _) => ExecStatus::Running,
            (_, Some(exit_code)) => ExecStatus::Exited(exit_code),
            (_, None) => ExecStatus::Unknown,
        }
    }
}

struct PullProgress {
    message: String,
}

impl From<ImageBuildChunk> for PullProgress {
    fn from(chunk: ImageBuildChunk) -> Self {
        let message = match chunk {
            ImageBuildChunk::Update { stream } => format!("Update: {stream}"),
            ImageBuildChunk::Error {
                error,
                error_detail,
            } => format!("Error: {error}: {}", error_detail.message),
            ImageBuildChunk::Digest { aux } => format!("Digest: {}", aux.id),
            ImageBuildChunk::PullStatus {
                status,
                id,
                progress,
                progress_detail: _,
            } => {
                let id = id.unwrap_or_default();
                let progress = progress.unwrap_or_default();
                format!("Pull: {status} {id} {progress}")
            }
        };
        PullProgress { message }
    }
}

impl Display for PullProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "🐋 {}", self.message.trim())
    }
}

/// A container created by [`DockerClient`].
pub struct DockerContainer {
    inner: Container,
    running_state: RwLock<Option<RunningState>>,
}

impl DockerContainer {
    fn new(container: Container) -> Self {
        DockerContainer {
            inner: container,
            running_state: RwLock::new(None),
        }
    }

    pub fn id(&self) -> String {
        self.inner.id().to_string()
    }

    /// Container name once started, its id otherwise.
    pub fn name(&self) -> String {
        self.running_state
            .read()
            .ok()
            .and_then(|state| state.as_ref().map(|s| s.name.clone()))
            .unwrap_or_else(|| self.id())
    }

    async fn health_state(&self) -> Result<Option<String>, docker_api::Error> {
        let inspect = self.inner.inspect().await?;
        Ok(inspect.state.and_then(|state| state.health?.status))
    }

    async fn logs(&self) -> Result<String, docker_api::Error> {
        let opts = LogsOpts::builder().stdout(true).stderr(true).all().build();
        let logs = self
            .inner
            .logs(&opts)
            .map(|chunk| match chunk {
                Ok(chunk) => chunk.to_vec(),
                Err(e) => {
                    error!("🐋 Error: {e}");
                    vec![]
                }
            })
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        Ok(String::from_utf8_lossy(&logs).to_string())
    }

    async fn wait_until_ready(
        &self,
        ready_strategy: &ReadyStrategy,
        timeout: Duration,
    ) -> Result<(), docker_api::Error> {
        let deadline = Instant::now() + timeout;
        loop {
            match ready_strategy {
                ReadyStrategy::LogMessageRegExp(regex) => {
                    if regex.is_match(&self.logs().await?) {
                        return Ok(());
                    }
                }
                ReadyStrategy::StateHealthy => {
                    if self.health_state().await?.as_deref() == Some("healthy") {
                        return Ok(());
                    }
                }
                ReadyStrategy::None => return Ok(()),
            }
            if deadline < Instant::now() {
                return Err(docker_api::Error::StringError(format!(
                    "container {} takes too much time to be ready",
                    self.id()
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn start_and_wait(
        &self,
        ready_strategy: &ReadyStrategy,
        timeout: Duration,
    ) -> Result<(), docker_api::Error> {
        self.inner.start().await?;
        self.wait_until_ready(ready_strategy, timeout).await?;
        let running_state: RunningState = self.inner.inspect().await?.into();
        info!("🐋 Container {} is ready", running_state.name);
        if let Ok(mut state) = self.running_state.write() {
            *state = Some(running_state);
        }
        Ok(())
    }

    /// Stops the container and returns the name it was running under.
    async fn stop(&self, opts: ContainerStopOpts) -> Result<String, docker_api::Error> {
        self.inner.stop(&opts).await?;
        Ok(self.forget_running_state())
    }

    fn forget_running_state(&self) -> String {
        let name = self.name();
        if let Ok(mut state) = self.running_state.write() {
            *state = None;
        }
        name
    }
}

#[derive(Clone)]
struct RunningState {
    name: String,
}

impl From<ContainerInspect200Response> for RunningState {
    fn from(inspect: ContainerInspect200Response) -> Self {
        let name = inspect
            .name
            .or(inspect.id)
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        RunningState { name }
    }
}

impl RunningState {
    fn extract_port_mapping(
        network_settings: Option<NetworkSettings>,
    ) -> HashMap<ExposedPort, u16> {
        network_settings
            .and_then(|settings| settings.ports)
            .map(Self::host_ports)
            .unwrap_or_default()
    }

    /// Maps container ports to host ports, preferring IPv4 wildcard bindings.
    fn host_ports(
        bindings: HashMap<String, Option<Vec<PortBinding>>>,
    ) -> HashMap<ExposedPort, u16> {
        let mut ports = HashMap::new();
        for (container_port_spec, host_ports) in bindings {
            let Ok(container_port) = container_port_spec.parse::<ExposedPort>() else {
                continue;
            };
            let mut candidates: Vec<(bool, u16)> = host_ports
                .unwrap_or_default()
                .into_iter()
                .filter_map(|binding| {
                    let host_ip = binding.host_ip?;
                    let host_port = binding.host_port?.parse().ok()?;
                    match host_ip.as_str() {
                        "0.0.0.0" => Some((true, host_port)),
                        "::" | "" => Some((false, host_port)),
                        _ => None,
                    }
                })
                .collect();
            candidates.sort_by_key(|(ipv4, _)| !ipv4);
            if let Some((_, host_port)) = candidates.first() {
                ports.insert(container_port, *host_port);
            }
        }
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_daemon_host_from_tcp_uri() {
        assert_eq!(tcp_host("tcp://10.0.0.5:2375"), Some("10.0.0.5".to_string()));
        assert_eq!(tcp_host("tcp://docker"), Some("docker".to_string()));
        assert_eq!(tcp_host("unix:///var/run/docker.sock"), None);
    }

    #[test]
    fn missing_network_settings_yield_no_ports() {
        assert!(RunningState::extract_port_mapping(None).is_empty());
    }

    fn binding(host_ip: &str, host_port: &str) -> PortBinding {
        PortBinding {
            host_ip: Some(host_ip.to_string()),
            host_port: Some(host_port.to_string()),
        }
    }

    #[test]
    fn host_ports_prefer_ipv4_wildcard_bindings() {
        let bindings = HashMap::from([
            (
                "1972/tcp".to_string(),
                Some(vec![binding("::", "49200"), binding("0.0.0.0", "49100")]),
            ),
            ("52773/tcp".to_string(), Some(vec![binding("", "49300")])),
            ("53/udp".to_string(), Some(vec![binding("::", "49400")])),
            ("8080/tcp".to_string(), Some(vec![binding("127.0.0.1", "49500")])),
            ("9090/tcp".to_string(), Some(vec![binding("0.0.0.0", "http")])),
            ("7070/tcp".to_string(), None),
            ("not-a-port".to_string(), Some(vec![binding("0.0.0.0", "49600")])),
        ]);

        let ports = RunningState::host_ports(bindings);

        assert_eq!(ports.get(&ExposedPort::tcp(1972)), Some(&49100));
        assert_eq!(ports.get(&ExposedPort::tcp(52773)), Some(&49300));
        assert_eq!(ports.get(&ExposedPort::udp(53)), Some(&49400));
        assert_eq!(ports.get(&ExposedPort::tcp(8080)), None);
        assert_eq!(ports.get(&ExposedPort::tcp(9090)), None);
        assert_eq!(ports.get(&ExposedPort::tcp(7070)), None);
        assert_eq!(ports.len(), 3);
    }

    #[test]
    fn exec_is_finished_only_once_the_daemon_says_so() {
        assert_eq!(ExecStatus::of(Some(true), None), ExecStatus::Running);
        assert_eq!(ExecStatus::of(Some(true), Some(0)), ExecStatus::Running);
        assert_eq!(ExecStatus::of(Some(false), Some(1)), ExecStatus::Exited(1));
        assert_eq!(ExecStatus::of(None, Some(0)), ExecStatus::Exited(0));
        assert_eq!(ExecStatus::of(Some(false), None), ExecStatus::Unknown);
        assert_eq!(ExecStatus::of(None, None), ExecStatus::Unknown);
    }

    #[test]
    fn stopped_container_is_reported_under_its_running_name() {
        let docker = Docker::unix(DEFAULT_SOCKET);
        let container = DockerContainer::new(Container::new(docker, "abc123".to_string()));
        assert_eq!(container.name(), "abc123");
        *container.running_state.write().unwrap() = Some(RunningState {
            name: "iris-test".to_string(),
        });

        assert_eq!(container.forget_running_state(), "iris-test");
        assert_eq!(container.name(), "abc123");
    }

    #[test]
    fn default_client_publishes_on_localhost() {
        assert_eq!(DockerClient::default().host(), "localhost");
    }
}
