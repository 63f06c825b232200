use crate::{error::Error, image::ImageReference};
use docker_api::opts::{ContainerCreateOpts, HostPort, PublishPort};
use regex::Regex;
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    str::FromStr,
    time::Duration,
};

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a container manager needs to create and start one container.
#[derive(Clone, Debug)]
pub struct ContainerRequest {
    image: ImageReference,
    environment_variables: BTreeMap<String, String>,
    exposed_ports: BTreeMap<ExposedPort, Option<u16>>,
    labels: HashMap<String, String>,
    command: Option<Vec<String>>,
    wait_strategy_on_startup: ReadyStrategy,
    start_timeout: Duration,
    auto_remove: bool,
}

impl ContainerRequest {
    pub fn from_image(full_image_name: &str) -> Result<Self, Error> {
        Ok(ContainerRequest {
            image: full_image_name.parse()?,
            environment_variables: BTreeMap::new(),
            exposed_ports: BTreeMap::new(),
            labels: HashMap::new(),
            command: None,
            wait_strategy_on_startup: ReadyStrategy::None,
            start_timeout: DEFAULT_START_TIMEOUT,
            auto_remove: false,
        })
    }

    pub fn add_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }

    pub fn add_exposed_port(mut self, host_port: Option<u16>, port: ExposedPort) -> Self {
        self.exposed_ports.insert(port, host_port);
        self
    }

    pub fn add_exposed_tcp_port(self, port: u16) -> Self {
        self.add_exposed_port(None, ExposedPort::tcp(port))
    }

    pub fn add_fixed_exposed_tcp_port(self, host_port: u16, container_port: u16) -> Self {
        self.add_exposed_port(Some(host_port), ExposedPort::tcp(container_port))
    }

    pub fn add_label<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn with_command(mut self, command_parts: &[&str]) -> Self {
        self.command = Some(command_parts.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Considers the container ready once its logs contain `message` verbatim.
    pub fn wait_for_log_message(mut self, message: &str) -> Self {
        let regex = Regex::new(&regex::escape(message)).expect("escaped text is a valid regex");
        self.wait_strategy_on_startup = ReadyStrategy::LogMessageRegExp(regex);
        self
    }

    pub fn wait_for_log_on_startup(mut self, log_regex: &str) -> Result<Self, Error> {
        let regex = Regex::new(log_regex)
            .map_err(|e| Error::Config(format!("invalid log pattern {log_regex}: {e}")))?;
        self.wait_strategy_on_startup = ReadyStrategy::LogMessageRegExp(regex);
        Ok(self)
    }

    pub fn wait_for_healthy_state(mut self) -> Self {
        self.wait_strategy_on_startup = ReadyStrategy::StateHealthy;
        self
    }

    /// Accepts human durations such as `90s` or `2 minutes`.
    pub fn with_start_timeout(mut self, duration_expression: &str) -> Result<Self, Error> {
        self.start_timeout = parse_duration::parse(duration_expression).map_err(|e| {
            Error::Config(format!("invalid start timeout {duration_expression}: {e}"))
        })?;
        Ok(self)
    }

    pub fn with_auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    pub fn image(&self) -> &ImageReference {
        &self.image
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.environment_variables.get(key).map(String::as_str)
    }

    pub fn exposed_ports(&self) -> impl Iterator<Item = &ExposedPort> {
        self.exposed_ports.keys()
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn command(&self) -> Option<&[String]> {
        self.command.as_deref()
    }

    pub fn ready_strategy(&self) -> &ReadyStrategy {
        &self.wait_strategy_on_startup
    }

    pub fn start_timeout(&self) -> Duration {
        self.start_timeout
    }

    pub fn auto_remove(&self) -> bool {
        self.auto_remove
    }
}

impl From<&ContainerRequest> for ContainerCreateOpts {
    fn from(request: &ContainerRequest) -> Self {
        let mut opts = ContainerCreateOpts::builder()
            .image(request.image.full_name())
            .env(
                request
                    .environment_variables
                    .iter()
                    .map(|(name, value)| format!("{name}={value}")),
            )
            .labels(request.labels.clone())
            .auto_remove(request.auto_remove)
            .publish_all_ports();

        if let Some(command) = &request.command {
            opts = opts.command(command.clone());
        }

        for (exposed_port, host_port) in &request.exposed_ports {
            opts = match host_port {
                Some(host_port) => opts.expose(
                    exposed_port.publish_port(),
                    HostPort::new(u32::from(*host_port)),
                ),
                None => opts.publish(exposed_port.publish_port()),
            }
        }

        opts.build()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A container-side port, written `1972/tcp` in Docker's port maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExposedPort {
    port: u16,
    protocol: Protocol,
}

impl ExposedPort {
    pub const fn tcp(port: u16) -> Self {
        ExposedPort {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub const fn udp(port: u16) -> Self {
        ExposedPort {
            port,
            protocol: Protocol::Udp,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn publish_port(&self) -> PublishPort {
        match self.protocol {
            Protocol::Tcp => PublishPort::tcp(u32::from(self.port)),
            Protocol::Udp => PublishPort::udp(u32::from(self.port)),
        }
    }
}

impl Display for ExposedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let protocol = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}/{protocol}", self.port)
    }
}

impl FromStr for ExposedPort {
    type Err = Error;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (port, protocol) = spec.split_once('/').unwrap_or((spec, "tcp"));
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port: {spec}")))?;
        match protocol {
            "tcp" => Ok(ExposedPort::tcp(port)),
            "udp" => Ok(ExposedPort::udp(port)),
            _ => Err(Error::Config(format!("unsupported protocol: {spec}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ReadyStrategy {
    LogMessageRegExp(Regex),
    StateHealthy,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_env_values_replace_earlier_ones() {
        let request = ContainerRequest::from_image("iris:latest")
            .unwrap()
            .add_env("IRIS_USERNAME", "first")
            .add_env("IRIS_USERNAME", "second");
        assert_eq!(request.env("IRIS_USERNAME"), Some("second"));
        assert_eq!(request.env("IRIS_PASSWORD"), None);
    }

    #[test]
    fn exposed_ports_are_listed_in_docker_notation() {
        let request = ContainerRequest::from_image("iris:latest")
            .unwrap()
            .add_exposed_tcp_port(52773)
            .add_exposed_tcp_port(1972);
        let ports: Vec<String> = request.exposed_ports().map(|p| p.to_string()).collect();
        assert_eq!(ports, vec!["1972/tcp", "52773/tcp"]);
    }

    #[test]
    fn parses_port_specs() {
        assert_eq!("1972/tcp".parse::<ExposedPort>().unwrap(), ExposedPort::tcp(1972));
        assert_eq!("53/udp".parse::<ExposedPort>().unwrap(), ExposedPort::udp(53));
        assert_eq!("8080".parse::<ExposedPort>().unwrap(), ExposedPort::tcp(8080));
        assert!("http/tcp".parse::<ExposedPort>().is_err());
        assert!("1972/sctp".parse::<ExposedPort>().is_err());
    }

    #[test]
    fn log_message_is_matched_literally() {
        let request = ContainerRequest::from_image("iris:latest")
            .unwrap()
            .wait_for_log_message("Enabling logons (*)");
        match request.ready_strategy() {
            ReadyStrategy::LogMessageRegExp(regex) => {
                assert!(regex.is_match("[INFO] Enabling logons (*)\n"));
                assert!(!regex.is_match("Enabling logons"));
            }
            other => panic!("unexpected strategy {other:?}"),
        }
    }

    #[test]
    fn start_timeout_accepts_human_durations() {
        let request = ContainerRequest::from_image("iris:latest").unwrap();
        assert_eq!(request.start_timeout(), Duration::from_secs(60));
        let request = request.with_start_timeout("2 minutes").unwrap();
        assert_eq!(request.start_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn rejects_bad_configuration() {
        let request = ContainerRequest::from_image("iris:latest").unwrap();
        assert!(matches!(
            request.clone().with_start_timeout("soon"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            request.wait_for_log_on_startup("(unclosed"),
            Err(Error::Config(_))
        ));
    }
}
