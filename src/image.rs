use std::{fmt::Display, str::FromStr, sync::LazyLock};

use docker_api::opts::ImageFilter;
use regex::Regex;

use crate::error::Error;

static SHA256_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[0-9a-fA-F]{32,}$").expect("valid sha256 pattern"));
static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w][\w.\-]{0,127}$").expect("valid tag pattern"));

/// A validated `[registry/]repository[:tag|@sha256:digest]` image reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageReference {
    raw_name: String,
    registry: Option<String>,
    repository: String,
    version: Version,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Version {
    Any,
    Sha256(String),
    Tag(String),
}

impl ImageReference {
    pub fn full_name(&self) -> &str {
        &self.raw_name
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Filter matching this image in the local image store.
    pub(crate) fn filter(&self) -> ImageFilter {
        let image = match &self.registry {
            Some(registry) => format!("{registry}/{}", self.repository),
            None => self.repository.clone(),
        };
        let tag = match &self.version {
            Version::Any => None,
            Version::Sha256(sha256) => Some(sha256.clone()),
            Version::Tag(tag) => Some(tag.clone()),
        };
        ImageFilter::Reference(image, tag)
    }
}

impl Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw_name)
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(full_image_name: &str) -> Result<Self, Self::Err> {
        if full_image_name.is_empty() {
            return Err(Error::Config("empty image reference".into()));
        }
        let (registry, remainder) = match full_image_name.split_once('/') {
            Some((registry, remainder))
                if registry.contains('.')
                    || registry.contains(':')
                    || registry == "localhost" =>
            {
                (Some(registry), remainder)
            }
            _ => (None, full_image_name),
        };

        let (repository, version) = match remainder.split_once("@sha256:") {
            Some((repository, digest)) => (repository, Version::sha256(digest)?),
            None => match remainder.split_once(':') {
                Some((repository, tag)) => (repository, Version::tag(tag)?),
                None => (remainder, Version::Any),
            },
        };
        if repository.is_empty() || repository.contains('@') || repository.contains(':') {
            return Err(Error::Config(format!(
                "invalid repository name: {repository}"
            )));
        }
        Ok(ImageReference {
            raw_name: full_image_name.into(),
            registry: registry.map(Into::into),
            repository: repository.into(),
            version,
        })
    }
}

impl Version {
    fn sha256(hash: &str) -> Result<Version, Error> {
        if SHA256_PATTERN.is_match(hash) {
            Ok(Version::Sha256(hash.into()))
        } else {
            Err(Error::Config(format!("invalid sha256 hash version: {hash}")))
        }
    }

    fn tag(tag: &str) -> Result<Version, Error> {
        if TAG_PATTERN.is_match(tag) {
            Ok(Version::Tag(tag.into()))
        } else {
            Err(Error::Config(format!("invalid tag version: {tag}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(name: &str) -> ImageReference {
        name.parse().unwrap()
    }

    #[test]
    fn parses_default_iris_image() {
        let image = parse("containers.intersystems.com/intersystems/iris-community:latest-em");
        assert_eq!(image.registry(), Some("containers.intersystems.com"));
        assert_eq!(image.repository(), "intersystems/iris-community");
        assert_eq!(image.version(), &Version::Tag("latest-em".into()));
        assert_eq!(
            image.to_string(),
            "containers.intersystems.com/intersystems/iris-community:latest-em"
        );
    }

    #[test]
    fn parses_hub_images_without_registry() {
        let image = parse("intersystemsdc/iris-community");
        assert_eq!(image.registry(), None);
        assert_eq!(image.repository(), "intersystemsdc/iris-community");
        assert_eq!(image.version(), &Version::Any);

        let image = parse("iris:2024.1");
        assert_eq!(image.repository(), "iris");
        assert_eq!(image.version(), &Version::Tag("2024.1".into()));
    }

    #[test]
    fn parses_registry_with_port_and_digest() {
        let image = parse("localhost:5000/iris@sha256:1234abcd1234abcd1234abcd1234abcd");
        assert_eq!(image.registry(), Some("localhost:5000"));
        assert_eq!(image.repository(), "iris");
        assert_eq!(
            image.version(),
            &Version::Sha256("1234abcd1234abcd1234abcd1234abcd".into())
        );
    }

    #[test]
    fn rejects_invalid_references() {
        let error = "iris@invalid".parse::<ImageReference>().unwrap_err();
        assert_eq!(
            error.to_string(),
            "configure request: invalid repository name: iris@invalid"
        );
        let error = "repo:iris:invalid".parse::<ImageReference>().unwrap_err();
        assert_eq!(
            error.to_string(),
            "configure request: invalid tag version: iris:invalid"
        );
        assert!("".parse::<ImageReference>().is_err());
    }
}
