use std::fmt;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_INDEX: &str = "https://index.docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// Connection settings for one repository on one registry.
///
/// Built once with [`RegistryConfig::new`] and the `with_*` setters, then
/// handed to [`crate::registry::RegistryClient::new`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    index: Url,
    registry: Option<Url>,
    proxy: Option<String>,
    system_proxy: bool,
    insecure: bool,
    repository: String,
    username: String,
    password: String,
    connect_timeout: Duration,
    timeout: Duration,
    user_agent: String,
}

fn parse_endpoint(raw: &str) -> Result<Url> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };
    let url = Url::parse(&with_scheme)?;
    if url.host_str().is_none() {
        return Err(Error::Config(format!("endpoint has no host: {}", raw)));
    }
    Ok(url)
}

impl RegistryConfig {
    pub fn new(index: &str, repository: impl Into<String>) -> Result<Self> {
        let repository = repository.into();
        if repository.is_empty() {
            return Err(Error::Config("repository name is empty".to_string()));
        }

        Ok(Self {
            index: parse_endpoint(index)?,
            registry: None,
            proxy: None,
            system_proxy: true,
            insecure: false,
            repository,
            username: String::new(),
            password: String::new(),
            connect_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(300),
            user_agent: format!(
                "layerpeek/{} ({}-{})",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
        })
    }

    /// Registry host that serves `/v2/` when it differs from the index.
    pub fn with_registry(mut self, registry: Option<&str>) -> Result<Self> {
        self.registry = registry.map(parse_endpoint).transpose()?;
        Ok(self)
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy.filter(|p| !p.is_empty());
        self
    }

    /// Whether `HTTP_PROXY`/`HTTPS_PROXY` from the environment apply when no
    /// explicit proxy is set.
    pub fn with_system_proxy(mut self, enabled: bool) -> Self {
        self.system_proxy = enabled;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn index(&self) -> &Url {
        &self.index
    }

    pub fn registry(&self) -> Option<&Url> {
        self.registry.as_ref()
    }

    /// Base URL every `/v2/` request is resolved against.
    pub fn base_url(&self) -> &Url {
        self.registry.as_ref().unwrap_or(&self.index)
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url().join(path)?)
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn system_proxy(&self) -> bool {
        self.system_proxy
    }

    pub fn insecure(&self) -> bool {
        self.insecure
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

/// `repository[:tag]` as typed on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    pub repository: String,
    pub tag: String,
}

impl ImageName {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        // A colon before the last slash belongs to a registry port.
        let (repository, tag) = match reference.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => (repository, tag),
            _ => (reference, DEFAULT_TAG),
        };

        if repository.is_empty() || tag.is_empty() {
            return Err(Error::Config(format!(
                "invalid image reference: {:?}",
                reference
            )));
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Official images live under `library/` on the default index.
    pub fn with_library_prefix(mut self) -> Self {
        if !self.repository.contains('/') {
            self.repository = format!("library/{}", self.repository);
        }
        self
    }

    /// File name of the packaged bundle: `<repo>_<tag>.tar.gz`, slashes replaced.
    pub fn bundle_file_name(&self) -> String {
        format!("{}_{}.tar.gz", self.repository.replace('/', "_"), self.tag)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}
