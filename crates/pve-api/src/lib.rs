//! Typed Rust client for the Proxmox VE REST API.
//!
//! Covers the read-only subset needed to track provisioned guests:
//! nodes, qemu/lxc listings, guest status, guest-agent interfaces,
//! container config and container interfaces.

mod types;

pub use types::*;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;

const DEFAULT_PORT: u16 = 8006;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pve api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("pve api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("invalid api token (expected user@realm!name=secret)")]
    InvalidToken,
}

pub type Result<T> = std::result::Result<T, Error>;

/// API token triplet: `user@realm!token-name=secret`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiToken {
    pub user: String,
    pub name: String,
    secret: String,
}

impl ApiToken {
    fn header_value(&self) -> String {
        format!("PVEAPIToken={}!{}={}", self.user, self.name, self.secret)
    }
}

impl FromStr for ApiToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches("PVEAPIToken=");
        let (user, rest) = s.split_once('!').ok_or(Error::InvalidToken)?;
        let (name, secret) = rest.split_once('=').ok_or(Error::InvalidToken)?;
        if user.is_empty() || name.is_empty() || secret.is_empty() {
            return Err(Error::InvalidToken);
        }
        Ok(Self {
            user: user.to_string(),
            name: name.to_string(),
            secret: secret.to_string(),
        })
    }
}

// Never print the secret.
impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiToken")
            .field("user", &self.user)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Guest flavour in URL paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestKind {
    Qemu,
    Lxc,
}

impl GuestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::Lxc => "lxc",
        }
    }
}

/// Client for the Proxmox VE REST API.
#[derive(Clone)]
pub struct PveClient {
    base_url: String,
    token: ApiToken,
    http: reqwest::Client,
}

impl PveClient {
    /// Build a client for `https://{server}:{port}/api2/json`.
    ///
    /// `accept_invalid_certs` disables TLS verification; only for hosts still
    /// running the self-signed certificate Proxmox installs by default.
    pub fn new(
        server: &str,
        port: Option<u16>,
        token: ApiToken,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;

        Ok(Self {
            base_url: format!(
                "https://{server}:{}/api2/json",
                port.unwrap_or(DEFAULT_PORT)
            ),
            token,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, endpoint: &'static str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .header("Authorization", self.token.header_value())
            .send()
            .await?;

        let envelope: Envelope<T> = Self::check(resp, endpoint).await?.json().await?;
        Ok(envelope.data)
    }

    // ── Inventory ────────────────────────────────────────────────────

    pub async fn list_nodes(&self) -> Result<Vec<NodeListItem>> {
        self.get("/nodes", "list nodes").await
    }

    pub async fn list_guests(&self, node: &str, kind: GuestKind) -> Result<Vec<GuestListItem>> {
        self.get(&format!("/nodes/{node}/{}", kind.as_str()), "list guests")
            .await
    }

    pub async fn guest_status(&self, node: &str, kind: GuestKind, vmid: u32) -> Result<GuestStatus> {
        self.get(
            &format!("/nodes/{node}/{}/{vmid}/status/current", kind.as_str()),
            "guest status",
        )
        .await
    }

    // ── Networking ───────────────────────────────────────────────────

    pub async fn agent_network_interfaces(&self, node: &str, vmid: u32) -> Result<AgentNetwork> {
        self.get(
            &format!("/nodes/{node}/qemu/{vmid}/agent/network-get-interfaces"),
            "agent network-get-interfaces",
        )
        .await
    }

    pub async fn container_config(&self, node: &str, vmid: u32) -> Result<ContainerConfig> {
        self.get(&format!("/nodes/{node}/lxc/{vmid}/config"), "container config")
            .await
    }

    pub async fn container_interfaces(&self, node: &str, vmid: u32) -> Result<ContainerInterfaces> {
        self.get(
            &format!("/nodes/{node}/lxc/{vmid}/interfaces"),
            "container interfaces",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_triplet_parses() {
        let token: ApiToken = "root@pam!fleet=0b6c-44aa".parse().unwrap();
        assert_eq!(token.user, "root@pam");
        assert_eq!(token.name, "fleet");
        assert_eq!(token.header_value(), "PVEAPIToken=root@pam!fleet=0b6c-44aa");
    }

    #[test]
    fn token_accepts_header_prefix() {
        let token: ApiToken = "PVEAPIToken=ops@pve!ci=s3cret".parse().unwrap();
        assert_eq!(token.header_value(), "PVEAPIToken=ops@pve!ci=s3cret");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for raw in ["", "root@pam", "root@pam!fleet", "!fleet=x", "root@pam!=x", "root@pam!fleet="] {
            assert!(raw.parse::<ApiToken>().is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn debug_output_hides_secret() {
        let token: ApiToken = "root@pam!fleet=topsecret".parse().unwrap();
        assert!(!format!("{token:?}").contains("topsecret"));
    }

    #[test]
    fn base_url_uses_default_port() {
        let token: ApiToken = "root@pam!fleet=x".parse().unwrap();
        let client = PveClient::new("pve.lan", None, token, false).unwrap();
        assert_eq!(client.base_url(), "https://pve.lan:8006/api2/json");
    }
}
