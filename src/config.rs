use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Job API endpoint used when no hostname override is set.
pub const DEFAULT_API_HOSTNAME: &str = "static.api.nrfcloud.com";
pub const DEFAULT_API_PORT: u16 = 443;

/// Anycast addresses fronting the job API. Tried in order when the
/// hostname has not been overridden, so a device with broken DNS can
/// still reach the service.
pub(crate) const API_STATIC_IPS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(75, 2, 37, 83)),
    IpAddr::V4(Ipv4Addr::new(99, 83, 231, 82)),
];

pub(crate) const PROVISION_PORT: u16 = 8443;

/// Interface names longer than this cannot be bound on the modem side.
const MAX_APN_LEN: usize = 15;

/// Which revision of the server API to speak.
///
/// The two revisions differ in the provisioning endpoint, the job status
/// vocabulary, the shape of the get-job response body and the service
/// info tag reported in the device state document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiVersion {
    #[default]
    V1,
    V2,
}

impl ApiVersion {
    pub(crate) fn provision_hostname(self) -> &'static str {
        match self {
            ApiVersion::V1 => "a2n7tk1kp18wix-ats.iot.us-east-1.amazonaws.com",
            ApiVersion::V2 => "a1jtaajis3u27i-ats.iot.us-east-1.amazonaws.com",
        }
    }

    /// Key under `reported.device.serviceInfo` in the device state document.
    pub(crate) fn service_info_tag(self) -> &'static str {
        match self {
            ApiVersion::V1 => "fota_v2",
            ApiVersion::V2 => "fota_v1",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("access point name must be between 1 and {MAX_APN_LEN} characters")]
    InvalidApn,

    #[error("invalid trust anchor: {0}")]
    InvalidTrustAnchor(String),
}

/// Client configuration plus the runtime endpoint override store.
///
/// Overrides are optional; each one replaces the compiled-in default for
/// every operation issued after it is set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    api_version: ApiVersion,

    /// Symmetric secret shared with the job service, used to sign tokens.
    shared_secret: String,

    /// Carrier APN to bind job API sockets to. Provisioning never uses it.
    #[serde(default)]
    apn: Option<String>,

    /// PEM trust anchor pinned for all TLS connections. When unset the
    /// system roots are used.
    #[serde(default)]
    trust_anchor_pem: Option<String>,

    #[serde(default = "default_true")]
    use_static_ips: bool,

    #[serde(default)]
    api_hostname: Option<String>,
    #[serde(default)]
    api_port: Option<u16>,
    #[serde(default)]
    fw_hostname: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn new(shared_secret: impl Into<String>) -> Self {
        Self {
            api_version: ApiVersion::default(),
            shared_secret: shared_secret.into(),
            apn: None,
            trust_anchor_pem: None,
            use_static_ips: true,
            api_hostname: None,
            api_port: None,
            fw_hostname: None,
        }
    }

    pub fn with_api_version(mut self, version: ApiVersion) -> Self {
        self.api_version = version;
        self
    }

    pub fn with_apn(mut self, apn: impl Into<String>) -> Self {
        self.apn = Some(apn.into());
        self
    }

    pub fn with_trust_anchor(mut self, pem: impl Into<String>) -> Self {
        self.trust_anchor_pem = Some(pem.into());
        self
    }

    pub fn with_static_ips(mut self, enabled: bool) -> Self {
        self.use_static_ips = enabled;
        self
    }

    /// Checked before the first connection is attempted.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if let Some(apn) = &self.apn {
            if apn.is_empty() || apn.len() > MAX_APN_LEN {
                return Err(ConfigError::InvalidApn);
            }
        }
        Ok(())
    }

    pub fn set_api_hostname(&mut self, hostname: impl Into<String>) {
        self.api_hostname = Some(hostname.into());
    }

    pub fn api_hostname(&self) -> &str {
        self.api_hostname.as_deref().unwrap_or(DEFAULT_API_HOSTNAME)
    }

    pub fn set_api_port(&mut self, port: u16) {
        self.api_port = Some(port);
    }

    pub fn api_port(&self) -> u16 {
        self.api_port.unwrap_or(DEFAULT_API_PORT)
    }

    pub fn set_fw_hostname(&mut self, hostname: impl Into<String>) {
        self.fw_hostname = Some(hostname.into());
    }

    /// Firmware download hostname override, if one is set. There is no
    /// compiled-in default; without an override the hostname comes from
    /// the connection or the job document.
    pub fn fw_hostname(&self) -> Option<&str> {
        self.fw_hostname.as_deref()
    }

    pub fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    pub(crate) fn shared_secret(&self) -> &[u8] {
        self.shared_secret.as_bytes()
    }

    pub(crate) fn apn(&self) -> Option<&str> {
        self.apn.as_deref()
    }

    pub(crate) fn trust_anchor_pem(&self) -> Option<&str> {
        self.trust_anchor_pem.as_deref()
    }

    /// Addresses to walk for job API connections, empty when dialing by
    /// DNS is required.
    pub(crate) fn static_ip_pool(&self) -> &'static [IpAddr] {
        // An explicit hostname override always dials by name
        if self.use_static_ips && self.api_hostname.is_none() {
            &API_STATIC_IPS
        } else {
            &[]
        }
    }
}
