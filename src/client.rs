use reqwest::{Method, StatusCode};
use serde_json::json;
use std::net::IpAddr;
use tracing::{debug, instrument, warn};

use crate::config::{ApiVersion, Config, PROVISION_PORT};
use crate::device::DeviceInfo;
use crate::error::Error;
use crate::extract;
use crate::job::Job;
use crate::token::{self, Token};
use crate::transport::{
    Connector, Endpoint, HttpReply, HttpRequest, TlsConnector, TransportError,
    API_REQUEST_TIMEOUT, PROVISION_REQUEST_TIMEOUT,
};

const FIRMWARE_TYPE: &str = "MODEM";
const PROVISION_PATH: &str = "/topics/jitp?qos=1";

/// What came of a provisioning request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The backend accepted the request and is registering the device;
    /// poll again after a grace period.
    InProgress,
    /// The backend already knows this device.
    AlreadyProvisioned,
}

/// Device-side client for the firmware job service.
///
/// Owns the endpoint configuration and override store. The four
/// operations are independent one-shot calls; each one dials its own
/// connection, generates its own token where auth is required and holds
/// no state a later call could observe.
pub struct FotaClient {
    config: Config,
    device: Box<dyn DeviceInfo>,
    connector: Box<dyn Connector>,
}

impl FotaClient {
    pub fn new(config: Config, device: impl DeviceInfo + 'static) -> Result<Self, Error> {
        config.validate()?;
        let connector = TlsConnector::new(
            config.apn().map(str::to_owned),
            config.trust_anchor_pem(),
        )?;
        Ok(Self {
            config,
            device: Box::new(device),
            connector: Box::new(connector),
        })
    }

    #[allow(dead_code)]
    fn with_connector(
        config: Config,
        device: impl DeviceInfo + 'static,
        connector: impl Connector + 'static,
    ) -> Self {
        Self {
            config,
            device: Box::new(device),
            connector: Box::new(connector),
        }
    }

    /// Override the job API hostname for all subsequent operations.
    pub fn set_api_hostname(&mut self, hostname: impl Into<String>) {
        self.config.set_api_hostname(hostname);
    }

    /// Override the job API port for all subsequent operations.
    pub fn set_api_port(&mut self, port: u16) {
        self.config.set_api_port(port);
    }

    /// Override the firmware download hostname reported in jobs.
    pub fn set_fw_hostname(&mut self, hostname: impl Into<String>) {
        self.config.set_fw_hostname(hostname);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Generate a signed credential for this device.
    ///
    /// When `device_id` is not supplied it is read from the device info
    /// provider. Every operation that authenticates calls this for a
    /// fresh token; there is no caching.
    pub async fn generate_token(&self, device_id: Option<&str>) -> Result<Token, Error> {
        let owned;
        let id = match device_id {
            Some(id) => id,
            None => {
                owned = self.device.device_id().await?;
                &owned
            }
        };
        Ok(token::generate(id, self.config.shared_secret())?)
    }

    /// Ask the provisioning endpoint to register this device.
    ///
    /// The exchange is unauthenticated, carries no body and never uses
    /// the carrier APN. The normal first-contact outcome is the server
    /// dropping the connection without a reply while registration runs
    /// in the background.
    #[instrument(skip_all)]
    pub async fn provision(&self) -> Result<ProvisionOutcome, Error> {
        let endpoint = Endpoint::new(
            self.config.api_version().provision_hostname(),
            PROVISION_PORT,
        );
        let request = HttpRequest {
            method: Method::POST,
            path: PROVISION_PATH.to_string(),
            accept: "*/*",
            bearer: None,
            body: None,
            connection_close: true,
            timeout: PROVISION_REQUEST_TIMEOUT,
        };

        let reply = match self.connector.exchange(&endpoint, &request).await {
            Ok(reply) => reply,
            Err(TransportError::NoResponse(reason)) => {
                debug!(%reason, "no reply to provisioning request, registration should be underway");
                return Ok(ProvisionOutcome::InProgress);
            }
            Err(err) => return Err(err.into()),
        };

        match reply.status {
            StatusCode::FORBIDDEN => {
                debug!("device is already provisioned");
                Ok(ProvisionOutcome::AlreadyProvisioned)
            }
            status => {
                warn!(response = %status, "unexpected provisioning response");
                Err(Error::UnexpectedStatus(status))
            }
        }
    }

    /// Fetch the latest pending firmware job for this device.
    ///
    /// `Ok(None)` means the server answered and there is nothing queued.
    /// A returned job is fully populated and marked in progress.
    #[instrument(skip_all, err(level = "warn"))]
    pub async fn get_pending_job(&self) -> Result<Option<Job>, Error> {
        let device_id = self.device.device_id().await?;
        let token = token::generate(&device_id, self.config.shared_secret())?;

        let request = HttpRequest {
            method: Method::GET,
            path: format!(
                "/v1/fota-job-executions/{device_id}/latest?firmwareType={FIRMWARE_TYPE}"
            ),
            accept: "application/json",
            bearer: Some(token.into_bearer()),
            body: None,
            connection_close: false,
            timeout: API_REQUEST_TIMEOUT,
        };

        let (reply, connected_ip) = self.dispatch_api(&request).await?;

        match reply.status {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::OK => {
                let connected;
                let host_hint = match (self.config.fw_hostname(), connected_ip) {
                    (Some(host), _) => Some(host),
                    (None, Some(ip)) => {
                        connected = ip.to_string();
                        Some(connected.as_str())
                    }
                    (None, None) => None,
                };

                let job =
                    extract::extract_job(&reply.body, self.config.api_version(), host_hint)?;
                debug!(job_id = %job.id, host = %job.host, "pending job found");
                Ok(Some(job))
            }
            status => {
                warn!(response = %status, "unexpected job query response");
                Err(Error::UnexpectedStatus(status))
            }
        }
    }

    /// Report a job's status transition back to the job service.
    ///
    /// Argument validation happens before any network activity: the job
    /// must carry an id and its status must exist in the wire vocabulary
    /// of the selected API revision.
    #[instrument(skip_all, fields(job_id = %job.id, status = ?job.status), err(level = "warn"))]
    pub async fn update_job_status(&self, job: &Job) -> Result<(), Error> {
        if job.id.is_empty() {
            return Err(Error::MissingJobId);
        }
        let version = self.config.api_version();
        let wire = job
            .status
            .as_wire(version)
            .ok_or(Error::UnknownStatus(job.status, version))?;

        let device_id = self.device.device_id().await?;
        let token = token::generate(&device_id, self.config.shared_secret())?;

        let request = HttpRequest {
            method: Method::PATCH,
            path: format!("/v1/fota-job-executions/{device_id}/{}", job.id),
            accept: "*/*",
            bearer: Some(token.into_bearer()),
            body: Some(json!({ "status": wire }).to_string()),
            connection_close: false,
            timeout: API_REQUEST_TIMEOUT,
        };

        let (reply, _) = self.dispatch_api(&request).await?;

        match reply.status {
            StatusCode::OK => Ok(()),
            status => {
                warn!(response = %status, "job update rejected");
                Err(Error::UnexpectedStatus(status))
            }
        }
    }

    /// Publish the device's shadow state, including the installed modem
    /// firmware version and the update service it supports.
    #[instrument(skip_all, err(level = "warn"))]
    pub async fn report_device_state(&self) -> Result<(), Error> {
        let device_id = self.device.device_id().await?;
        let token = token::generate(&device_id, self.config.shared_secret())?;
        let firmware_version = self.device.firmware_version().await?;

        let request = HttpRequest {
            method: Method::PATCH,
            path: format!("/v1/devices/{device_id}/state"),
            accept: "*/*",
            bearer: Some(token.into_bearer()),
            body: Some(
                device_state_body(self.config.api_version(), &firmware_version).to_string(),
            ),
            connection_close: false,
            timeout: API_REQUEST_TIMEOUT,
        };

        let (reply, _) = self.dispatch_api(&request).await?;

        match reply.status {
            StatusCode::ACCEPTED => Ok(()),
            status => {
                warn!(response = %status, "state report rejected");
                Err(Error::UnexpectedStatus(status))
            }
        }
    }

    /// Job API dispatch. Walks the static address pool unless an explicit
    /// hostname override is active, and reports back the address the
    /// exchange went through so the caller can infer the firmware host.
    async fn dispatch_api(
        &self,
        request: &HttpRequest,
    ) -> Result<(HttpReply, Option<IpAddr>), TransportError> {
        let hostname = self.config.api_hostname();
        let port = self.config.api_port();
        let pool = self.config.static_ip_pool();

        if pool.is_empty() {
            let mut endpoint = Endpoint::new(hostname, port);
            endpoint.use_apn = true;
            let reply = self.connector.exchange(&endpoint, request).await?;
            return Ok((reply, None));
        }

        let mut last_err = None;
        for &ip in pool {
            let mut endpoint = Endpoint::new(hostname, port);
            endpoint.use_apn = true;
            endpoint.pin_ip = Some(ip);

            match self.connector.exchange(&endpoint, request).await {
                Ok(reply) => return Ok((reply, Some(ip))),
                Err(err) => {
                    warn!(address = %ip, error = %err, "exchange attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.expect("static address pool is never empty here"))
    }
}

fn device_state_body(version: ApiVersion, modem_firmware: &str) -> serde_json::Value {
    let mut service_info = serde_json::Map::new();
    service_info.insert(
        version.service_info_tag().to_string(),
        json!([FIRMWARE_TYPE]),
    );

    json!({
        "reported": {
            "device": {
                "deviceInfo": { "modemFirmware": modem_firmware },
                "serviceInfo": service_info
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::API_STATIC_IPS;
    use crate::job::JobStatus;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    const DEVICE_ID: &str = "nrf-352656100000001";
    const FIRMWARE_VERSION: &str = "mfw_nrf9160_1.2.2";

    struct TestDevice;

    #[async_trait]
    impl DeviceInfo for TestDevice {
        async fn device_id(&self) -> Result<String, crate::device::DeviceInfoError> {
            Ok(DEVICE_ID.to_string())
        }

        async fn firmware_version(&self) -> Result<String, crate::device::DeviceInfoError> {
            Ok(FIRMWARE_VERSION.to_string())
        }
    }

    /// Scripted connector that records every attempt it sees.
    #[derive(Clone, Default)]
    struct StubConnector {
        inner: Arc<StubInner>,
    }

    #[derive(Default)]
    struct StubInner {
        replies: Mutex<VecDeque<Result<HttpReply, TransportError>>>,
        attempts: Mutex<Vec<(Endpoint, HttpRequest)>>,
    }

    impl StubConnector {
        fn scripted(replies: Vec<Result<HttpReply, TransportError>>) -> Self {
            Self {
                inner: Arc::new(StubInner {
                    replies: Mutex::new(replies.into()),
                    attempts: Mutex::new(Vec::new()),
                }),
            }
        }

        fn reply(status: StatusCode, body: &str) -> Result<HttpReply, TransportError> {
            Ok(HttpReply {
                status,
                body: body.to_string(),
            })
        }

        fn attempts(&self) -> Vec<(Endpoint, HttpRequest)> {
            self.inner.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for StubConnector {
        async fn exchange(
            &self,
            endpoint: &Endpoint,
            request: &HttpRequest,
        ) -> Result<HttpReply, TransportError> {
            self.inner
                .attempts
                .lock()
                .unwrap()
                .push((endpoint.clone(), request.clone()));
            self.inner
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connect("no scripted reply".to_string())))
        }
    }

    fn client_with(config: Config, stub: &StubConnector) -> FotaClient {
        FotaClient::with_connector(config, TestDevice, stub.clone())
    }

    fn job(id: &str, status: JobStatus) -> Job {
        Job {
            id: id.to_string(),
            host: "fw.example.com".to_string(),
            path: "v1/firmwares/modem/x.bin".to_string(),
            status,
        }
    }

    #[tokio::test]
    async fn update_with_empty_job_id_fails_before_dialing() {
        let stub = StubConnector::default();
        let client = client_with(Config::new("secret"), &stub);

        let err = client
            .update_job_status(&job("", JobStatus::Succeeded))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MissingJobId));
        assert!(stub.attempts().is_empty());
    }

    #[tokio::test]
    async fn update_with_status_outside_the_vocabulary_fails_before_dialing() {
        let stub = StubConnector::default();
        let config = Config::new("secret").with_api_version(ApiVersion::V2);
        let client = client_with(config, &stub);

        let err = client
            .update_job_status(&job("job-1", JobStatus::Downloading))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::UnknownStatus(JobStatus::Downloading, ApiVersion::V2)
        ));
        assert!(stub.attempts().is_empty());
    }

    #[tokio::test]
    async fn update_patches_the_wire_status() {
        let stub = StubConnector::scripted(vec![StubConnector::reply(StatusCode::OK, "")]);
        let client = client_with(Config::new("secret"), &stub);

        client
            .update_job_status(&job("job-1", JobStatus::Succeeded))
            .await
            .unwrap();

        let attempts = stub.attempts();
        assert_eq!(attempts.len(), 1);
        let (endpoint, request) = &attempts[0];
        assert_eq!(request.method, Method::PATCH);
        assert_eq!(
            request.path,
            format!("/v1/fota-job-executions/{DEVICE_ID}/job-1")
        );
        assert_eq!(request.body.as_deref(), Some("{\"status\":\"SUCCEEDED\"}"));
        assert!(request
            .bearer
            .as_deref()
            .unwrap()
            .starts_with("Bearer "));
        assert!(endpoint.use_apn);
    }

    #[tokio::test]
    async fn update_requires_an_ok_reply() {
        let stub = StubConnector::scripted(vec![StubConnector::reply(StatusCode::CONFLICT, "")]);
        let client = client_with(Config::new("secret"), &stub);

        let err = client
            .update_job_status(&job("job-1", JobStatus::Failed))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::UnexpectedStatus(StatusCode::CONFLICT)
        ));
    }

    #[tokio::test]
    async fn get_pending_job_returns_none_when_nothing_is_queued() {
        let stub = StubConnector::scripted(vec![StubConnector::reply(StatusCode::NOT_FOUND, "")]);
        let client = client_with(Config::new("secret"), &stub);

        assert_eq!(client.get_pending_job().await.unwrap(), None);

        let attempts = stub.attempts();
        let (_, request) = &attempts[0];
        assert_eq!(request.method, Method::GET);
        assert_eq!(
            request.path,
            format!("/v1/fota-job-executions/{DEVICE_ID}/latest?firmwareType=MODEM")
        );
        assert!(request.bearer.is_some());
    }

    #[tokio::test]
    async fn get_pending_job_extracts_fields_from_the_body() {
        let body = concat!(
            "{\"jobId\":\"abc123\",",
            "\"path\":\"v1/firmwares/modem/x.bin\",",
            "\"host\":\"fw.example.com\",",
            "\"other\":1}",
        );
        let stub = StubConnector::scripted(vec![StubConnector::reply(StatusCode::OK, body)]);
        // Dial by DNS so the host comes from the job document
        let config = Config::new("secret").with_static_ips(false);
        let client = client_with(config, &stub);

        let job = client.get_pending_job().await.unwrap().unwrap();
        assert_eq!(job.id, "abc123");
        assert_eq!(job.path, "v1/firmwares/modem/x.bin");
        assert_eq!(job.host, "fw.example.com");
        assert_eq!(job.status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn get_pending_job_prefers_the_hostname_override() {
        let body = "{\"jobId\":\"abc123\",\"path\":\"v1/firmwares/modem/x.bin\",\"host\":\"fw.example.com\",\"x\":1}";
        let stub = StubConnector::scripted(vec![StubConnector::reply(StatusCode::OK, body)]);
        let config = Config::new("secret").with_static_ips(false);
        let mut client = client_with(config, &stub);
        client.set_fw_hostname("mirror.example.net");

        let job = client.get_pending_job().await.unwrap().unwrap();
        assert_eq!(job.host, "mirror.example.net");
    }

    #[tokio::test]
    async fn get_pending_job_fails_atomically_on_a_malformed_body() {
        let stub = StubConnector::scripted(vec![StubConnector::reply(
            StatusCode::OK,
            "{\"unrelated\":true}",
        )]);
        let config = Config::new("secret").with_static_ips(false);
        let client = client_with(config, &stub);

        assert!(matches!(
            client.get_pending_job().await.unwrap_err(),
            Error::Parse(_)
        ));
    }

    #[tokio::test]
    async fn get_pending_job_rejects_other_statuses() {
        let stub = StubConnector::scripted(vec![StubConnector::reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            "",
        )]);
        let client = client_with(Config::new("secret"), &stub);

        assert!(matches!(
            client.get_pending_job().await.unwrap_err(),
            Error::UnexpectedStatus(StatusCode::INTERNAL_SERVER_ERROR)
        ));
    }

    #[tokio::test]
    async fn failover_walks_the_pool_and_infers_the_host() {
        // First address refuses, second serves a job document with no
        // host field; the host must be the address that connected.
        let body = "{\"jobId\":\"abc123\",\"path\":\"v1/firmwares/modem/x.bin\",\"extra\":0}";
        let stub = StubConnector::scripted(vec![
            Err(TransportError::Connect("connection refused".to_string())),
            StubConnector::reply(StatusCode::OK, body),
        ]);
        let client = client_with(Config::new("secret"), &stub);

        let job = client.get_pending_job().await.unwrap().unwrap();
        assert_eq!(job.host, API_STATIC_IPS[1].to_string());

        let attempts = stub.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].0.pin_ip, Some(API_STATIC_IPS[0]));
        assert_eq!(attempts[1].0.pin_ip, Some(API_STATIC_IPS[1]));
        // SNI keeps the hostname on both attempts
        assert_eq!(attempts[0].0.hostname, attempts[1].0.hostname);
    }

    #[tokio::test]
    async fn failover_returns_the_last_error_when_the_pool_is_exhausted() {
        let stub = StubConnector::scripted(vec![
            Err(TransportError::Connect("refused".to_string())),
            Err(TransportError::Timeout("handshake timed out".to_string())),
        ]);
        let client = client_with(Config::new("secret"), &stub);

        let err = client.get_pending_job().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::Timeout(_))
        ));
        assert_eq!(stub.attempts().len(), API_STATIC_IPS.len());
    }

    #[tokio::test]
    async fn hostname_override_dials_by_name_without_the_pool() {
        let stub = StubConnector::scripted(vec![StubConnector::reply(StatusCode::NOT_FOUND, "")]);
        let mut client = client_with(Config::new("secret"), &stub);
        client.set_api_hostname("staging.example.com");
        client.set_api_port(8443);

        client.get_pending_job().await.unwrap();

        let attempts = stub.attempts();
        assert_eq!(attempts.len(), 1);
        let (endpoint, _) = &attempts[0];
        assert_eq!(endpoint.hostname, "staging.example.com");
        assert_eq!(endpoint.port, 8443);
        assert_eq!(endpoint.pin_ip, None);
    }

    #[tokio::test]
    async fn provision_forbidden_means_already_provisioned() {
        let stub = StubConnector::scripted(vec![StubConnector::reply(StatusCode::FORBIDDEN, "")]);
        let client = client_with(Config::new("secret"), &stub);

        let outcome = client.provision().await.unwrap();
        assert_eq!(outcome, ProvisionOutcome::AlreadyProvisioned);

        let attempts = stub.attempts();
        let (endpoint, request) = &attempts[0];
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.path, PROVISION_PATH);
        assert!(request.bearer.is_none());
        assert!(request.body.is_none());
        assert!(!endpoint.use_apn);
        assert_eq!(endpoint.port, PROVISION_PORT);
    }

    #[tokio::test]
    async fn provision_without_a_reply_means_registration_started() {
        let stub = StubConnector::scripted(vec![Err(TransportError::NoResponse(
            "connection closed".to_string(),
        ))]);
        let client = client_with(Config::new("secret"), &stub);

        let outcome = client.provision().await.unwrap();
        assert_eq!(outcome, ProvisionOutcome::InProgress);
    }

    #[tokio::test]
    async fn provision_rejects_other_replies_and_transport_failures() {
        let stub = StubConnector::scripted(vec![StubConnector::reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            "",
        )]);
        let client = client_with(Config::new("secret"), &stub);
        assert!(matches!(
            client.provision().await.unwrap_err(),
            Error::UnexpectedStatus(StatusCode::INTERNAL_SERVER_ERROR)
        ));

        let stub = StubConnector::scripted(vec![Err(TransportError::Connect(
            "unreachable".to_string(),
        ))]);
        let client = client_with(Config::new("secret"), &stub);
        assert!(matches!(
            client.provision().await.unwrap_err(),
            Error::Transport(TransportError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn report_device_state_requires_accepted() {
        let stub = StubConnector::scripted(vec![StubConnector::reply(StatusCode::ACCEPTED, "")]);
        let client = client_with(Config::new("secret"), &stub);

        client.report_device_state().await.unwrap();

        let attempts = stub.attempts();
        let (_, request) = &attempts[0];
        assert_eq!(request.method, Method::PATCH);
        assert_eq!(request.path, format!("/v1/devices/{DEVICE_ID}/state"));
        let body = request.body.as_deref().unwrap();
        assert!(body.contains("\"modemFirmware\":\"mfw_nrf9160_1.2.2\""));
        assert!(body.contains("\"fota_v2\":[\"MODEM\"]"));

        let stub = StubConnector::scripted(vec![StubConnector::reply(StatusCode::OK, "")]);
        let client = client_with(Config::new("secret"), &stub);
        assert!(matches!(
            client.report_device_state().await.unwrap_err(),
            Error::UnexpectedStatus(StatusCode::OK)
        ));
    }

    #[tokio::test]
    async fn v2_selects_the_beta_vocabulary_and_endpoints() {
        let stub = StubConnector::scripted(vec![StubConnector::reply(StatusCode::OK, "")]);
        let config = Config::new("secret").with_api_version(ApiVersion::V2);
        let client = client_with(config, &stub);

        client
            .update_job_status(&job("job-9", JobStatus::Canceled))
            .await
            .unwrap();

        let attempts = stub.attempts();
        assert_eq!(
            attempts[0].1.body.as_deref(),
            Some("{\"status\":\"CANCELED\"}")
        );

        let stub = StubConnector::scripted(vec![StubConnector::reply(StatusCode::FORBIDDEN, "")]);
        let config = Config::new("secret").with_api_version(ApiVersion::V2);
        let client = client_with(config, &stub);
        client.provision().await.unwrap();
        assert_eq!(
            stub.attempts()[0].0.hostname,
            "a1jtaajis3u27i-ats.iot.us-east-1.amazonaws.com"
        );
    }

    #[tokio::test]
    async fn generated_tokens_are_reproducible() {
        let stub = StubConnector::default();
        let client = client_with(Config::new("secret"), &stub);

        let explicit = client.generate_token(Some(DEVICE_ID)).await.unwrap();
        let from_device = client.generate_token(None).await.unwrap();
        assert_eq!(explicit, from_device);
    }
}
