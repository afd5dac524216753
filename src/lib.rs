/*
Device-side client for a cloud firmware-over-the-air job service.

It provides tools to provision the device against the backend, discover
pending firmware jobs, report job status transitions and publish device
state, each as an independent one-shot HTTPS exchange. Connection
strategy (static address failover, carrier APN binding, TLS server name
pinning) and credential signing live here; applying a downloaded image
and reading device identity belong to the host application.
*/

mod client;
mod config;
mod device;
mod error;
mod extract;
mod job;
mod token;
mod transport;

pub use client::{FotaClient, ProvisionOutcome};
pub use config::{ApiVersion, Config, ConfigError, DEFAULT_API_HOSTNAME, DEFAULT_API_PORT};
pub use device::{DeviceInfo, DeviceInfoError};
pub use error::Error;
pub use extract::ExtractError;
pub use job::{Job, JobStatus, UnknownStatusError};
pub use token::{Token, TokenError, MAX_DEVICE_ID_LEN};
pub use transport::TransportError;
