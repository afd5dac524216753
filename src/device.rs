use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("device information unavailable: {0}")]
pub struct DeviceInfoError(String);

impl DeviceInfoError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Access to identity values owned by the modem.
///
/// The host application implements this against whatever interface exposes
/// the device identity (typically modem AT commands). The client never
/// caches the returned values; both are read fresh for every operation that
/// needs them.
#[async_trait]
pub trait DeviceInfo: Send + Sync {
    /// The identifier the cloud knows this device by.
    async fn device_id(&self) -> Result<String, DeviceInfoError>;

    /// The currently installed modem firmware version string.
    async fn firmware_version(&self) -> Result<String, DeviceInfoError>;
}
