use std::str::FromStr;
use thiserror::Error;

use crate::config::ApiVersion;

/// A firmware update work item as reported by the job service.
///
/// Either fully populated by [`crate::FotaClient::get_pending_job`] or not
/// observable at all; the client never hands out a partially filled job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    /// Server-assigned identifier, unique per job.
    pub id: String,
    /// Firmware download server hostname.
    pub host: String,
    /// Firmware object path on that host.
    pub path: String,
    pub status: JobStatus,
}

/// Job execution states understood by the job service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    InProgress,
    Failed,
    Succeeded,
    TimedOut,
    Canceled,
    Rejected,
    Downloading,
}

impl JobStatus {
    /// The string the selected API revision expects on the wire, or `None`
    /// for a member that revision does not know about.
    ///
    /// The V2 vocabulary predates the `Downloading` state and spells the
    /// cancelled state with a single L.
    pub fn as_wire(self, version: ApiVersion) -> Option<&'static str> {
        match (self, version) {
            (JobStatus::Queued, _) => Some("QUEUED"),
            (JobStatus::InProgress, _) => Some("IN_PROGRESS"),
            (JobStatus::Failed, _) => Some("FAILED"),
            (JobStatus::Succeeded, _) => Some("SUCCEEDED"),
            (JobStatus::TimedOut, _) => Some("TIMED_OUT"),
            (JobStatus::Canceled, ApiVersion::V1) => Some("CANCELLED"),
            (JobStatus::Canceled, ApiVersion::V2) => Some("CANCELED"),
            (JobStatus::Rejected, _) => Some("REJECTED"),
            (JobStatus::Downloading, ApiVersion::V1) => Some("DOWNLOADING"),
            (JobStatus::Downloading, ApiVersion::V2) => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("unrecognized job status: {0}")]
pub struct UnknownStatusError(String);

impl FromStr for JobStatus {
    type Err = UnknownStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "FAILED" => Ok(JobStatus::Failed),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "TIMED_OUT" => Ok(JobStatus::TimedOut),
            "CANCELLED" | "CANCELED" => Ok(JobStatus::Canceled),
            "REJECTED" => Ok(JobStatus::Rejected),
            "DOWNLOADING" => Ok(JobStatus::Downloading),
            other => Err(UnknownStatusError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_strings_follow_the_selected_vocabulary() {
        assert_eq!(
            JobStatus::Canceled.as_wire(ApiVersion::V1),
            Some("CANCELLED")
        );
        assert_eq!(
            JobStatus::Canceled.as_wire(ApiVersion::V2),
            Some("CANCELED")
        );
        assert_eq!(
            JobStatus::Downloading.as_wire(ApiVersion::V1),
            Some("DOWNLOADING")
        );
        assert_eq!(JobStatus::Downloading.as_wire(ApiVersion::V2), None);
        assert_eq!(
            JobStatus::Succeeded.as_wire(ApiVersion::V2),
            Some("SUCCEEDED")
        );
    }

    #[test]
    fn statuses_parse_from_either_spelling() {
        assert_eq!("CANCELLED".parse::<JobStatus>().unwrap(), JobStatus::Canceled);
        assert_eq!("CANCELED".parse::<JobStatus>().unwrap(), JobStatus::Canceled);
        assert_eq!("TIMED_OUT".parse::<JobStatus>().unwrap(), JobStatus::TimedOut);
        assert!("PAUSED".parse::<JobStatus>().is_err());
    }
}
