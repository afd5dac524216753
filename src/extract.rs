use thiserror::Error;

use crate::config::ApiVersion;
use crate::job::{Job, JobStatus};

/// One field of the job document grammar: everything between the first
/// occurrence of `begin` and the first occurrence of `end` after it.
struct Field {
    name: &'static str,
    begin: &'static str,
    end: &'static str,
}

const JOB_ID: Field = Field {
    name: "job id",
    begin: "\"jobId\":\"",
    end: "\"",
};

const FW_PATH: Field = Field {
    name: "firmware path",
    begin: "\"path\":\"",
    end: "\",",
};

const FW_URI: Field = Field {
    name: "firmware uri",
    begin: "\"uris\":[\"",
    end: "\"",
};

const FW_HOST: Field = Field {
    name: "firmware host",
    begin: "\"host\":\"",
    end: "\",",
};

/// Object path prefix for firmware served through the V2 job document,
/// which carries bare file names in its uri list.
const FW_PATH_PREFIX: &str = "v1/firmwares/modem/";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{0} field not found in response")]
    MissingField(&'static str),

    #[error("{0} field is not terminated")]
    UnterminatedField(&'static str),
}

fn scan<'a>(body: &'a str, field: &Field) -> Result<&'a str, ExtractError> {
    let start = body
        .find(field.begin)
        .ok_or(ExtractError::MissingField(field.name))?
        + field.begin.len();
    let len = body[start..]
        .find(field.end)
        .ok_or(ExtractError::UnterminatedField(field.name))?;
    Ok(&body[start..start + len])
}

/// Pull the pending job fields out of a get-job response body.
///
/// This is a marker scan, not a JSON parser: no unescaping is performed
/// and marker uniqueness within the document is trusted. `host_hint`
/// carries a hostname already resolved by the caller (an explicit
/// override, or the address the connection was made through); when it is
/// set the body's host field is not consulted at all.
///
/// Any failure yields only the error; no partially populated job can be
/// observed.
pub(crate) fn extract_job(
    body: &str,
    version: ApiVersion,
    host_hint: Option<&str>,
) -> Result<Job, ExtractError> {
    let host = match host_hint {
        Some(host) => host.to_string(),
        None => scan(body, &FW_HOST)?.to_string(),
    };

    let id = scan(body, &JOB_ID)?.to_string();

    let path = match version {
        ApiVersion::V1 => scan(body, &FW_PATH)?.to_string(),
        ApiVersion::V2 => format!("{FW_PATH_PREFIX}{}", scan(body, &FW_URI)?),
    };

    Ok(Job {
        id,
        host,
        path,
        status: JobStatus::InProgress,
    })
}
