//! HTTP health checks and downloads.

use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound for downloaded artifacts
pub const MAX_DOWNLOAD_SIZE: u64 = 512 * 1024 * 1024;

fn agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .user_agent("rigger")
        .build();
    ureq::Agent::new_with_config(config)
}

/// Status code returned for `url`, or `None` if nothing answered
///
/// Connection failures are not errors: a service that is still starting is
/// exactly what a health check is meant to observe.
pub fn probe_status(url: &str, timeout: Duration) -> Option<u16> {
    match agent(timeout).get(url).call() {
        Ok(response) => Some(response.status().as_u16()),
        Err(e) => {
            log::debug!("GET {} failed: {}", url, e);
            None
        }
    }
}

/// Download `url` into memory
pub fn download(url: &str, timeout: Duration) -> Result<Vec<u8>> {
    log::info!("Downloading {}", url);
    let mut response = agent(timeout).get(url).call().map_err(|e| Error::Network {
        message: format!("GET {}: {}", url, e),
        status: None,
    })?;

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        return Err(Error::Network {
            message: format!("GET {}: HTTP {}", url, status),
            status: Some(status),
        });
    }

    response
        .body_mut()
        .with_config()
        .limit(MAX_DOWNLOAD_SIZE)
        .read_to_vec()
        .map_err(|e| Error::Network {
            message: format!("reading {}: {}", url, e),
            status: None,
        })
}
