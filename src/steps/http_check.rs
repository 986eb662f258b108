//! Wait for an HTTP endpoint to answer with the expected status

use anyhow::{Result, bail};
use converge::retry::sleep_unless_cancelled;
use converge::{ApplyContext, Fingerprint, ProbeOutcome, Step, StepHeader};
use hostkit::http;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::Host;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCheckSpec {
    pub url: String,

    #[serde(default = "default_status")]
    pub expect_status: u16,

    /// Seconds between polls while waiting
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_status() -> u16 {
    200
}

fn default_interval() -> u64 {
    2
}

impl HttpCheckSpec {
    pub fn validate(&self) -> Result<(), String> {
        if !(100..=599).contains(&self.expect_status) {
            return Err(format!("invalid HTTP status {}", self.expect_status));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(format!("unsupported url '{}'", self.url));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct HttpCheckStep {
    header: StepHeader,
    spec: HttpCheckSpec,
    host: Arc<Host>,
}

impl HttpCheckStep {
    pub fn new(header: StepHeader, spec: HttpCheckSpec, host: Arc<Host>) -> Self {
        Self { header, spec, host }
    }

    fn url(&self) -> Result<String> {
        Ok(self.host.templates.render(&self.spec.url)?)
    }
}

impl Step for HttpCheckStep {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    fn kind(&self) -> &'static str {
        "http_check"
    }

    fn description(&self) -> String {
        self.header.description.clone().unwrap_or_else(|| {
            format!("Wait for {} to answer {}", self.spec.url, self.spec.expect_status)
        })
    }

    fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::builder(self.kind())
            .json("params", &self.spec)?
            .field("url", &self.url()?)
            .finish())
    }

    fn probe(&self) -> Result<ProbeOutcome> {
        let status = http::probe_status(&self.url()?, REQUEST_TIMEOUT);
        Ok(ProbeOutcome::from_bool(status == Some(self.spec.expect_status)))
    }

    /// Poll until the endpoint answers or the step's deadline passes
    fn apply(&self, ctx: &ApplyContext) -> Result<()> {
        let url = self.url()?;
        let interval = Duration::from_secs(self.spec.interval_secs.max(1));
        let mut last = None;

        loop {
            let left = ctx.remaining();
            if left.is_zero() {
                break;
            }
            last = http::probe_status(&url, left.min(REQUEST_TIMEOUT));
            if last == Some(self.spec.expect_status) {
                return Ok(());
            }
            log::debug!("{} answered {:?}, waiting", url, last);
            if !sleep_unless_cancelled(interval.min(ctx.remaining()), &ctx.cancel) {
                bail!("Cancelled while waiting for {}", url);
            }
        }

        match last {
            Some(status) => bail!(
                "{} answered {} instead of {}",
                url,
                status,
                self.spec.expect_status
            ),
            None => bail!("{} did not answer", url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing;
    use hostkit::ScriptedRunner;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use tempfile::TempDir;

    /// Answer every request with `status` until the listener is dropped
    fn serve(status: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}/health", addr)
    }

    fn step(dir: &TempDir, url: String, expect_status: u16) -> HttpCheckStep {
        let runner = Arc::new(ScriptedRunner::new());
        HttpCheckStep::new(
            StepHeader::new("health"),
            HttpCheckSpec {
                url,
                expect_status,
                interval_secs: 1,
            },
            testing::host(&runner, dir.path()),
        )
    }

    #[test]
    fn test_probe_matches_status() {
        let dir = TempDir::new().unwrap();
        let url = serve(200);
        assert_eq!(step(&dir, url.clone(), 200).probe().unwrap(), ProbeOutcome::Satisfied);
        assert_eq!(step(&dir, url, 204).probe().unwrap(), ProbeOutcome::Unsatisfied);
    }

    #[test]
    fn test_apply_times_out_on_wrong_status() {
        let dir = TempDir::new().unwrap();
        let step = step(&dir, serve(503), 200);
        let ctx = ApplyContext::new("health", Duration::from_millis(300));
        let err = step.apply(&ctx).unwrap_err();
        assert!(err.to_string().contains("answered 503 instead of 200"));
    }

    #[test]
    fn test_apply_returns_once_healthy() {
        let dir = TempDir::new().unwrap();
        let step = step(&dir, serve(200), 200);
        step.apply(&testing::ctx("health")).unwrap();
    }

    #[test]
    fn test_apply_stops_when_cancelled() {
        let dir = TempDir::new().unwrap();
        let step = step(&dir, serve(500), 200);
        let ctx = testing::ctx("health");
        ctx.cancel.cancel();
        let err = step.apply(&ctx).unwrap_err();
        assert!(err.to_string().contains("Cancelled"));
    }

    #[test]
    fn test_validate() {
        let spec = HttpCheckSpec {
            url: "http://localhost/".to_string(),
            expect_status: 42,
            interval_secs: 2,
        };
        assert!(spec.validate().is_err());
    }
}
