//! Talks to the managed power strips fronting a rack's serial ports.
//!
//! The strips expose a line-oriented text protocol on their management
//! port (a telnet-style login followed by free-text commands). Responses
//! are scraped by recognized keywords rather than by line position, since
//! line layout shifts between firmware generations.

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::StripSettings;
use crate::error::Error;
use crate::health::HealthReport;

/// The strips' management port.
const MANAGEMENT_PORT: u16 = 23;

/// How long to wait for the login prompt.
const LOGIN_WINDOW: Duration = Duration::from_secs(5);

/// How long command responses are collected; the protocol has no
/// end-of-response marker.
const RESPONSE_WINDOW: Duration = Duration::from_secs(2);

/// Rebooting takes the strip a moment to acknowledge.
const REBOOT_WINDOW: Duration = Duration::from_secs(4);

const MAC_PATTERN: &str = r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})";

/// The power strips of one rack.
pub(crate) struct StripFleet {
    settings: StripSettings,
    http: reqwest::Client,
    hosts: RwLock<Vec<String>>,
}

impl StripFleet {
    pub(crate) fn new(settings: StripSettings) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
            hosts: RwLock::new(Vec::new()),
        }
    }

    /// Ask the rack controller which strip addresses exist and remember
    /// them. An empty answer means no strips are on this rack.
    pub(crate) async fn discover(&self) -> Result<Vec<String>, Error> {
        let response = self
            .http
            .get(&self.settings.capability_url)
            .send()
            .await
            .map_err(|e| Error::DeviceIo(format!("Capability query failed: {e}")))?;

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::DeviceIo(format!("Capability response is not JSON: {e}")))?;

        let addresses = data
            .pointer("/TCE/metadata")
            .and_then(serde_json::Value::as_array)
            .map(|strips| {
                strips
                    .iter()
                    .filter_map(|strip| strip.get("address"))
                    .filter_map(serde_json::Value::as_str)
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        info!(?addresses, "Power strips discovered");
        *self.hosts.write().await = addresses.clone();

        Ok(addresses)
    }

    /// Reboot every strip, concurrently, best effort.
    pub(crate) async fn reboot_all(&self) {
        let hosts = self.hosts.read().await.clone();

        let reboots = hosts.iter().map(|host| async move {
            match self.reboot(host).await {
                Ok(acknowledged) => info!(%host, %acknowledged, "Strip reboot issued"),
                Err(e) => warn!(%host, "Strip reboot failed: {e}"),
            }
        });

        futures::future::join_all(reboots).await;
    }

    /// Push the serial passthrough profile to every strip's outlets.
    pub(crate) async fn push_passthrough_profile_all(&self) {
        let hosts = self.hosts.read().await.clone();

        let pushes = hosts.iter().map(|host| async move {
            if let Err(e) = self.push_passthrough_profile(host).await {
                warn!(%host, "Profile push failed: {e}");
            }
        });

        futures::future::join_all(pushes).await;
    }

    /// One report per known strip: reachability plus uptime, firmware and
    /// MAC gathered over the management port.
    pub(crate) async fn health(&self) -> Vec<HealthReport> {
        let hosts = self.hosts.read().await.clone();

        let mut reports = Vec::with_capacity(hosts.len());
        for (index, host) in hosts.iter().enumerate() {
            reports.push(self.strip_health(index, host).await);
        }

        reports
    }

    async fn reboot(&self, host: &str) -> Result<bool, Error> {
        let mut session = StripSession::login(host, &self.settings).await?;
        let response = session.command("boot action=reset", REBOOT_WINDOW).await?;

        Ok(reboot_acknowledged(&response))
    }

    async fn push_passthrough_profile(&self, host: &str) -> Result<(), Error> {
        let mut session = StripSession::login(host, &self.settings).await?;

        session
            .command("set profile profile=realport port=1-32", RESPONSE_WINDOW)
            .await?;
        let check = session.command("show profile", RESPONSE_WINDOW).await?;

        // Older strips only take outlet ranges.
        if mentions_error(&check) {
            session
                .command("set profile profile=realport range=1-4", RESPONSE_WINDOW)
                .await?;
        }

        Ok(())
    }

    async fn strip_health(&self, index: usize, host: &str) -> HealthReport {
        let mut report = HealthReport {
            entity: "Power strip".to_string(),
            device_id: (index + 1).to_string(),
            is_healthy: false,
            remarks: None,
            host: Some(host.to_string()),
            metadata: None,
        };

        let mut session = match StripSession::login(host, &self.settings).await {
            Ok(session) => session,
            Err(e) => {
                report.remarks = Some(e.to_string());
                return report;
            }
        };

        report.is_healthy = true;

        let mut metadata = BTreeMap::new();

        if let Some(uptime) = self.query(&mut session, "uptime", parse_uptime).await {
            metadata.insert("uptime".to_string(), uptime);
        }
        if let Some(firmware) = self.query(&mut session, "show versions", parse_firmware).await {
            metadata.insert("firmware".to_string(), firmware);
        }
        if let Some(mac) = self.query(&mut session, "show config", parse_mac).await {
            metadata.insert("mac".to_string(), mac);
        }

        report.metadata = Some(metadata);
        report
    }

    /// Run a query command, falling back to the legacy `display device`
    /// catch-all when the strip does not know the command.
    async fn query(
        &self,
        session: &mut StripSession,
        command: &str,
        parse: fn(&str) -> Option<String>,
    ) -> Option<String> {
        let mut response = match session.command(command, RESPONSE_WINDOW).await {
            Ok(response) => response,
            Err(e) => {
                debug!(%command, "Strip query failed: {e}");
                return None;
            }
        };

        if mentions_error(&response) {
            response = match session.command("display device", RESPONSE_WINDOW).await {
                Ok(response) => response,
                Err(e) => {
                    debug!("Strip fallback query failed: {e}");
                    return None;
                }
            };
        }

        parse(&response)
    }
}

/// One logged-in management-port connection.
struct StripSession {
    stream: TcpStream,
}

impl StripSession {
    async fn login(host: &str, settings: &StripSettings) -> Result<Self, Error> {
        let io = |e| Error::DeviceIo(format!("Strip at {host}: {e}"));

        let stream = timeout(LOGIN_WINDOW, TcpStream::connect((host, MANAGEMENT_PORT)))
            .await
            .map_err(|_| Error::DeviceIo(format!("Strip at {host}: connect timed out")))?
            .map_err(io)?;

        let mut session = Self { stream };

        session.read_until("login:").await?;
        session.send_line(&settings.username).await?;

        let after_login = session.collect(Duration::from_secs(1)).await?;
        if after_login.to_lowercase().contains("password:") {
            session.send_line(&settings.password).await?;

            // Drain the post-login banner so it cannot pollute the first
            // command's response.
            session.collect(RESPONSE_WINDOW).await?;
        }

        Ok(session)
    }

    async fn command(&mut self, command: &str, window: Duration) -> Result<String, Error> {
        self.send_line(command).await?;
        self.collect(window).await
    }

    async fn send_line(&mut self, line: &str) -> Result<(), Error> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        Ok(())
    }

    /// Collect whatever arrives within the window.
    async fn collect(&mut self, window: Duration) -> Result<String, Error> {
        let deadline = Instant::now() + window;
        let mut collected = Vec::new();
        let mut buffer = [0u8; 1024];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(remaining, self.stream.read(&mut buffer)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => collected.extend_from_slice(&buffer[..n]),
                Ok(Err(e)) => return Err(Error::DeviceIo(format!("Strip read failed: {e}"))),
                Err(_) => break,
            }
        }

        Ok(strip_telnet_controls(&collected))
    }

    /// Keep reading until the text contains `marker`.
    async fn read_until(&mut self, marker: &str) -> Result<String, Error> {
        let deadline = Instant::now() + LOGIN_WINDOW;
        let mut collected = Vec::new();
        let mut buffer = [0u8; 1024];

        loop {
            let text = strip_telnet_controls(&collected);
            if text.contains(marker) {
                return Ok(text);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::DeviceIo(format!(
                    "Strip did not offer `{marker}` within {LOGIN_WINDOW:?}"
                )));
            }

            match timeout(remaining, self.stream.read(&mut buffer)).await {
                Ok(Ok(0)) => {
                    return Err(Error::DeviceIo("Strip closed the connection".to_string()))
                }
                Ok(Ok(n)) => collected.extend_from_slice(&buffer[..n]),
                Ok(Err(e)) => return Err(Error::DeviceIo(format!("Strip read failed: {e}"))),
                Err(_) => {
                    return Err(Error::DeviceIo(format!(
                        "Strip did not offer `{marker}` within {LOGIN_WINDOW:?}"
                    )))
                }
            }
        }
    }
}

/// Drop telnet IAC negotiation sequences from the byte stream.
fn strip_telnet_controls(bytes: &[u8]) -> String {
    const IAC: u8 = 0xFF;

    let mut cleaned = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != IAC {
            cleaned.push(bytes[i]);
            i += 1;
        } else if bytes.get(i + 1) == Some(&IAC) {
            // Escaped literal 0xFF.
            cleaned.push(IAC);
            i += 2;
        } else if matches!(bytes.get(i + 1), Some(&(251..=254))) {
            // WILL/WONT/DO/DONT carry an option byte.
            i += 3;
        } else {
            i += 2;
        }
    }

    String::from_utf8_lossy(&cleaned).to_string()
}

fn mentions_error(response: &str) -> bool {
    response.to_lowercase().contains("error")
}

fn reboot_acknowledged(response: &str) -> bool {
    response
        .lines()
        .any(|line| line.contains("rebooting") || line.contains("going down for reboot"))
}

/// `display device` answers carry the uptime after a `reboot:` tag; the
/// `uptime` command answers with an `uptime ...: <value>` line.
fn parse_uptime(response: &str) -> Option<String> {
    for line in response.lines() {
        if let Some((_, value)) = line.split_once("reboot:") {
            return non_empty(value);
        }
    }

    for line in response.lines() {
        if line.to_lowercase().contains("uptime") {
            if let Some((_, value)) = line.rsplit_once(": ") {
                return non_empty(value);
            }
        }
    }

    None
}

/// Factory firmware names a `release_<version>`; newer ones answer with a
/// `firmware: <version>` line.
fn parse_firmware(response: &str) -> Option<String> {
    for line in response.lines() {
        if let Some((_, value)) = line.split_once("release_") {
            return non_empty(value);
        }
    }

    for line in response.lines() {
        if line.to_lowercase().contains("firmware") {
            if let Some((_, value)) = line.rsplit_once(": ") {
                return non_empty(value);
            }
        }
    }

    None
}

fn parse_mac(response: &str) -> Option<String> {
    let pattern = Regex::new(MAC_PATTERN).expect("The MAC pattern is well formed");
    pattern.find(response).map(|m| m.as_str().to_string())
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}
