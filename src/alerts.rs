//! Alerting sink: fans out every lifecycle log line to the configured transports.
//! Each transport is independently enabled and a transport failure is logged and
//! swallowed, never propagated to the caller (§4.7, §7 `TransportError`).
use std::io::{Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::sync::RwLock;
use std::time::Duration;

use tracing::warn;

use crate::config::{AlertConfig, EmailAlertConfig, SyslogAlertConfig, WebhookAlertConfig};
use crate::error::TransportError;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the live alert configuration; replaced wholesale on reload (§4.5).
pub struct AlertSink {
    config: RwLock<AlertConfig>,
}

impl AlertSink {
    /// Builds a sink from the configuration loaded at daemon startup.
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Replaces the whole alert record, as the reload coordinator does on every reload.
    pub fn replace(&self, config: AlertConfig) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    /// Delivers `line` to every enabled transport, in order. Never returns an error:
    /// each transport's failure is logged at error level and otherwise swallowed.
    pub fn fire(&self, line: &str) {
        let config = self.config.read().unwrap_or_else(|p| p.into_inner());

        if let Some(email) = &config.email
            && email.enabled
            && let Err(err) = send_email(email, line)
        {
            warn!("alert email delivery failed: {err}");
        }

        if let Some(webhook) = &config.webhook
            && webhook.enabled
            && let Err(err) = send_webhook(webhook, line)
        {
            warn!("alert webhook delivery failed: {err}");
        }

        if let Some(syslog) = &config.syslog
            && syslog.enabled
            && let Err(err) = send_syslog(syslog, line)
        {
            warn!("alert syslog delivery failed: {err}");
        }
    }
}

/// Speaks just enough of the SMTP dialog to deliver a single plain-text message.
/// No retries, no templating, no connection pooling: a plain outbound integration,
/// per the purpose-and-scope note that alert transports are external collaborators.
fn send_email(config: &EmailAlertConfig, line: &str) -> Result<(), TransportError> {
    let addr = format!("{}:{}", config.smtp_host, config.smtp_port);
    let mut stream = TcpStream::connect(&addr).map_err(TransportError::Smtp)?;
    stream
        .set_read_timeout(Some(DIAL_TIMEOUT))
        .map_err(TransportError::Smtp)?;

    let mut greeting = [0u8; 512];
    let _ = stream.read(&mut greeting).map_err(TransportError::Smtp)?;

    let body = format!(
        "HELO taskmasterd\r\nMAIL FROM:<{from}>\r\nRCPT TO:<{to}>\r\nDATA\r\n\
         Subject: taskmaster alert\r\n\r\n{line}\r\n.\r\nQUIT\r\n",
        from = config.from,
        to = config.to,
    );
    stream
        .write_all(body.as_bytes())
        .map_err(TransportError::Smtp)?;
    let mut reply = [0u8; 512];
    let _ = stream.read(&mut reply).map_err(TransportError::Smtp)?;
    Ok(())
}

/// POSTs (by default) `{"message": line}` to the configured webhook URL.
fn send_webhook(config: &WebhookAlertConfig, line: &str) -> Result<(), TransportError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(DIAL_TIMEOUT)
        .build()?;
    let method = config
        .method
        .as_deref()
        .and_then(|m| reqwest::Method::from_bytes(m.as_bytes()).ok())
        .unwrap_or(reqwest::Method::POST);

    let mut request = client.request(method, &config.url);
    if let Some(headers) = &config.headers {
        for (key, value) in headers {
            request = request.header(key, value);
        }
    }
    request
        .json(&serde_json::json!({ "message": line }))
        .send()?;
    Ok(())
}

/// Sends a single UDP syslog datagram tagged with the configured facility.
fn send_syslog(config: &SyslogAlertConfig, line: &str) -> Result<(), TransportError> {
    let facility = facility_number(config.facility.as_deref().unwrap_or("user"));
    // severity 6 (informational); priority = facility * 8 + severity, RFC 3164.
    let priority = facility * 8 + 6;
    let datagram = format!("<{priority}>taskmasterd: {line}");

    let socket = UdpSocket::bind("0.0.0.0:0").map_err(TransportError::Syslog)?;
    let addr = format!("{}:{}", config.host, config.port);
    socket
        .send_to(datagram.as_bytes(), addr)
        .map_err(TransportError::Syslog)?;
    Ok(())
}

fn facility_number(name: &str) -> u8 {
    match name.to_ascii_lowercase().as_str() {
        "kern" => 0,
        "user" => 1,
        "mail" => 2,
        "daemon" => 3,
        "auth" => 4,
        "syslog" => 5,
        "cron" => 9,
        "local0" => 16,
        "local1" => 17,
        "local2" => 18,
        "local3" => 19,
        "local4" => 20,
        "local5" => 21,
        "local6" => 22,
        "local7" => 23,
        _ => 1,
    }
}
