//! Low-level SOAP transport for UPnP control.
//!
//! Builds the envelope, posts it to a service control URL and separates
//! SOAP faults from HTTP failures. Family-specific actions live in
//! `renderer.rs` and `openhome.rs`.

use std::fmt;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;

use super::types::ServiceEndpoint;
use super::xml::{escape_xml, extract_non_empty};
use crate::protocol_constants::SOAP_TIMEOUT_SECS;

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// A SOAP fault, with the UPnP error code when the device supplied one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    pub code: Option<u16>,
    pub description: String,
}

impl fmt::Display for SoapFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "UPnP error {} ({})", code, self.description),
            None => write!(f, "{}", self.description),
        }
    }
}

/// Errors that can occur during SOAP operations.
#[derive(Debug, Error)]
pub enum SoapError {
    /// HTTP request to the device failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Device returned a non-success HTTP status without a SOAP fault.
    #[error("HTTP error {0}: {1}")]
    HttpStatus(u16, String),

    /// Device returned a SOAP fault response.
    #[error("SOAP fault: {0}")]
    Fault(SoapFault),

    /// Failed to parse the SOAP response body.
    #[error("Failed to parse SOAP response")]
    Parse,
}

/// Convenient Result alias for SOAP operations.
pub type SoapResult<T> = Result<T, SoapError>;

/// UPnP "Invalid Action".
const UPNP_INVALID_ACTION: u16 = 401;
/// UPnP AVTransport "Optional Action Not Implemented".
const UPNP_ACTION_NOT_IMPLEMENTED: u16 = 602;

impl SoapError {
    /// Returns true if the operation should be retried.
    ///
    /// Transient UPnP fault codes:
    /// - 701: Transition not available (device changing states)
    /// - 714: Illegal MIME type / seek target (previous source still loading)
    /// - 716: Resource not found (device busy initializing)
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            SoapError::Fault(fault) => {
                matches!(fault.code, Some(701) | Some(714) | Some(716))
                    || fault.description.to_lowercase().contains("transition")
            }
            SoapError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Fault used when a device lacks the service an action needs.
    #[must_use]
    pub fn missing_service(service: &str) -> Self {
        SoapError::Fault(SoapFault {
            code: Some(UPNP_INVALID_ACTION),
            description: format!("device has no {} service", service),
        })
    }

    /// Returns true if the device says it does not implement the action.
    #[must_use]
    pub fn is_unsupported_action(&self) -> bool {
        matches!(
            self,
            SoapError::Fault(SoapFault {
                code: Some(UPNP_INVALID_ACTION) | Some(UPNP_ACTION_NOT_IMPLEMENTED),
                ..
            })
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SOAP Request/Response
// ─────────────────────────────────────────────────────────────────────────────

/// Builds the SOAP envelope for an action.
///
/// The envelope is a single line: some device parsers reject whitespace
/// before the root element.
fn build_envelope(service_type: &str, action: &str, args: &[(&str, &str)]) -> String {
    let mut body = format!(
        r#"<?xml version="1.0" encoding="utf-8"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body><u:{} xmlns:u="{}">"#,
        action, service_type
    );
    for (k, v) in args {
        body.push_str(&format!("<{k}>{}</{k}>", escape_xml(v)));
    }
    body.push_str(&format!(r#"</u:{}></s:Body></s:Envelope>"#, action));
    body
}

/// Sends a SOAP action to a service control URL.
///
/// # Arguments
/// * `client` - Shared HTTP client
/// * `endpoint` - Service type and absolute control URL
/// * `action` - SOAP action name (e.g. "Play", "GetVolume")
/// * `args` - Action arguments, in order
/// * `timeout` - Per-request timeout
///
/// # Errors
/// `Fault` when the body carries a SOAP fault (regardless of HTTP status),
/// `HttpStatus` for other non-success statuses, `Http` for transport errors.
pub async fn send_soap_request(
    client: &Client,
    endpoint: &ServiceEndpoint,
    action: &str,
    args: &[(&str, &str)],
    timeout: Duration,
) -> SoapResult<String> {
    let body = build_envelope(&endpoint.service_type, action, args);

    log::debug!(
        "[SOAP] {} -> {} ({} bytes)",
        action,
        endpoint.control_url,
        body.len()
    );
    log::trace!("[SOAP] Request body: {}", body);

    let res = client
        .post(&endpoint.control_url)
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .header(
            "SOAPAction",
            format!("\"{}#{}\"", endpoint.service_type, action),
        )
        .body(body)
        .timeout(timeout)
        .send()
        .await?;

    let status = res.status();
    let response_text = res.text().await?;

    // Faults may arrive with a 500 status, so check the body first.
    if let Some(fault) = parse_fault(&response_text) {
        return Err(SoapError::Fault(fault));
    }

    if !status.is_success() {
        return Err(SoapError::HttpStatus(status.as_u16(), response_text));
    }

    Ok(response_text)
}

/// Extracts a SOAP fault, if the body contains one.
fn parse_fault(xml: &str) -> Option<SoapFault> {
    if !xml.contains(":Fault>") && !xml.contains("<Fault>") {
        return None;
    }
    let code = extract_non_empty(xml, "errorCode").and_then(|c| c.parse().ok());
    let description = extract_non_empty(xml, "errorDescription")
        .or_else(|| extract_non_empty(xml, "faultstring"))
        .unwrap_or_else(|| "Unknown SOAP fault".to_string());
    Some(SoapFault { code, description })
}

/// Extracts a required response field.
///
/// # Errors
/// `Parse` if the element is missing.
pub fn required_field(xml: &str, element: &str) -> SoapResult<String> {
    super::xml::extract_xml_text(xml, element).ok_or(SoapError::Parse)
}

// ─────────────────────────────────────────────────────────────────────────────
// SOAP Request Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Fluent builder for SOAP requests.
///
/// # Example
/// ```ignore
/// let response = SoapRequestBuilder::new(&client, avtransport)
///     .action("Play")
///     .instance_id()
///     .arg("Speed", "1")
///     .send()
///     .await?;
/// ```
pub struct SoapRequestBuilder<'a> {
    client: &'a Client,
    endpoint: &'a ServiceEndpoint,
    action: Option<&'a str>,
    args: Vec<(&'a str, String)>,
    timeout: Duration,
}

impl<'a> SoapRequestBuilder<'a> {
    #[must_use]
    pub fn new(client: &'a Client, endpoint: &'a ServiceEndpoint) -> Self {
        Self {
            client,
            endpoint,
            action: None,
            args: Vec::new(),
            timeout: Duration::from_secs(SOAP_TIMEOUT_SECS),
        }
    }

    /// Sets the SOAP action name.
    #[must_use]
    pub fn action(mut self, action: &'a str) -> Self {
        self.action = Some(action);
        self
    }

    /// Adds an argument; arguments are serialized in insertion order.
    #[must_use]
    pub fn arg(mut self, key: &'a str, value: impl Into<String>) -> Self {
        self.args.push((key, value.into()));
        self
    }

    /// Adds the standard `InstanceID=0` argument of AVTransport/RenderingControl.
    #[must_use]
    pub fn instance_id(self) -> Self {
        self.arg("InstanceID", "0")
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends the request and returns the response body.
    ///
    /// # Errors
    /// `Parse` if no action was set, otherwise whatever the transport returns.
    pub async fn send(self) -> SoapResult<String> {
        let action = self.action.ok_or(SoapError::Parse)?;
        let args: Vec<(&str, &str)> = self.args.iter().map(|(k, v)| (*k, v.as_str())).collect();
        send_soap_request(self.client, self.endpoint, action, &args, self.timeout).await
    }

    /// Returns the request parts without sending (for testing).
    #[cfg(test)]
    pub fn into_parts(self) -> Option<(&'a str, Vec<(&'a str, String)>)> {
        let action = self.action?;
        Some((action, self.args))
    }
}
