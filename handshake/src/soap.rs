//! SOAP 1.1 binding of the login service
//!
//! The service description (WSDL) is read once at connect time for its
//! target namespace, the SOAP actions of each operation, and a sanity check
//! that the three login operations exist. Calls are document-style
//! envelopes POSTed to the configured endpoint, which overrides whatever
//! address the WSDL advertises.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::GatewayError;
use crate::gateway::{ChallengeAck, Gateway, LoginChallenge, Registration};
use crate::types::{PORT_NAME, SERVICE_NAME, STATUS_OK};

pub const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

const OP_LOGIN_REQ: &str = "loginReq";
const OP_LOGIN_REG: &str = "loginReg";
const OP_CHALLENGE_RESP: &str = "challengeResp";
const REQUIRED_OPERATIONS: [&str; 3] = [OP_LOGIN_REQ, OP_LOGIN_REG, OP_CHALLENGE_RESP];

/// Fault text used when the fault carries none
const GENERIC_FAULT: &str = "SOAP Fault occurred";

/// What the handshake needs from a WSDL document
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescription {
    pub target_namespace: String,
    /// `soap:address` of the port, if advertised
    pub address: Option<String>,
    pub operations: Vec<String>,
    soap_actions: HashMap<String, String>,
}

impl ServiceDescription {
    pub fn parse(xml: &str) -> Result<Self, GatewayError> {
        let invalid = |msg: String| GatewayError::ServiceDescription(msg);
        let mut reader = Reader::from_str(xml);
        let mut target_namespace = None;
        let mut address = None;
        let mut operations: Vec<String> = Vec::new();
        let mut soap_actions = HashMap::new();
        let mut current_operation: Option<String> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|err| invalid(format!("invalid XML: {err}")))?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let opens_scope = matches!(event, Event::Start(_));
                    match e.local_name().as_ref() {
                        b"definitions" => {
                            target_namespace = attribute(e, b"targetNamespace")?;
                        }
                        b"address" => {
                            if let Some(location) = attribute(e, b"location")? {
                                address = Some(location);
                            }
                        }
                        b"operation" => match attribute(e, b"name")? {
                            Some(name) => {
                                if !operations.contains(&name) {
                                    operations.push(name.clone());
                                }
                                if opens_scope {
                                    current_operation = Some(name);
                                }
                            }
                            // soap:operation inside a binding operation
                            None => {
                                if let (Some(op), Some(action)) =
                                    (&current_operation, attribute(e, b"soapAction")?)
                                {
                                    soap_actions.insert(op.clone(), action);
                                }
                            }
                        },
                        _ => {}
                    }
                }
                Event::End(ref e) if e.local_name().as_ref() == b"operation" => {
                    current_operation = None;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let target_namespace = target_namespace
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| invalid("definitions has no targetNamespace".into()))?;
        let missing: Vec<&str> = REQUIRED_OPERATIONS
            .iter()
            .copied()
            .filter(|op| !operations.iter().any(|known| known == op))
            .collect();
        if !missing.is_empty() {
            return Err(invalid(format!(
                "{SERVICE_NAME}/{PORT_NAME} lacks operations: {}",
                missing.join(", ")
            )));
        }
        Ok(Self {
            target_namespace,
            address,
            operations,
            soap_actions,
        })
    }

    /// SOAPAction for `operation`, defaulting to the operation name.
    pub fn soap_action<'a>(&'a self, operation: &'a str) -> &'a str {
        match self.soap_actions.get(operation) {
            Some(action) if !action.is_empty() => action.as_str(),
            _ => operation,
        }
    }
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, GatewayError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|err| GatewayError::ServiceDescription(err.to_string()))?;
        if attr.key.local_name().as_ref() == name {
            let value = attr
                .unescape_value()
                .map_err(|err| GatewayError::ServiceDescription(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Document-style request envelope with unqualified child elements.
pub fn build_envelope(namespace: &str, operation: &str, fields: &[(&str, &str)]) -> String {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!("<{name}>{}</{name}>", escape(*value)));
    }
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<soap:Envelope xmlns:soap="{soap}" xmlns:tns="{ns}">"#,
            r#"<soap:Body><tns:{op}>{body}</tns:{op}></soap:Body>"#,
            r#"</soap:Envelope>"#
        ),
        soap = SOAP_ENV_NS,
        ns = escape(namespace),
        op = operation,
        body = body,
    )
}

/// Direct children of the first Body child, keyed by local name. When a name
/// repeats, the first element wins; nested elements never feed the map.
///
/// A `Fault` body becomes [`GatewayError::Fault`] with the server's text.
pub fn parse_response(xml: &str) -> Result<HashMap<String, String>, GatewayError> {
    let malformed = |msg: String| GatewayError::Malformed(msg);
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut body_depth: Option<usize> = None;
    let mut payload: Option<Vec<u8>> = None;
    let mut fields: HashMap<String, String> = HashMap::new();
    // Field currently being read; None while inside a repeated name.
    let mut field: Option<String> = None;
    // SOAP 1.2 puts the fault text at Fault/Reason/Text.
    let mut reason_text: Option<String> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| malformed(format!("invalid XML: {err}")))?;
        match event {
            Event::Start(ref e) => {
                let name = e.local_name().as_ref().to_vec();
                if body_depth.is_none() && name == b"Body" {
                    body_depth = Some(stack.len() + 1);
                } else if body_depth == Some(stack.len()) && payload.is_none() {
                    payload = Some(name.clone());
                } else if body_depth.map(|depth| depth + 1) == Some(stack.len()) {
                    let key = String::from_utf8_lossy(&name).into_owned();
                    field = (!fields.contains_key(&key)).then(|| {
                        fields.insert(key.clone(), String::new());
                        key
                    });
                }
                stack.push(name);
            }
            Event::Empty(ref e) => {
                let name = e.local_name().as_ref().to_vec();
                if body_depth == Some(stack.len()) && payload.is_none() {
                    payload = Some(name);
                } else if body_depth.map(|depth| depth + 1) == Some(stack.len()) {
                    fields
                        .entry(String::from_utf8_lossy(&name).into_owned())
                        .or_default();
                }
            }
            Event::Text(ref t) => {
                let Some(depth) = body_depth else { continue };
                if stack.len() == depth + 2 {
                    if let Some(value) = field.as_ref().and_then(|key| fields.get_mut(key)) {
                        let text = t
                            .unescape()
                            .map_err(|err| malformed(format!("bad text: {err}")))?;
                        value.push_str(&text);
                    }
                } else if stack.len() == depth + 3
                    && reason_text.is_none()
                    && stack.last().is_some_and(|name| name == b"Text")
                {
                    let text = t
                        .unescape()
                        .map_err(|err| malformed(format!("bad text: {err}")))?;
                    reason_text = Some(text.into_owned());
                }
            }
            Event::CData(c) => {
                if body_depth.is_some_and(|depth| stack.len() == depth + 2) {
                    if let Some(value) = field.as_ref().and_then(|key| fields.get_mut(key)) {
                        value.push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
            }
            Event::End(_) => {
                if body_depth.is_some_and(|depth| stack.len() == depth + 2) {
                    field = None;
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    for value in fields.values_mut() {
        let trimmed = value.trim();
        if trimmed.len() != value.len() {
            *value = trimmed.to_string();
        }
    }

    match payload.as_deref() {
        None if body_depth.is_none() => Err(malformed("no SOAP Body".into())),
        None => Err(malformed("empty SOAP Body".into())),
        Some(b"Fault") => {
            let text = fields
                .remove("faultstring")
                .or_else(|| reason_text.map(|text| text.trim().to_string()))
                .filter(|text| !text.is_empty())
                .unwrap_or_else(|| GENERIC_FAULT.to_string());
            Err(GatewayError::Fault { fault_string: text })
        }
        Some(_) => Ok(fields),
    }
}

/// Login service reached over HTTP(S)
pub struct SoapGateway {
    http: Client,
    endpoint: Url,
    description: ServiceDescription,
    call_timeout: Duration,
}

impl SoapGateway {
    /// Load the service description and bind calls to `endpoint`.
    pub async fn connect(
        service_description: &str,
        endpoint: &str,
        call_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let endpoint = Url::parse(endpoint.trim())
            .map_err(|err| GatewayError::Transport(format!("invalid endpoint: {err}")))?;
        let http = Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|err| GatewayError::Transport(err.to_string()))?;

        info!(location = %service_description, "loading service description");
        let xml = fetch_description(&http, service_description.trim(), call_timeout).await?;
        let description = ServiceDescription::parse(&xml)?;
        info!(
            namespace = %description.target_namespace,
            operations = ?description.operations,
            endpoint = %endpoint,
            "SOAP client ready"
        );
        if let Some(advertised) = &description.address {
            if advertised.as_str() != endpoint.as_str() {
                debug!(%advertised, "endpoint overrides the advertised address");
            }
        }
        Ok(Self {
            http,
            endpoint,
            description,
            call_timeout,
        })
    }

    pub fn description(&self) -> &ServiceDescription {
        &self.description
    }

    async fn call(
        &self,
        operation: &'static str,
        fields: &[(&str, &str)],
    ) -> Result<HashMap<String, String>, GatewayError> {
        let envelope = build_envelope(&self.description.target_namespace, operation, fields);
        let action = self.description.soap_action(operation);
        debug!(operation, endpoint = %self.endpoint, "posting SOAP request");

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{action}\""))
            .body(envelope)
            .send()
            .await
            .map_err(|err| from_reqwest(err, self.call_timeout))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| from_reqwest(err, self.call_timeout))?;

        match parse_response(&body) {
            Err(fault @ GatewayError::Fault { .. }) => {
                warn!(operation, %fault, "SOAP fault");
                Err(fault)
            }
            _ if !status.is_success() => {
                Err(GatewayError::Transport(format!("{operation}: HTTP {status}")))
            }
            other => other,
        }
    }
}

#[async_trait]
impl Gateway for SoapGateway {
    async fn login_req(
        &self,
        login_name: &str,
        idc: &str,
    ) -> Result<LoginChallenge, GatewayError> {
        let mut fields = self
            .call(OP_LOGIN_REQ, &[("login_name", login_name), ("idc", idc)])
            .await?;
        let status = required(&mut fields, OP_LOGIN_REQ, "status")?;
        let challenge = if status == STATUS_OK {
            required(&mut fields, OP_LOGIN_REQ, "challenge")?
        } else {
            fields.remove("challenge").unwrap_or_default()
        };
        Ok(LoginChallenge { status, challenge })
    }

    async fn login_reg(
        &self,
        login_name: &str,
        public_key: &str,
    ) -> Result<Registration, GatewayError> {
        let mut fields = self
            .call(
                OP_LOGIN_REG,
                &[("login_name", login_name), ("public_key", public_key)],
            )
            .await?;
        let status = fields.remove("status");
        if status.as_deref().is_some_and(|s| s != STATUS_OK) {
            return Ok(Registration {
                status,
                idc: fields.remove("idc").unwrap_or_default(),
                ciphertext: fields.remove("ciphertext").unwrap_or_default(),
                challenge: fields.remove("challenge").unwrap_or_default(),
            });
        }
        Ok(Registration {
            status,
            idc: required(&mut fields, OP_LOGIN_REG, "idc")?,
            ciphertext: required(&mut fields, OP_LOGIN_REG, "ciphertext")?,
            challenge: required(&mut fields, OP_LOGIN_REG, "challenge")?,
        })
    }

    async fn challenge_resp(
        &self,
        idc: &str,
        crypted_hash: &str,
    ) -> Result<ChallengeAck, GatewayError> {
        let mut fields = self
            .call(
                OP_CHALLENGE_RESP,
                &[("idc", idc), ("crypted_hash", crypted_hash)],
            )
            .await?;
        let status = required(&mut fields, OP_CHALLENGE_RESP, "status")?;
        Ok(ChallengeAck { status })
    }
}

fn required(
    fields: &mut HashMap<String, String>,
    operation: &str,
    name: &str,
) -> Result<String, GatewayError> {
    fields
        .remove(name)
        .ok_or_else(|| GatewayError::Malformed(format!("{operation} response lacks {name}")))
}

fn from_reqwest(err: reqwest::Error, timeout: Duration) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(timeout)
    } else {
        GatewayError::Transport(err.to_string())
    }
}

async fn fetch_description(
    http: &Client,
    location: &str,
    timeout: Duration,
) -> Result<String, GatewayError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        let response = http
            .get(location)
            .send()
            .await
            .map_err(|err| from_reqwest(err, timeout))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::ServiceDescription(format!(
                "{location}: HTTP {status}"
            )));
        }
        return response
            .text()
            .await
            .map_err(|err| from_reqwest(err, timeout));
    }
    let path = location.strip_prefix("file://").unwrap_or(location);
    tokio::fs::read_to_string(path)
        .await
        .map_err(|err| GatewayError::ServiceDescription(format!("{path}: {err}")))
}
