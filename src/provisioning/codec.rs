//! Request and response payloads for the two provisioning exchanges.
//!
//! CBOR is handled with a streaming `minicbor` encoder/decoder so unknown keys
//! can be skipped without allocation; JSON goes through serde. Decoded string
//! fields are checked against [`FieldLimits`] and decoding fails closed when a
//! field is missing, empty or too long.

use super::topics::PayloadFormat;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use thiserror::Error;

const KEY_CSR: &str = "certificateSigningRequest";
const KEY_CERT_PEM: &str = "certificatePem";
const KEY_CERT_ID: &str = "certificateId";
const KEY_TOKEN: &str = "certificateOwnershipToken";
const KEY_PARAMETERS: &str = "parameters";
const KEY_THING_NAME: &str = "thingName";
const KEY_DEVICE_CONFIG: &str = "deviceConfiguration";
const KEY_STATUS: &str = "statusCode";
const KEY_ERROR_CODE: &str = "errorCode";
const KEY_ERROR_MESSAGE: &str = "errorMessage";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cbor encode failed: {0}")]
    CborEncode(#[from] minicbor::encode::Error<Infallible>),
    #[error("cbor decode failed: {0}")]
    CborDecode(#[from] minicbor::decode::Error),
    #[error("json codec failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("field {0} is empty")]
    EmptyField(&'static str),
    #[error("field {field} is {len} bytes, limit {limit}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        limit: usize,
    },
    #[error("indefinite-length cbor item")]
    IndefiniteLength,
    #[error("trailing bytes after payload")]
    TrailingBytes,
}

/// Declared upper bounds of the decoded response fields, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLimits {
    pub certificate_pem: usize,
    pub certificate_id: usize,
    pub ownership_token: usize,
    pub thing_name: usize,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            certificate_pem: 2048,
            certificate_id: 64,
            ownership_token: 512,
            thing_name: 128,
        }
    }
}

/// Output of a successful CreateCertificateFromCsr exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    pub certificate_pem: String,
    pub certificate_id: String,
    pub ownership_token: String,
}

/// Output of a successful RegisterThing exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThingIdentity {
    pub thing_name: String,
    pub device_configuration: BTreeMap<String, String>,
}

/// Diagnostic body of a `/rejected` response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct RejectionDetail {
    #[serde(rename = "statusCode", default)]
    pub status_code: Option<u16>,
    #[serde(rename = "errorCode", default)]
    pub error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
}

impl std::fmt::Display for RejectionDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "status={} code={} message={}",
            self.status_code
                .map_or_else(|| "?".to_string(), |s| s.to_string()),
            self.error_code.as_deref().unwrap_or("?"),
            self.error_message.as_deref().unwrap_or("?")
        )
    }
}

/// Payload serializer/deserializer used by the orchestrator.
pub trait PayloadCodec: Send + Sync {
    fn encode_csr_request(&self, csr_pem: &str) -> Result<Vec<u8>, CodecError>;

    fn decode_csr_response(&self, payload: &[u8]) -> Result<IssuedCredential, CodecError>;

    fn encode_register_request(
        &self,
        ownership_token: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, CodecError>;

    fn decode_register_response(&self, payload: &[u8]) -> Result<ThingIdentity, CodecError>;

    /// Best-effort; rejection bodies are informational only.
    fn decode_rejection(&self, payload: &[u8]) -> Option<RejectionDetail>;
}

/// Codec for the service's documented CBOR and JSON payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCodec {
    format: PayloadFormat,
    limits: FieldLimits,
}

impl StandardCodec {
    pub fn new(format: PayloadFormat, limits: FieldLimits) -> Self {
        Self { format, limits }
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }
}

impl PayloadCodec for StandardCodec {
    fn encode_csr_request(&self, csr_pem: &str) -> Result<Vec<u8>, CodecError> {
        match self.format {
            PayloadFormat::Cbor => {
                let mut buf = Vec::new();
                let mut enc = Encoder::new(&mut buf);
                enc.map(1)?.str(KEY_CSR)?.str(csr_pem)?;
                Ok(buf)
            }
            PayloadFormat::Json => Ok(serde_json::to_vec(&JsonCsrRequest {
                certificate_signing_request: csr_pem,
            })?),
        }
    }

    fn decode_csr_response(&self, payload: &[u8]) -> Result<IssuedCredential, CodecError> {
        let (pem, id, token) = match self.format {
            PayloadFormat::Cbor => {
                let mut pem = None;
                let mut id = None;
                let mut token = None;
                let mut dec = Decoder::new(payload);
                let entries = decode_map_len(&mut dec)?;
                for _ in 0..entries {
                    match decode_text(&mut dec)? {
                        KEY_CERT_PEM => pem = Some(decode_text(&mut dec)?.to_string()),
                        KEY_CERT_ID => id = Some(decode_text(&mut dec)?.to_string()),
                        KEY_TOKEN => token = Some(decode_text(&mut dec)?.to_string()),
                        _ => skip_value(&mut dec)?,
                    }
                }
                ensure_consumed(&dec)?;
                (pem, id, token)
            }
            PayloadFormat::Json => {
                let body: JsonCsrResponse = serde_json::from_slice(payload)?;
                (
                    body.certificate_pem,
                    body.certificate_id,
                    body.certificate_ownership_token,
                )
            }
        };
        Ok(IssuedCredential {
            certificate_pem: bounded(pem, KEY_CERT_PEM, self.limits.certificate_pem)?,
            certificate_id: bounded(id, KEY_CERT_ID, self.limits.certificate_id)?,
            ownership_token: bounded(token, KEY_TOKEN, self.limits.ownership_token)?,
        })
    }

    fn encode_register_request(
        &self,
        ownership_token: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, CodecError> {
        match self.format {
            PayloadFormat::Cbor => {
                let mut buf = Vec::new();
                let mut enc = Encoder::new(&mut buf);
                let entries = if parameters.is_empty() { 1 } else { 2 };
                enc.map(entries)?.str(KEY_TOKEN)?.str(ownership_token)?;
                if !parameters.is_empty() {
                    enc.str(KEY_PARAMETERS)?.map(parameters.len() as u64)?;
                    for (key, value) in parameters {
                        enc.str(key)?.str(value)?;
                    }
                }
                Ok(buf)
            }
            PayloadFormat::Json => Ok(serde_json::to_vec(&JsonRegisterRequest {
                certificate_ownership_token: ownership_token,
                parameters,
            })?),
        }
    }

    fn decode_register_response(&self, payload: &[u8]) -> Result<ThingIdentity, CodecError> {
        let (thing_name, device_configuration) = match self.format {
            PayloadFormat::Cbor => {
                let mut thing_name = None;
                let mut device_configuration = BTreeMap::new();
                let mut dec = Decoder::new(payload);
                let entries = decode_map_len(&mut dec)?;
                for _ in 0..entries {
                    match decode_text(&mut dec)? {
                        KEY_THING_NAME => thing_name = Some(decode_text(&mut dec)?.to_string()),
                        KEY_DEVICE_CONFIG => device_configuration = decode_string_map(&mut dec)?,
                        _ => skip_value(&mut dec)?,
                    }
                }
                ensure_consumed(&dec)?;
                (thing_name, device_configuration)
            }
            PayloadFormat::Json => {
                let body: JsonRegisterResponse = serde_json::from_slice(payload)?;
                let config = body
                    .device_configuration
                    .into_iter()
                    .filter_map(|(k, v)| match v {
                        serde_json::Value::String(s) => Some((k, s)),
                        _ => None,
                    })
                    .collect();
                (body.thing_name, config)
            }
        };
        Ok(ThingIdentity {
            thing_name: bounded(thing_name, KEY_THING_NAME, self.limits.thing_name)?,
            device_configuration,
        })
    }

    fn decode_rejection(&self, payload: &[u8]) -> Option<RejectionDetail> {
        match self.format {
            PayloadFormat::Json => serde_json::from_slice(payload).ok(),
            PayloadFormat::Cbor => {
                let mut detail = RejectionDetail::default();
                let mut dec = Decoder::new(payload);
                let entries = decode_map_len(&mut dec).ok()?;
                for _ in 0..entries {
                    match decode_text(&mut dec).ok()? {
                        KEY_STATUS => detail.status_code = dec.u16().ok(),
                        KEY_ERROR_CODE => {
                            detail.error_code = Some(decode_text(&mut dec).ok()?.to_string());
                        }
                        KEY_ERROR_MESSAGE => {
                            detail.error_message = Some(decode_text(&mut dec).ok()?.to_string());
                        }
                        _ => dec.skip().ok()?,
                    }
                }
                Some(detail)
            }
        }
    }
}

#[derive(Serialize)]
struct JsonCsrRequest<'a> {
    #[serde(rename = "certificateSigningRequest")]
    certificate_signing_request: &'a str,
}

#[derive(Deserialize)]
struct JsonCsrResponse {
    #[serde(rename = "certificatePem")]
    certificate_pem: Option<String>,
    #[serde(rename = "certificateId")]
    certificate_id: Option<String>,
    #[serde(rename = "certificateOwnershipToken")]
    certificate_ownership_token: Option<String>,
}

#[derive(Serialize)]
struct JsonRegisterRequest<'a> {
    #[serde(rename = "certificateOwnershipToken")]
    certificate_ownership_token: &'a str,
    #[serde(skip_serializing_if = "no_parameters")]
    parameters: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct JsonRegisterResponse {
    #[serde(rename = "thingName")]
    thing_name: Option<String>,
    #[serde(rename = "deviceConfiguration", default)]
    device_configuration: BTreeMap<String, serde_json::Value>,
}

fn no_parameters(parameters: &&BTreeMap<String, String>) -> bool {
    parameters.is_empty()
}

fn bounded(value: Option<String>, field: &'static str, limit: usize) -> Result<String, CodecError> {
    let value = value.ok_or(CodecError::MissingField(field))?;
    if value.is_empty() {
        return Err(CodecError::EmptyField(field));
    }
    if value.len() > limit {
        return Err(CodecError::FieldTooLong {
            field,
            len: value.len(),
            limit,
        });
    }
    Ok(value)
}

fn decode_map_len(dec: &mut Decoder) -> Result<u64, CodecError> {
    dec.map()?.ok_or(CodecError::IndefiniteLength)
}

fn decode_text<'a>(dec: &mut Decoder<'a>) -> Result<&'a str, CodecError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(CodecError::IndefiniteLength);
    }
    Ok(dec.str()?)
}

fn decode_string_map(dec: &mut Decoder) -> Result<BTreeMap<String, String>, CodecError> {
    let entries = decode_map_len(dec)?;
    let mut out = BTreeMap::new();
    for _ in 0..entries {
        let key = decode_text(dec)?.to_string();
        if matches!(dec.datatype()?, Type::String) {
            out.insert(key, dec.str()?.to_string());
        } else {
            skip_value(dec)?;
        }
    }
    Ok(out)
}

fn skip_value(dec: &mut Decoder) -> Result<(), CodecError> {
    if matches!(
        dec.datatype()?,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ) {
        return Err(CodecError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}

fn ensure_consumed(dec: &Decoder) -> Result<(), CodecError> {
    if dec.position() < dec.input().len() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(())
}
