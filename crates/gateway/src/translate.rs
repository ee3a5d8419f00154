//! Request and response translation between callers and deployments
//!
//! Non-multipart bodies are forwarded as raw bytes. Multipart bodies are
//! decoded into [`FormPart`]s and re-encoded with a fresh boundary for every
//! forwarding attempt.

use axum::extract::Multipart;
use axum::http::{header, HeaderMap, HeaderName};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::RequestBuilder;
use tracing::warn;

use crate::error::ApiError;

/// Connection-scoped headers are never relayed in either direction
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// One decoded multipart field, kept as raw bytes whether or not it is a
/// file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Request body as it will be sent downstream
#[derive(Debug, Clone)]
pub enum ForwardBody {
    Raw(Bytes),
    Multipart(Vec<FormPart>),
}

impl ForwardBody {
    /// Payload size in bytes, excluding multipart framing
    pub fn len(&self) -> u64 {
        match self {
            ForwardBody::Raw(bytes) => bytes.len() as u64,
            ForwardBody::Multipart(parts) => parts.iter().map(|part| part.data.len() as u64).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach the body to an outgoing request
    pub fn attach(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            ForwardBody::Raw(bytes) if bytes.is_empty() => builder,
            ForwardBody::Raw(bytes) => builder.body(bytes.clone()),
            ForwardBody::Multipart(parts) => builder.multipart(encode_form(parts)),
        }
    }
}

/// Whether the request carries a multipart form
pub fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_start().to_ascii_lowercase().starts_with("multipart/"))
        .unwrap_or(false)
}

/// Read every field of a multipart request into memory
pub async fn decode_multipart(mut multipart: Multipart) -> Result<Vec<FormPart>, ApiError> {
    let mut parts = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(e.status(), e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);

        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?;

        parts.push(FormPart {
            name,
            file_name,
            content_type,
            data,
        });
    }

    Ok(parts)
}

/// Rebuild a multipart form with a fresh boundary
pub fn encode_form(parts: &[FormPart]) -> Form {
    parts
        .iter()
        .fold(Form::new(), |form, part| form.part(part.name.clone(), encode_part(part)))
}

fn encode_part(part: &FormPart) -> Part {
    let bytes = || {
        let encoded = Part::bytes(part.data.to_vec());
        match &part.file_name {
            Some(file_name) => encoded.file_name(file_name.clone()),
            None => encoded,
        }
    };

    match part.content_type.as_deref() {
        Some(mime) => bytes().mime_str(mime).unwrap_or_else(|e| {
            warn!(field = %part.name, "Dropping unparseable content type {}: {}", mime, e);
            bytes()
        }),
        None => bytes(),
    }
}

/// Caller headers to pass downstream.
///
/// Credentials, hop-by-hop and framing headers are dropped; for multipart
/// bodies the content type is dropped as well since the boundary changes.
pub fn forward_headers(headers: &HeaderMap, multipart: bool) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        if is_hop_by_hop(name)
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || *name == header::AUTHORIZATION
            || (multipart && *name == header::CONTENT_TYPE)
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }

    forwarded
}

/// Deployment response headers to relay to the caller
pub fn relay_headers(headers: &HeaderMap) -> HeaderMap {
    let mut relayed = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        relayed.append(name.clone(), value.clone());
    }

    relayed
}
