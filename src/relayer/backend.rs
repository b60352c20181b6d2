// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Forwarding of relay payloads to the supplier backends.
//!
//! Relay payloads carry a MessagePack encoded [ServiceRequest], the backend
//! reply travels back as a [ServiceResponse] inside the relay response.

use crate::{
    base::serialize::{rmp_deserialize, rmp_serialize},
    relayer::config::{Authentication, BackendConfig},
    Error, ErrorKind, Result,
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::time::Duration;

/// Headers never forwarded to the backend.
const HOP_BY_HOP_HEADERS: [&str; 5] = [
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "upgrade",
];

/// HTTP request as sent by the client application.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct ServiceRequest {
    pub method: String,
    /// Path and query, relative to the backend URL.
    pub path: String,
    pub headers: Vec<(String, String)>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl ServiceRequest {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        rmp_deserialize(payload)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        rmp_serialize(self)
    }
}

/// HTTP response as returned by the backend.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct ServiceResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl ServiceResponse {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        rmp_deserialize(payload)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        rmp_serialize(self)
    }
}

/// Fully resolved outbound request.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BackendRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Basic authentication credentials.
    pub credentials: Option<(String, String)>,
    pub timeout: Duration,
}

impl BackendRequest {
    /// Resolve a client request against a configured backend.
    pub fn build(req: ServiceRequest, backend: &BackendConfig, timeout: Duration) -> Self {
        let base = backend.url.trim_end_matches('/');
        let url = match req.path.as_str() {
            "" | "/" => backend.url.clone(),
            // Bare query string, the backend URL is kept as configured.
            path if path.starts_with('?') => format!("{}{}", backend.url, path),
            path if path.starts_with('/') => format!("{}{}", base, path),
            path => format!("{}/{}", base, path),
        };

        let mut headers: Vec<(String, String)> = req
            .headers
            .into_iter()
            .filter(|(name, _)| {
                let name = name.to_ascii_lowercase();
                !HOP_BY_HOP_HEADERS.contains(&name.as_str())
                    && !backend
                        .headers
                        .keys()
                        .any(|configured| configured.eq_ignore_ascii_case(&name))
            })
            .collect();
        headers.extend(
            backend
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );

        let credentials = match &backend.authentication {
            Some(Authentication::Basic { username, password }) => {
                Some((username.clone(), password.clone()))
            }
            Some(Authentication::Bearer { token }) => {
                headers.retain(|(name, _)| !name.eq_ignore_ascii_case("authorization"));
                headers.push(("Authorization".to_owned(), format!("Bearer {}", token)));
                None
            }
            None => None,
        };

        let method = match req.method.is_empty() {
            true => "POST".to_owned(),
            false => req.method,
        };

        BackendRequest {
            method,
            url,
            headers,
            body: req.body,
            credentials,
            timeout,
        }
    }
}

/// Outbound HTTP dispatcher.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Perform the request. Timeouts map to `Timeout`, transport failures to
    /// `SupplierUnreachable`. Any HTTP status is a success at this level.
    async fn send(&self, req: BackendRequest) -> Result<ServiceResponse>;
}

#[cfg(feature = "http-backend")]
pub use http::HttpBackend;

#[cfg(feature = "http-backend")]
mod http {
    use super::*;
    use futures::AsyncReadExt;
    use isahc::{
        auth::{Authentication as IsahcAuthentication, Credentials},
        config::Configurable,
        HttpClient, Request,
    };

    /// Backend dispatcher on top of a shared isahc client.
    pub struct HttpBackend {
        client: HttpClient,
    }

    impl HttpBackend {
        pub fn new() -> Result<Self> {
            let client =
                HttpClient::new().map_err(|err| Error::new_ext(ErrorKind::Internal, err))?;
            Ok(HttpBackend { client })
        }
    }

    fn map_transport_error(err: isahc::Error) -> Error {
        match err.kind() {
            isahc::error::ErrorKind::Timeout => Error::new_ext(ErrorKind::Timeout, err),
            _ => Error::new_ext(ErrorKind::SupplierUnreachable, err),
        }
    }

    #[async_trait]
    impl Backend for HttpBackend {
        async fn send(&self, req: BackendRequest) -> Result<ServiceResponse> {
            let mut builder = Request::builder()
                .method(req.method.as_str())
                .uri(req.url.as_str())
                .timeout(req.timeout);
            for (name, value) in req.headers.iter() {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some((username, password)) = req.credentials {
                builder = builder
                    .authentication(IsahcAuthentication::basic())
                    .credentials(Credentials::new(username, password));
            }
            let request = builder
                .body(req.body)
                .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;

            let mut response = self
                .client
                .send_async(request)
                .await
                .map_err(map_transport_error)?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.to_string(), value.to_owned()))
                })
                .collect();
            let mut body = vec![];
            response
                .body_mut()
                .read_to_end(&mut body)
                .await
                .map_err(|err| Error::new_ext(ErrorKind::SupplierUnreachable, err))?;

            debug!("backend {} replied {}", req.url, status);
            Ok(ServiceResponse {
                status,
                headers,
                body,
            })
        }
    }
}
