//! Subsystems reached through their management API.
//!
//! Every subsystem exposes the same small REST surface for membership:
//!
//! | Operation        | Request                                |
//! |------------------|----------------------------------------|
//! | bootstrap        | `POST /1.0/bootstrap {name, address}`  |
//! | join             | `POST /1.0/join {name, address, token, config}` |
//! | issue token      | `POST /1.0/tokens {name}` → `{token}`  |
//! | delete token     | `DELETE /1.0/tokens/{name}`            |
//! | members          | `GET /1.0/members` → `{name: address}` |
//! | delete member    | `DELETE /1.0/members/{name}?force=1`   |
//! | disks (storage)  | `GET /1.0/disks` → `[{location, path}]`|

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cluster_core::context::Context;
use cluster_core::intent::JoinConfig;
use cluster_core::service::{Disk, DiskLister, Result, Service, ServiceError, ServiceType};
use serde::{Deserialize, Serialize};
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Serialize)]
struct MemberRequest<'a> {
    name: &'a str,
    address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<&'a serde_json::Value>,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

pub struct HttpService {
    kind: ServiceType,
    name: String,
    address: String,
    endpoint: String,
    http: reqwest::Client,
}

impl HttpService {
    pub fn new(
        kind: ServiceType,
        name: impl Into<String>,
        address: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            kind,
            name: name.into(),
            address: address.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn shared(self) -> Arc<dyn Service> {
        Arc::new(self)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn error(&self, message: impl Into<String>) -> ServiceError {
        ServiceError::Request {
            service: self.kind,
            message: message.into(),
        }
    }

    async fn send(&self, ctx: &Context, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = ctx
            .run(request.send())
            .await?
            .map_err(|e| self.error(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(ServiceError::Unavailable(self.kind));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.error(format!("HTTP {}: {}", status, body.trim())));
        }

        Ok(response)
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| self.error(format!("Invalid response: {e}")))
    }
}

#[async_trait]
impl Service for HttpService {
    async fn bootstrap(&self, ctx: &Context) -> Result<()> {
        debug!(service = %self.kind, "Bootstrapping");
        let body = MemberRequest {
            name: &self.name,
            address: &self.address,
            token: None,
            config: None,
        };
        self.send(ctx, self.http.post(self.url("/1.0/bootstrap")).json(&body))
            .await?;
        Ok(())
    }

    async fn join(&self, ctx: &Context, config: &JoinConfig) -> Result<()> {
        debug!(service = %self.kind, "Joining");
        let body = MemberRequest {
            name: &self.name,
            address: &self.address,
            token: Some(&config.token),
            config: (!config.config.is_null()).then_some(&config.config),
        };
        self.send(ctx, self.http.post(self.url("/1.0/join")).json(&body))
            .await?;
        Ok(())
    }

    async fn issue_token(&self, ctx: &Context, peer: &str) -> Result<String> {
        let response = self
            .send(
                ctx,
                self.http
                    .post(self.url("/1.0/tokens"))
                    .json(&TokenRequest { name: peer }),
            )
            .await?;
        let issued: TokenResponse = self.json(response).await?;
        Ok(issued.token)
    }

    async fn delete_token(&self, ctx: &Context, peer: &str) -> Result<()> {
        self.send(ctx, self.http.delete(self.url(&format!("/1.0/tokens/{peer}"))))
            .await?;
        Ok(())
    }

    async fn cluster_members(&self, ctx: &Context) -> Result<BTreeMap<String, String>> {
        let response = self.send(ctx, self.http.get(self.url("/1.0/members"))).await?;
        self.json(response).await
    }

    async fn delete_cluster_member(&self, ctx: &Context, name: &str, force: bool) -> Result<()> {
        let mut request = self.http.delete(self.url(&format!("/1.0/members/{name}")));
        if force {
            request = request.query(&[("force", "1")]);
        }
        self.send(ctx, request).await?;
        Ok(())
    }

    fn service_type(&self) -> ServiceType {
        self.kind
    }

    fn as_disk_lister(&self) -> Option<&dyn DiskLister> {
        (self.kind == ServiceType::Storage).then_some(self as &dyn DiskLister)
    }
}

#[async_trait]
impl DiskLister for HttpService {
    async fn list_disks(&self, ctx: &Context) -> Result<Vec<Disk>> {
        let response = self.send(ctx, self.http.get(self.url("/1.0/disks"))).await?;
        self.json(response).await
    }
}
