//! Proxmox VE implementation of the provisioning backend.
//!
//! Talks to the JSON API over `reqwest`. Mutating calls start hypervisor
//! tasks; the client polls each task until it stops so callers observe a
//! synchronous result.

mod auth;
mod error;
mod task;
mod types;

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::backend::{Backend, BackendFuture, ContainerSpec, TaskStatus, VmId, VmRef};
use crate::config::ProxmoxConfig;
use auth::Auth;
use types::{CreateContainerForm, Envelope, ErrorBody, Upid};

pub use error::ProxmoxError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Client for the Proxmox VE API.
///
/// The client is read-only after authentication and can be shared between
/// steps and the resulting artifact.
#[derive(Clone, Debug)]
pub struct ProxmoxClient {
    http: reqwest::Client,
    base_url: Url,
    auth: Auth,
    poll_interval: Duration,
    task_timeout: Duration,
}

impl ProxmoxClient {
    /// Builds a client and authenticates it.
    ///
    /// Token authentication is used when a token is configured; otherwise
    /// the client logs in with the password and keeps the ticket.
    ///
    /// # Errors
    ///
    /// Returns [`ProxmoxError::Config`] when configuration is invalid and
    /// [`ProxmoxError::Auth`] when login is rejected.
    pub async fn connect(config: &ProxmoxConfig) -> Result<Self, ProxmoxError> {
        config.validate()?;
        let mut client = Self::unauthenticated(config)?;
        client.auth = if let Some(secret) = config.token_secret() {
            debug!(username = %config.username, "using token auth");
            Auth::token(&config.username, secret)
        } else {
            let password = config.password.as_deref().unwrap_or_default();
            client.login(&config.username, password).await?
        };
        Ok(client)
    }

    fn unauthenticated(config: &ProxmoxConfig) -> Result<Self, ProxmoxError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(config.skip_cert_validation)
            .build()
            .map_err(|err| ProxmoxError::transport(&err))?;
        let base_url = Url::parse(config.url.trim().trim_end_matches('/'))
            .map_err(|err| ProxmoxError::Config(format!("invalid url {}: {err}", config.url)))?;
        Ok(Self {
            http,
            base_url,
            auth: Auth::Anonymous,
            poll_interval: TASK_POLL_INTERVAL,
            task_timeout: config.task_timeout(),
        })
    }

    /// Overrides the task polling interval.
    ///
    /// This is primarily used by tests to keep task waits fast.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProxmoxError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                ProxmoxError::Config(format!("{} cannot be used as an API base", self.base_url))
            })?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: &Method, segments: &[&str]) -> Result<RequestBuilder, ProxmoxError> {
        let url = self.endpoint(segments)?;
        let request = self.http.request(method.clone(), url);
        Ok(self.auth.apply(method, request))
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: &Method,
        segments: &[&str],
        request: RequestBuilder,
    ) -> Result<T, ProxmoxError> {
        let path = format!("/{}", segments.join("/"));
        debug!(%method, path = %path, "proxmox api call");
        let response = request
            .send()
            .await
            .map_err(|err| ProxmoxError::transport(&err))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ProxmoxError::transport(&err))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body).trim().to_owned();
            let fallback = if text.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_owned()
            } else {
                text
            };
            let message = serde_json::from_slice::<ErrorBody>(&body)
                .unwrap_or_default()
                .render(fallback);
            return Err(ProxmoxError::Api {
                method: method.to_string(),
                path,
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> =
            serde_json::from_slice(&body).map_err(|err| ProxmoxError::Decode {
                path,
                message: err.to_string(),
            })?;
        Ok(envelope.data)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
    ) -> Result<T, ProxmoxError> {
        let request = self.request(&method, segments)?;
        self.execute(&method, segments, request).await
    }

    async fn call_with_form<T, F>(
        &self,
        method: Method,
        segments: &[&str],
        form: &F,
    ) -> Result<T, ProxmoxError>
    where
        T: DeserializeOwned,
        F: Serialize + ?Sized,
    {
        let request = self.request(&method, segments)?.form(form);
        self.execute(&method, segments, request).await
    }

    async fn run_task(
        &self,
        method: Method,
        vm_ref: &VmRef,
        action: &[&str],
    ) -> Result<TaskStatus, ProxmoxError> {
        let id = vm_ref.id.to_string();
        let mut segments = vec!["nodes", vm_ref.node.as_str(), "lxc", id.as_str()];
        segments.extend_from_slice(action);
        let upid: String = self.call(method, &segments).await?;
        self.wait_for_task(&vm_ref.node, &Upid::from(upid)).await
    }

    async fn create_and_wait(
        &self,
        vm_ref: &VmRef,
        spec: &ContainerSpec,
    ) -> Result<TaskStatus, ProxmoxError> {
        let form = CreateContainerForm::new(vm_ref, spec);
        let upid: String = self
            .call_with_form(Method::POST, &["nodes", vm_ref.node.as_str(), "lxc"], &form)
            .await?;
        self.wait_for_task(&vm_ref.node, &Upid::from(upid)).await
    }
}

fn parse_vmid(raw: &serde_json::Value) -> Option<VmId> {
    let value = match raw {
        serde_json::Value::Number(number) => number.as_u64()?,
        serde_json::Value::String(text) => text.trim().parse().ok()?,
        _ => return None,
    };
    u32::try_from(value).ok().map(VmId::new)
}

impl Backend for ProxmoxClient {
    type Error = ProxmoxError;

    fn next_id(&self, hint: Option<VmId>) -> BackendFuture<'_, VmId, Self::Error> {
        Box::pin(async move {
            let segments = ["cluster", "nextid"];
            let mut request = self.request(&Method::GET, &segments)?;
            if let Some(id) = hint.filter(|id| !id.is_unset()) {
                request = request.query(&[("vmid", id.get())]);
            }
            let raw: serde_json::Value = self.execute(&Method::GET, &segments, request).await?;
            parse_vmid(&raw).ok_or_else(|| ProxmoxError::Decode {
                path: String::from("/cluster/nextid"),
                message: format!("unexpected identifier {raw}"),
            })
        })
    }

    fn create_container<'a>(
        &'a self,
        vm_ref: &'a VmRef,
        spec: &'a ContainerSpec,
    ) -> BackendFuture<'a, TaskStatus, Self::Error> {
        Box::pin(async move {
            spec.validate()?;
            self.create_and_wait(vm_ref, spec)
                .await
                .map_err(|err| err.classify_create(vm_ref.id.get(), &vm_ref.node))
        })
    }

    fn stop<'a>(&'a self, vm_ref: &'a VmRef) -> BackendFuture<'a, TaskStatus, Self::Error> {
        Box::pin(async move { self.run_task(Method::POST, vm_ref, &["status", "stop"]).await })
    }

    fn shutdown<'a>(&'a self, vm_ref: &'a VmRef) -> BackendFuture<'a, TaskStatus, Self::Error> {
        Box::pin(async move {
            self.run_task(Method::POST, vm_ref, &["status", "shutdown"])
                .await
        })
    }

    fn convert_to_template<'a>(&'a self, vm_ref: &'a VmRef) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let id = vm_ref.id.to_string();
            let segments = ["nodes", vm_ref.node.as_str(), "lxc", id.as_str(), "template"];
            let upid: Option<String> = self.call(Method::POST, &segments).await?;
            if let Some(upid) = upid {
                self.wait_for_task(&vm_ref.node, &Upid::from(upid)).await?;
            }
            Ok(())
        })
    }

    fn delete<'a>(&'a self, vm_ref: &'a VmRef) -> BackendFuture<'a, TaskStatus, Self::Error> {
        Box::pin(async move { self.run_task(Method::DELETE, vm_ref, &[]).await })
    }
}

#[cfg(test)]
mod tests;
