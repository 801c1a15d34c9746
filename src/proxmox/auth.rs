//! Authentication for the Proxmox API: API tokens or ticket login.

use reqwest::{Method, RequestBuilder};
use tracing::debug;

use super::types::{Envelope, TicketBody};
use super::{ProxmoxClient, ProxmoxError};

/// Credentials attached to every request.
#[derive(Clone, Debug)]
pub(super) enum Auth {
    /// `Authorization: PVEAPIToken=<user>=<secret>`.
    Token { header: String },
    /// Ticket cookie plus CSRF token for mutating calls.
    Ticket { ticket: String, csrf: String },
    /// Placeholder used before login completes.
    Anonymous,
}

impl Auth {
    pub(super) fn token(username: &str, secret: &str) -> Self {
        Self::Token {
            header: format!("PVEAPIToken={username}={secret}"),
        }
    }

    pub(super) fn apply(&self, method: &Method, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::Token { header } => request.header(reqwest::header::AUTHORIZATION, header),
            Self::Ticket { ticket, csrf } => {
                let with_cookie =
                    request.header(reqwest::header::COOKIE, format!("PVEAuthCookie={ticket}"));
                if *method == Method::GET {
                    with_cookie
                } else {
                    with_cookie.header("CSRFPreventionToken", csrf)
                }
            }
            Self::Anonymous => request,
        }
    }
}

impl ProxmoxClient {
    /// Exchanges a username and password for a ticket.
    pub(super) async fn login(&self, username: &str, password: &str) -> Result<Auth, ProxmoxError> {
        debug!(username, "using password auth");
        let url = self.endpoint(&["access", "ticket"])?;
        let response = self
            .http
            .post(url)
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .map_err(|err| ProxmoxError::transport(&err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxmoxError::Auth {
                username: username.to_owned(),
                message: format!("login rejected with status {}", status.as_u16()),
            });
        }

        let body: Envelope<TicketBody> =
            response
                .json()
                .await
                .map_err(|err| ProxmoxError::Decode {
                    path: String::from("/access/ticket"),
                    message: err.to_string(),
                })?;
        Ok(Auth::Ticket {
            ticket: body.data.ticket,
            csrf: body.data.csrf_prevention_token,
        })
    }
}
