//! Resolves opaque caller credentials to an `Auth` identity. Two
//! implementations: a no-op for local/test use and an HTTP delegate for a
//! real deployment.

use async_trait::async_trait;
use imgtag_core::Auth;
use serde::Serialize;

/// Turns opaque credentials into a resolved identity. Implementations
/// should treat "credentials don't resolve to anyone" as
/// `Ok(Auth::anonymous())`, reserving `Err` for the authorizer itself being
/// unreachable or misbehaving.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, credentials: &str) -> anyhow::Result<Auth>;
}

/// Resolves everything to `Auth::anonymous()`. Used when no authorizer URL
/// is configured.
pub struct NoopAuthorizer;

#[async_trait]
impl Authorizer for NoopAuthorizer {
    async fn authorize(&self, _credentials: &str) -> anyhow::Result<Auth> {
        Ok(Auth::anonymous())
    }
}

#[derive(Serialize)]
struct AuthorizeRequest<'a> {
    credentials: &'a str,
}

/// Delegates to an external HTTP service: `POST {url}` with
/// `{"credentials":...}`, expecting a 200 response body that decodes as
/// `Auth`. A 403 or 404 response resolves to anonymous rather than an
/// error; any other non-2xx status is treated as the authorizer failing.
pub struct HttpAuthorizer {
    url: String,
    client: reqwest::Client,
}

impl HttpAuthorizer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(&self, credentials: &str) -> anyhow::Result<Auth> {
        let response = self
            .client
            .post(&self.url)
            .json(&AuthorizeRequest { credentials })
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<Auth>().await?),
            status if status.as_u16() == 403 || status.as_u16() == 404 => {
                log::debug!("authorizer returned {status}, resolving to anonymous");
                Ok(Auth::anonymous())
            }
            status => anyhow::bail!("authorizer returned unexpected status {status}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_authorizer_always_resolves_anonymous() {
        let auth = NoopAuthorizer.authorize("anything").await.unwrap();
        assert_eq!(auth, Auth::anonymous());
    }
}
