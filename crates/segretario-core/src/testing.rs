//! Test helpers: fixed bearer tokens and local stub servers standing in for Google APIs.

use async_trait::async_trait;

use crate::credentials::TokenSource;
use crate::error::CredentialsError;

pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, CredentialsError> {
        Ok(self.0.clone())
    }
}

/// Bind an ephemeral local port; returns the listener and its `http://` base URL.
pub async fn bind_stub() -> (tokio::net::TcpListener, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    (listener, base)
}

pub fn serve_stub(listener: tokio::net::TcpListener, app: axum::Router) {
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

pub async fn spawn_stub(app: axum::Router) -> String {
    let (listener, base) = bind_stub().await;
    serve_stub(listener, app);
    base
}
