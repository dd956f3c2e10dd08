//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tollgate_auth::prelude::*;
use tollgate_auth::types::Form;
use tollgate_auth_memory::{MemoryClientDirectory, MemoryResourceOwners, dependencies};

pub const SECRET: &str = "integration-test-secret-0123456789";
pub const REDIRECT_URI: &str = "https://app.example.com/callback";

pub struct Harness {
    pub engine: TokenEngine,
    pub storage: Arc<dyn AuthStorage>,
    pub clients: Arc<MemoryClientDirectory>,
    pub strategy: HmacTokenStrategy,
}

pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.encryption.system_secrets = vec![SECRET.to_string()];
    config
}

pub fn grace_config(grace: Duration) -> EngineConfig {
    let mut config = config();
    config.refresh.rotation_grace_period = grace;
    config
}

pub fn harness() -> Harness {
    harness_with(config(), None)
}

pub fn harness_with(config: EngineConfig, owners: Option<Arc<MemoryResourceOwners>>) -> Harness {
    let clients = Arc::new(MemoryClientDirectory::new());
    clients.register(web_client());
    clients.register(service_client());
    clients.register(device_client());
    clients.register(password_client());

    let deps = dependencies(config, Arc::clone(&clients), owners).unwrap();
    let storage = Arc::clone(&deps.storage);
    Harness {
        engine: TokenEngine::new(deps),
        storage,
        clients,
        strategy: HmacTokenStrategy::new(SECRET).unwrap(),
    }
}

pub fn ctx() -> RequestContext {
    RequestContext::new(NetworkId::random())
}

/// Public client for the code, implicit and refresh grants.
pub fn web_client() -> Client {
    let mut client = Client::new("web");
    client.scopes = vec!["openid".into(), "offline".into(), "photos".into()];
    client.grant_types = vec![
        GrantType::AuthorizationCode,
        GrantType::Implicit,
        GrantType::RefreshToken,
    ];
    client.response_types = vec!["code".into(), "token".into()];
    client.redirect_uris = vec![REDIRECT_URI.into()];
    client.audience = vec!["https://api.example.com".into()];
    client
}

/// Confidential client for client credentials.
pub fn service_client() -> Client {
    let mut client = Client::new("service");
    client.public = false;
    client.scopes = vec!["photos".into()];
    client.grant_types = vec![GrantType::ClientCredentials, GrantType::RefreshToken];
    client.audience = vec!["https://api.example.com".into()];
    client
}

pub fn device_client() -> Client {
    let mut client = Client::new("tv");
    client.scopes = vec!["offline".into(), "photos".into()];
    client.grant_types = vec![GrantType::DeviceCode, GrantType::RefreshToken];
    client
}

pub fn password_client() -> Client {
    let mut client = Client::new("cli");
    client.scopes = vec!["offline".into(), "photos".into()];
    client.grant_types = vec![GrantType::Password, GrantType::RefreshToken];
    client
}

/// An authorize request already granted `scopes` for `subject`.
pub fn authorize_request(client: Client, subject: &str, scopes: &[&str]) -> Request {
    let mut request = Request::new(client, Session::new(subject));
    for scope in scopes {
        request.requested_scope.push((*scope).to_string());
        request.grant_scope(*scope);
    }
    request.form.set("response_type", "code");
    request.form.set("redirect_uri", REDIRECT_URI);
    request
}

pub fn token_request(grant_type: GrantType, client: Client, params: &[(&str, &str)]) -> AccessRequest {
    let mut form = Form::new();
    form.set("grant_type", grant_type.as_str());
    for (key, value) in params {
        form.set(*key, *value);
    }
    let mut request = Request::new(client, Session::default());
    request.form = form;
    AccessRequest::new(grant_type.as_str(), request)
}

impl Harness {
    pub fn signature(&self, token_type: TokenType, token: &str) -> String {
        self.strategy.signature(token_type, token).unwrap()
    }

    /// Issues a code for `request` and redeems it at the token endpoint.
    pub async fn code_exchange(&self, ctx: &RequestContext, mut request: Request) -> AccessResponse {
        let client = request.client.clone();
        let code = self
            .engine
            .issue_authorization_code(ctx, &mut request)
            .await
            .unwrap();
        self.engine
            .handle_token_request(
                ctx,
                token_request(
                    GrantType::AuthorizationCode,
                    client,
                    &[("code", &code), ("redirect_uri", REDIRECT_URI)],
                ),
            )
            .await
            .unwrap()
    }

    pub async fn refresh(
        &self,
        ctx: &RequestContext,
        client: Client,
        refresh_token: &str,
    ) -> AuthResult<AccessResponse> {
        self.engine
            .handle_token_request(
                ctx,
                token_request(
                    GrantType::RefreshToken,
                    client,
                    &[("refresh_token", refresh_token)],
                ),
            )
            .await
    }

    pub async fn access_session(&self, ctx: &RequestContext, token: &str) -> AuthResult<Request> {
        self.engine
            .sessions()
            .get(ctx, SessionKind::Access, &self.signature(TokenType::AccessToken, token))
            .await
    }

    pub async fn refresh_session(&self, ctx: &RequestContext, token: &str) -> AuthResult<Request> {
        self.engine
            .sessions()
            .get(ctx, SessionKind::Refresh, &self.signature(TokenType::RefreshToken, token))
            .await
    }
}
