//! Pairing handshake: an app asks for a capability token, a human approves
//! or denies, and the app polls until it learns the outcome.

use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use metrics::counter;
use plugmyai_core::{Scope, ids};
use plugmyai_providers::Registry;
use plugmyai_store::{ConnectRequest, ConnectStatus, NewApp, PairingStatus, Store};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::notify::ApprovalSurface;

/// Body of `POST /v1/connect`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_url: String,
    #[serde(default)]
    pub app_icon: String,
    #[serde(default)]
    pub requested_scope: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectStarted {
    pub request_id: String,
    pub status: PairingStatus,
    pub approve_url: String,
    pub poll_url: String,
    pub expires_at: String,
}

/// What an unauthenticated poll may see.
#[derive(Debug, Clone, Serialize)]
pub struct PollResponse {
    pub status: PairingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_scope: Option<Scope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub status: PairingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OfferedProvider {
    pub id: &'static str,
    pub name: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct OfferableProviders {
    pub providers: Vec<OfferedProvider>,
    pub requested_scope: Scope,
}

pub struct Pairing {
    store: Arc<Store>,
    registry: Arc<Registry>,
    surface: Arc<dyn ApprovalSurface>,
    ttl: Duration,
    port: u16,
}

impl Pairing {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        surface: Arc<dyn ApprovalSurface>,
        ttl: std::time::Duration,
        port: u16,
    ) -> Self {
        Self {
            store,
            registry,
            surface,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(5)),
            port,
        }
    }

    /// Record a new pending request and present it for approval.
    pub fn start(self: &Arc<Self>, params: ConnectParams) -> Result<ConnectStarted, ApiError> {
        let app_name = params.app_name.trim();
        if app_name.is_empty() {
            return Err(ApiError::InvalidRequest("app_name is required".into()));
        }
        let scope = Scope::parse_or(params.requested_scope.as_deref(), Scope::Chat)
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

        let now = Utc::now();
        let req = ConnectRequest {
            id: ids::short_id(),
            app_name: app_name.to_string(),
            app_url: params.app_url,
            app_icon: params.app_icon,
            requested_scope: scope,
            status: ConnectStatus::Pending,
            token: None,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.store.create_connect_request(&req)?;
        counter!("pairing_requests_total", 1, "outcome" => "created");
        info!(request_id = %req.id, app = %req.app_name, scope = %scope, "pairing requested");

        let approve_url = format!("http://localhost:{}/#/approve?req={}", self.port, req.id);
        let decision = DecisionHandle {
            pairing: Arc::clone(self),
            request_id: req.id.clone(),
        };
        self.surface.present(&req.app_name, &approve_url, decision);

        Ok(ConnectStarted {
            poll_url: format!("http://localhost:{}/v1/connect/{}", self.port, req.id),
            request_id: req.id,
            status: PairingStatus::Pending,
            approve_url,
            expires_at: rfc3339(req.expires_at),
        })
    }

    pub fn poll(&self, id: &str) -> Result<PollResponse, ApiError> {
        let req = self.find(id)?;
        let status = req.effective_status(Utc::now());
        if status == PairingStatus::Expired {
            return Ok(PollResponse {
                status,
                app_name: None,
                app_url: None,
                app_icon: None,
                requested_scope: None,
                token: None,
            });
        }
        let token = match status {
            PairingStatus::Approved => req.token,
            _ => None,
        };
        Ok(PollResponse {
            status,
            app_name: Some(req.app_name),
            app_url: Some(req.app_url),
            app_icon: Some(req.app_icon),
            requested_scope: Some(req.requested_scope),
            token,
        })
    }

    /// Approve a pending request, minting the app and its token.
    ///
    /// `scope` defaults to the requested scope; an empty `providers` list
    /// leaves the app unrestricted.
    pub fn approve(
        &self,
        id: &str,
        mut providers: Vec<String>,
        scope: Option<Scope>,
    ) -> Result<Decision, ApiError> {
        let req = self.find(id)?;
        let now = Utc::now();
        ensure_pending(&req, now)?;
        if let Some(unknown) = providers
            .iter()
            .find(|p| self.registry.find_by_id(p).is_none())
        {
            return Err(ApiError::InvalidRequest(format!("unknown provider: {unknown}")));
        }
        providers.sort();
        providers.dedup();

        let new_app = NewApp {
            name: req.app_name.clone(),
            url: req.app_url.clone(),
            scope: scope.unwrap_or(req.requested_scope),
            providers,
        };
        match self.store.approve_connect_request(id, &new_app, now)? {
            Some(app) => {
                counter!("pairing_requests_total", 1, "outcome" => "approved");
                info!(request_id = id, app_id = %app.id, scope = %app.scope, "pairing approved");
                Ok(Decision {
                    status: PairingStatus::Approved,
                    app_id: Some(app.id),
                })
            }
            // decided or expired between the read and the update
            None => Err(self.not_pending(id)),
        }
    }

    pub fn deny(&self, id: &str) -> Result<Decision, ApiError> {
        let req = self.find(id)?;
        let now = Utc::now();
        ensure_pending(&req, now)?;
        if !self.store.deny_connect_request(id, now)? {
            return Err(self.not_pending(id));
        }
        counter!("pairing_requests_total", 1, "outcome" => "denied");
        info!(request_id = id, app = %req.app_name, "pairing denied");
        Ok(Decision {
            status: PairingStatus::Denied,
            app_id: None,
        })
    }

    /// Pending, non-expired requests, newest first.
    pub fn pending(&self) -> Result<Vec<ConnectRequest>, ApiError> {
        Ok(self.store.list_pending_connect_requests(Utc::now())?)
    }

    /// Providers an approver may grant to a still-pending request.
    pub async fn offerable_providers(&self, id: &str) -> Result<OfferableProviders, ApiError> {
        let req = self.find(id)?;
        ensure_pending(&req, Utc::now())?;
        let providers = self
            .registry
            .available()
            .await
            .into_iter()
            .map(|p| OfferedProvider {
                id: p.id(),
                name: p.name(),
            })
            .collect();
        Ok(OfferableProviders {
            providers,
            requested_scope: req.requested_scope,
        })
    }

    fn find(&self, id: &str) -> Result<ConnectRequest, ApiError> {
        self.store
            .get_connect_request(id)?
            .ok_or_else(|| ApiError::NotFound("connect request not found".into()))
    }

    fn not_pending(&self, id: &str) -> ApiError {
        match self.find(id) {
            Ok(req) => match ensure_pending(&req, Utc::now()) {
                Err(e) => e,
                Ok(()) => ApiError::Internal("pairing request could not be updated".into()),
            },
            Err(e) => e,
        }
    }
}

fn ensure_pending(req: &ConnectRequest, now: DateTime<Utc>) -> Result<(), ApiError> {
    match req.effective_status(now) {
        PairingStatus::Pending => Ok(()),
        PairingStatus::Expired => Err(ApiError::InvalidRequest("request expired".into())),
        decided => Err(ApiError::InvalidRequest(format!(
            "request already {}",
            decided.as_str()
        ))),
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Lets an approval surface decide one request.
#[derive(Clone)]
pub struct DecisionHandle {
    pairing: Arc<Pairing>,
    request_id: String,
}

impl DecisionHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Grant access with an optional provider allow-list and scope override.
    pub fn approve(&self, providers: Vec<String>, scope: Option<Scope>) -> Result<Decision, ApiError> {
        self.pairing.approve(&self.request_id, providers, scope)
    }

    pub fn deny(&self) -> Result<Decision, ApiError> {
        self.pairing.deny(&self.request_id)
    }
}

impl std::fmt::Debug for DecisionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionHandle")
            .field("request_id", &self.request_id)
            .finish()
    }
}
