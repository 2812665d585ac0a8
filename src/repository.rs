//! Data-access contracts for gateway configuration, plus in-memory
//! reference implementations.
//!
//! The relational store lives behind these traits; the data plane only ever
//! sees entities returned by value. The in-memory implementations back the
//! standalone binary and the test suite.

use crate::error::{GatewayError, Result};
use crate::matcher;
use crate::model::{ApiKey, Origin, RequestLog, Route, Tenant};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn create(&self, tenant: Tenant) -> Result<Tenant>;
    async fn get_by_id(&self, id: Uuid) -> Result<Tenant>;
    async fn get_by_subdomain(&self, subdomain: &str) -> Result<Tenant>;
    async fn get_by_external_id(&self, external_id: &str) -> Result<Tenant>;
    async fn list(&self) -> Result<Vec<Tenant>>;
    async fn update(&self, tenant: Tenant) -> Result<Tenant>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait OriginRepository: Send + Sync {
    async fn create(&self, origin: Origin) -> Result<Origin>;
    async fn get_by_id(&self, id: Uuid) -> Result<Origin>;
    async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<Origin>>;
    async fn list(&self) -> Result<Vec<Origin>>;
    async fn update(&self, origin: Origin) -> Result<Origin>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait RouteRepository: Send + Sync {
    async fn create(&self, route: Route) -> Result<Route>;
    async fn get_by_id(&self, id: Uuid) -> Result<Route>;
    /// Active routes of a tenant, highest priority first.
    async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<Route>>;
    async fn update(&self, route: Route) -> Result<Route>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    /// Best active route for (path, method), if any.
    async fn find_matching_route(
        &self,
        tenant_id: Uuid,
        path: &str,
        method: &http::Method,
    ) -> Result<Option<Route>>;
}

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    async fn create(&self, key: ApiKey) -> Result<ApiKey>;
    async fn get_by_id(&self, id: Uuid) -> Result<ApiKey>;
    async fn get_by_hash(&self, key_hash: &str) -> Result<ApiKey>;
    async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>>;
    async fn update(&self, key: ApiKey) -> Result<ApiKey>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    /// Bumps the usage counter and last-used timestamp.
    async fn record_usage(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait RequestLogRepository: Send + Sync {
    async fn create(&self, log: RequestLog) -> Result<()>;
    async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<RequestLog>>;
}

/// One handle per entity repository, shared across the gateway.
#[derive(Clone)]
pub struct Repositories {
    pub tenants: Arc<dyn TenantRepository>,
    pub origins: Arc<dyn OriginRepository>,
    pub routes: Arc<dyn RouteRepository>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub request_logs: Arc<dyn RequestLogRepository>,
}

impl Repositories {
    /// Builds a fully in-memory repository set.
    pub fn in_memory() -> Self {
        Self {
            tenants: Arc::new(InMemoryTenantRepository::new()),
            origins: Arc::new(InMemoryOriginRepository::new()),
            routes: Arc::new(InMemoryRouteRepository::new()),
            api_keys: Arc::new(InMemoryApiKeyRepository::new()),
            request_logs: Arc::new(InMemoryRequestLogRepository::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryTenantRepository {
    tenants: DashMap<Uuid, Tenant>,
}

impl InMemoryTenantRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantRepository for InMemoryTenantRepository {
    async fn create(&self, tenant: Tenant) -> Result<Tenant> {
        if self
            .tenants
            .iter()
            .any(|t| t.subdomain == tenant.subdomain)
        {
            return Err(GatewayError::Repository(format!(
                "subdomain already taken: {}",
                tenant.subdomain
            )));
        }
        self.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Tenant> {
        self.tenants
            .get(&id)
            .map(|t| t.clone())
            .ok_or(GatewayError::UnknownTenant)
    }

    async fn get_by_subdomain(&self, subdomain: &str) -> Result<Tenant> {
        self.tenants
            .iter()
            .find(|t| t.subdomain == subdomain)
            .map(|t| t.clone())
            .ok_or(GatewayError::UnknownTenant)
    }

    async fn get_by_external_id(&self, external_id: &str) -> Result<Tenant> {
        self.tenants
            .iter()
            .find(|t| t.external_org_id.as_deref() == Some(external_id))
            .map(|t| t.clone())
            .ok_or(GatewayError::UnknownTenant)
    }

    async fn list(&self) -> Result<Vec<Tenant>> {
        Ok(self.tenants.iter().map(|t| t.clone()).collect())
    }

    async fn update(&self, mut tenant: Tenant) -> Result<Tenant> {
        if !self.tenants.contains_key(&tenant.id) {
            return Err(GatewayError::UnknownTenant);
        }
        tenant.updated_at = Utc::now();
        self.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.tenants
            .remove(&id)
            .map(|_| ())
            .ok_or(GatewayError::UnknownTenant)
    }
}

#[derive(Default)]
pub struct InMemoryOriginRepository {
    origins: DashMap<Uuid, Origin>,
}

impl InMemoryOriginRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OriginRepository for InMemoryOriginRepository {
    async fn create(&self, origin: Origin) -> Result<Origin> {
        if origin.weight == 0 {
            return Err(GatewayError::Repository(
                "origin weight must be at least 1".to_string(),
            ));
        }
        self.origins.insert(origin.id, origin.clone());
        Ok(origin)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Origin> {
        self.origins
            .get(&id)
            .map(|o| o.clone())
            .ok_or(GatewayError::NotFound {
                entity: "origin",
                id: id.to_string(),
            })
    }

    async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<Origin>> {
        Ok(self
            .origins
            .iter()
            .filter(|o| o.tenant_id == tenant_id)
            .map(|o| o.clone())
            .collect())
    }

    async fn list(&self) -> Result<Vec<Origin>> {
        Ok(self.origins.iter().map(|o| o.clone()).collect())
    }

    async fn update(&self, mut origin: Origin) -> Result<Origin> {
        if !self.origins.contains_key(&origin.id) {
            return Err(GatewayError::NotFound {
                entity: "origin",
                id: origin.id.to_string(),
            });
        }
        origin.updated_at = Utc::now();
        self.origins.insert(origin.id, origin.clone());
        Ok(origin)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.origins
            .remove(&id)
            .map(|_| ())
            .ok_or(GatewayError::NotFound {
                entity: "origin",
                id: id.to_string(),
            })
    }
}

#[derive(Default)]
pub struct InMemoryRouteRepository {
    routes: DashMap<Uuid, Route>,
}

impl InMemoryRouteRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RouteRepository for InMemoryRouteRepository {
    async fn create(&self, route: Route) -> Result<Route> {
        self.routes.insert(route.id, route.clone());
        Ok(route)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Route> {
        self.routes
            .get(&id)
            .map(|r| r.clone())
            .ok_or(GatewayError::NotFound {
                entity: "route",
                id: id.to_string(),
            })
    }

    async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<Route>> {
        let mut routes: Vec<Route> = self
            .routes
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.is_active)
            .map(|r| r.clone())
            .collect();
        routes.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(routes)
    }

    async fn update(&self, mut route: Route) -> Result<Route> {
        if !self.routes.contains_key(&route.id) {
            return Err(GatewayError::NotFound {
                entity: "route",
                id: route.id.to_string(),
            });
        }
        route.updated_at = Utc::now();
        self.routes.insert(route.id, route.clone());
        Ok(route)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.routes
            .remove(&id)
            .map(|_| ())
            .ok_or(GatewayError::NotFound {
                entity: "route",
                id: id.to_string(),
            })
    }

    async fn find_matching_route(
        &self,
        tenant_id: Uuid,
        path: &str,
        method: &http::Method,
    ) -> Result<Option<Route>> {
        let routes = self.list_by_tenant(tenant_id).await?;
        Ok(matcher::select_route(&routes, path, method).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryApiKeyRepository {
    keys: DashMap<Uuid, ApiKey>,
}

impl InMemoryApiKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyRepository for InMemoryApiKeyRepository {
    async fn create(&self, key: ApiKey) -> Result<ApiKey> {
        self.keys.insert(key.id, key.clone());
        Ok(key)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<ApiKey> {
        self.keys
            .get(&id)
            .map(|k| k.clone())
            .ok_or(GatewayError::NotFound {
                entity: "api key",
                id: id.to_string(),
            })
    }

    async fn get_by_hash(&self, key_hash: &str) -> Result<ApiKey> {
        self.keys
            .iter()
            .find(|k| k.key_hash == key_hash)
            .map(|k| k.clone())
            .ok_or_else(|| GatewayError::AuthFailed("invalid api key".to_string()))
    }

    async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>> {
        Ok(self
            .keys
            .iter()
            .filter(|k| k.tenant_id == tenant_id)
            .map(|k| k.clone())
            .collect())
    }

    async fn update(&self, key: ApiKey) -> Result<ApiKey> {
        if !self.keys.contains_key(&key.id) {
            return Err(GatewayError::NotFound {
                entity: "api key",
                id: key.id.to_string(),
            });
        }
        self.keys.insert(key.id, key.clone());
        Ok(key)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.keys
            .remove(&id)
            .map(|_| ())
            .ok_or(GatewayError::NotFound {
                entity: "api key",
                id: id.to_string(),
            })
    }

    async fn record_usage(&self, id: Uuid) -> Result<()> {
        let mut entry = self.keys.get_mut(&id).ok_or(GatewayError::NotFound {
            entity: "api key",
            id: id.to_string(),
        })?;
        entry.usage_count += 1;
        entry.last_used_at = Some(Utc::now());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryRequestLogRepository {
    logs: DashMap<Uuid, RequestLog>,
}

impl InMemoryRequestLogRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestLogRepository for InMemoryRequestLogRepository {
    async fn create(&self, log: RequestLog) -> Result<()> {
        self.logs.insert(log.id, log);
        Ok(())
    }

    async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<RequestLog>> {
        Ok(self
            .logs
            .iter()
            .filter(|l| l.tenant_id == tenant_id)
            .map(|l| l.clone())
            .collect())
    }
}
