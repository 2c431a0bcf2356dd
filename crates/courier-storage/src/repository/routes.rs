//! Routes, endpoints, credentials and domains
//!
//! These are configuration rows the pipeline only reads, apart from
//! stamping `last_used_at` on endpoints.

use crate::db::{db_err, DatabasePool};
use crate::models::{
    AddressEndpoint, Credential, Domain, Endpoint, EndpointKind, HttpEndpoint, Route,
    SmtpEndpoint,
};
use async_trait::async_trait;
use courier_common::types::{CredentialId, DomainId, EndpointId, RouteId};
use courier_common::Result;

/// Route repository trait
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Get a route by ID
    async fn get_route(&self, id: RouteId) -> Result<Option<Route>>;

    /// Resolve an endpoint from its stored type name. Unknown type names
    /// resolve to `None`.
    async fn get_endpoint(&self, endpoint_type: &str, id: EndpointId) -> Result<Option<Endpoint>>;

    /// Stamp the endpoint as used now
    async fn mark_endpoint_used(&self, endpoint: &Endpoint) -> Result<()>;

    /// Get a credential by ID
    async fn get_credential(&self, id: CredentialId) -> Result<Option<Credential>>;

    /// Get a domain by ID
    async fn get_domain(&self, id: DomainId) -> Result<Option<Domain>>;
}

/// PostgreSQL route repository implementation
pub struct DbRouteStore {
    pool: DatabasePool,
}

impl DbRouteStore {
    /// Create a new repository
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RouteStore for DbRouteStore {
    async fn get_route(&self, id: RouteId) -> Result<Option<Route>> {
        sqlx::query_as::<_, Route>("SELECT * FROM routes WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn get_endpoint(&self, endpoint_type: &str, id: EndpointId) -> Result<Option<Endpoint>> {
        let Some(kind) = EndpointKind::from_type_str(endpoint_type) else {
            return Ok(None);
        };

        let pool = self.pool.pool();
        let endpoint = match kind {
            EndpointKind::Smtp => {
                sqlx::query_as::<_, SmtpEndpoint>("SELECT * FROM smtp_endpoints WHERE id = $1")
                    .bind(id)
                    .fetch_optional(pool)
                    .await
                    .map_err(db_err)?
                    .map(Endpoint::Smtp)
            }
            EndpointKind::Http => {
                sqlx::query_as::<_, HttpEndpoint>("SELECT * FROM http_endpoints WHERE id = $1")
                    .bind(id)
                    .fetch_optional(pool)
                    .await
                    .map_err(db_err)?
                    .map(Endpoint::Http)
            }
            EndpointKind::Address => {
                sqlx::query_as::<_, AddressEndpoint>(
                    "SELECT * FROM address_endpoints WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(pool)
                .await
                .map_err(db_err)?
                .map(Endpoint::Address)
            }
        };

        Ok(endpoint)
    }

    async fn mark_endpoint_used(&self, endpoint: &Endpoint) -> Result<()> {
        let query = match endpoint.kind() {
            EndpointKind::Smtp => "UPDATE smtp_endpoints SET last_used_at = NOW() WHERE id = $1",
            EndpointKind::Http => "UPDATE http_endpoints SET last_used_at = NOW() WHERE id = $1",
            EndpointKind::Address => {
                "UPDATE address_endpoints SET last_used_at = NOW() WHERE id = $1"
            }
        };

        sqlx::query(query)
            .bind(endpoint.id())
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_credential(&self, id: CredentialId) -> Result<Option<Credential>> {
        sqlx::query_as::<_, Credential>("SELECT * FROM credentials WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn get_domain(&self, id: DomainId) -> Result<Option<Domain>> {
        sqlx::query_as::<_, Domain>("SELECT * FROM domains WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }
}
