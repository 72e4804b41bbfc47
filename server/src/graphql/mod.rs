mod access;

use anyhow::anyhow;
use async_graphql::{
    Context, EmptyMutation, EmptySubscription, ErrorExtensions, Object, Schema, SimpleObject,
};
use platform_api::{ApiError, ApiResult, internal_error};
use serde::Serialize;
use tracing::instrument;

use crate::gate::Gate;

pub use access::{AccessPayload, RoutePayload};

pub type SchemaType = Schema<QueryRoot, EmptyMutation, EmptySubscription>;

/// Bearer token of the HTTP request carrying the query.
#[derive(Clone, Debug, Default)]
pub struct RequestToken(pub Option<String>);

fn attached_gate<'a>(ctx: &Context<'a>) -> async_graphql::Result<&'a Gate> {
    ctx.data::<Gate>()
        .map_err(|err| internal_error(anyhow!("access gate not attached to schema: {}", err.message)))
}

pub fn build_schema(gate: Gate) -> SchemaType {
    Schema::build(QueryRoot, EmptyMutation, EmptySubscription)
        .data(gate)
        .finish()
}

#[derive(Default)]
pub struct QueryRoot;

#[Object]
impl QueryRoot {
    #[instrument(name = "graphql.health", skip_all)]
    async fn health(&self) -> ApiResult<HealthPayload> {
        Ok(HealthPayload { ok: true })
    }

    #[instrument(name = "graphql.version", skip_all)]
    async fn version(&self) -> ApiResult<String> {
        Ok(env!("CARGO_PKG_VERSION").to_string())
    }

    /// Route access table in effect.
    #[instrument(name = "graphql.routes", skip_all)]
    async fn routes(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<RoutePayload>> {
        Ok(RoutePayload::from_policy(attached_gate(ctx)?.policy()))
    }

    /// Resolve what the caller would see when navigating to `path`.
    #[instrument(name = "graphql.access", skip(self, ctx))]
    async fn access(
        &self,
        ctx: &Context<'_>,
        path: String,
    ) -> async_graphql::Result<AccessPayload> {
        let gate = attached_gate(ctx)?;
        let token = ctx
            .data_opt::<RequestToken>()
            .and_then(|token| token.0.as_deref());
        let evaluation = gate
            .evaluate(token, &path)
            .await
            .map_err(|err| ApiError::invalid(err).extend())?;
        Ok(AccessPayload::from(evaluation))
    }
}

#[derive(Clone, Debug, SimpleObject, Serialize)]
pub struct HealthPayload {
    pub ok: bool,
}
