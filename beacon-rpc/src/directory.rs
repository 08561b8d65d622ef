//! Application-directory seam.
//!
//! The client dialogue needs three REST lookups (application metadata, its
//! asset list, external-asset resolution). They sit behind a trait so the
//! dialogue can be exercised against a stub in tests.

use async_trait::async_trait;
use beacon_http::{ExternalAsset, HttpError, RestClient, RpcApp, RpcAsset};

/// REST lookups the rich-presence dialogue depends on.
#[async_trait]
pub trait AppDirectory: Send + Sync {
    async fn rpc_app(&self, app_id: &str) -> Result<RpcApp, HttpError>;

    async fn rpc_assets(&self, app_id: &str) -> Result<Vec<RpcAsset>, HttpError>;

    async fn resolve_external(
        &self,
        app_id: &str,
        url: &str,
    ) -> Result<Vec<ExternalAsset>, HttpError>;
}

#[async_trait]
impl AppDirectory for RestClient {
    async fn rpc_app(&self, app_id: &str) -> Result<RpcApp, HttpError> {
        self.get_rpc_app(app_id).await
    }

    async fn rpc_assets(&self, app_id: &str) -> Result<Vec<RpcAsset>, HttpError> {
        self.get_rpc_app_assets(app_id).await
    }

    async fn resolve_external(
        &self,
        app_id: &str,
        url: &str,
    ) -> Result<Vec<ExternalAsset>, HttpError> {
        self.get_rpc_app_external(app_id, url).await
    }
}
