//! CloudStack API client.
//!
//! Ties the pieces together for one call: resolve the endpoint context,
//! sign the URL, run it through the transport and classify the response.

use crate::classify::classify;
use crate::config::{ContextProvider, EndpointContext, DEFAULT_PAGE_SIZE};
use crate::error::{CsError, CsResult};
use crate::hydrate::HydrationScope;
use crate::paginate::Paginator;
use crate::param::Param;
use crate::signing::build_request;
use crate::transport::{HttpTransport, Transport};
use crate::wire::WireObserver;
use crate::xml::{XmlDocument, XmlElement};
use std::sync::Arc;

pub const LIST_ZONES: &str = "listZones";

/// Cloneable handle for issuing signed CloudStack commands.
#[derive(Clone)]
pub struct CsClient {
    context: Arc<dyn ContextProvider>,
    transport: Arc<dyn Transport>,
    wire: Option<Arc<dyn WireObserver>>,
}

impl CsClient {
    /// Client over the real HTTP transport.
    pub fn new<P>(context: P) -> Self
    where
        P: ContextProvider + 'static,
    {
        Self::with_transport(Arc::new(context), Arc::new(HttpTransport::new()))
    }

    pub fn with_transport(context: Arc<dyn ContextProvider>, transport: Arc<dyn Transport>) -> Self {
        Self {
            context,
            transport,
            wire: None,
        }
    }

    /// Attach a wire observer for request/response tracing.
    pub fn with_wire(mut self, wire: Arc<dyn WireObserver>) -> Self {
        self.wire = Some(wire);
        self
    }

    /// Current endpoint context with keys sanitised.
    pub fn context(&self) -> CsResult<EndpointContext> {
        self.context
            .context()
            .map(|ctx| ctx.sanitized())
            .ok_or_else(|| CsError::configuration("No context was set for this request"))
    }

    /// Active zone and account of the current context.
    pub fn scope(&self) -> CsResult<HydrationScope> {
        let ctx = self.context()?;
        Ok(HydrationScope {
            region_id: ctx.region_id,
            account_number: ctx.account_number,
        })
    }

    /// Signed URL for a command.
    pub fn build_url(&self, command: &str, params: &[Param]) -> CsResult<String> {
        let ctx = self.context.context().map(|ctx| ctx.sanitized());
        build_request(command, params, ctx.as_ref())
    }

    /// Execute a command. `Ok(None)` means the server reported that no
    /// resource of the requested type matches.
    pub async fn get(&self, command: &str, params: &[Param]) -> CsResult<Option<XmlDocument>> {
        let ctx = self.context()?;
        let url = build_request(command, params, Some(&ctx))?;
        log::debug!("get(): {}", command);
        let response = self
            .transport
            .execute(&url, &ctx, self.wire.as_deref())
            .await?;
        log::debug!("get(): {} -> HTTP {}", command, response.status);
        classify(&response, self.wire.as_deref())
    }

    /// Like [`CsClient::get`] but treats the not-found signal as an error,
    /// for commands that must always answer.
    pub async fn get_required(&self, command: &str, params: &[Param]) -> CsResult<XmlDocument> {
        self.get(command, params)
            .await?
            .ok_or_else(|| CsError::communication(format!("No response document for {}", command)))
    }

    /// List every page of a command with the default page size.
    pub async fn list_all<T, F>(
        &self,
        command: &str,
        params: &[Param],
        tag: &str,
        hydrate: F,
    ) -> CsResult<Vec<T>>
    where
        T: Send,
        F: FnMut(&XmlElement) -> CsResult<Option<T>> + Send,
    {
        self.list_all_with_page_size(command, params, tag, DEFAULT_PAGE_SIZE, hydrate)
            .await
    }

    pub async fn list_all_with_page_size<T, F>(
        &self,
        command: &str,
        params: &[Param],
        tag: &str,
        page_size: u32,
        hydrate: F,
    ) -> CsResult<Vec<T>>
    where
        T: Send,
        F: FnMut(&XmlElement) -> CsResult<Option<T>> + Send,
    {
        Paginator::new(self)
            .page_size(page_size)
            .list(command, params, tag, hydrate)
            .await
    }

    /// Whether the account can use the cloud at all.
    pub async fn is_subscribed(&self) -> CsResult<bool> {
        match self.get(LIST_ZONES, &[Param::new("available", "true")]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_subscribed() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
