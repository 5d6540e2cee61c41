//! Asynchronous job resolution.
//!
//! Mutating commands usually answer with a job handle instead of the final
//! result. Resolving it (polling `queryAsyncJobResult` until the job is
//! terminal, with whatever backoff and timeout policy the caller wants) is
//! left to an implementation of [`JobWaiter`].

use crate::error::CsResult;
use crate::xml::XmlDocument;
use async_trait::async_trait;

#[async_trait]
pub trait JobWaiter: Send + Sync {
    /// Resolve the document returned by a mutating command into its final
    /// result document. `description` names the operation for logging and
    /// error messages.
    async fn wait_for_job(
        &self,
        document: XmlDocument,
        description: &str,
    ) -> CsResult<Option<XmlDocument>>;
}

/// Waiter for deployments where every command completes synchronously.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateJobs;

#[async_trait]
impl JobWaiter for ImmediateJobs {
    async fn wait_for_job(
        &self,
        document: XmlDocument,
        description: &str,
    ) -> CsResult<Option<XmlDocument>> {
        log::debug!("{}: completed without a job wait", description);
        Ok(Some(document))
    }
}
