//! In-memory transport for unit tests.

use crate::client::CsClient;
use crate::config::EndpointContext;
use crate::error::{CsError, CsResult};
use crate::transport::{RawResponse, Transport};
use crate::wire::WireObserver;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

struct Entry {
    /// Substring the request URL must contain; `None` matches anything.
    needle: Option<String>,
    response: RawResponse,
}

#[derive(Default)]
struct Script {
    entries: Vec<Entry>,
    urls: Vec<String>,
}

/// Replays canned responses and records every URL it was asked for.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    /// Responses returned in order, whatever the URL.
    pub(crate) fn new(responses: Vec<(u16, Option<&str>)>) -> Self {
        let transport = Self::default();
        for (status, body) in responses {
            transport.push(None, status, body);
        }
        transport
    }

    /// Responses picked by the first unused entry whose needle occurs in
    /// the URL, for callers issuing requests concurrently.
    pub(crate) fn routed(responses: Vec<(&str, u16, Option<&str>)>) -> Self {
        let transport = Self::default();
        for (needle, status, body) in responses {
            transport.push(Some(needle), status, body);
        }
        transport
    }

    fn push(&self, needle: Option<&str>, status: u16, body: Option<&str>) {
        self.script.lock().unwrap().entries.push(Entry {
            needle: needle.map(|n| n.to_string()),
            response: RawResponse::new(status, body),
        });
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.script.lock().unwrap().urls.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        url: &str,
        _ctx: &EndpointContext,
        _wire: Option<&dyn WireObserver>,
    ) -> CsResult<RawResponse> {
        let mut script = self.script.lock().unwrap();
        script.urls.push(url.to_string());
        let position = script.entries.iter().position(|e| match e.needle {
            Some(ref needle) => url.contains(needle.as_str()),
            None => true,
        });
        match position {
            Some(i) => Ok(script.entries.remove(i).response),
            None => Err(CsError::communication(format!("No scripted response for {}", url))),
        }
    }
}

pub(crate) fn test_context() -> EndpointContext {
    EndpointContext::new("https://cloud.example.com/client", "key", "secret")
        .with_region("zone-1")
        .with_account("admin")
}

pub(crate) fn client_with(transport: &ScriptedTransport) -> CsClient {
    CsClient::with_transport(Arc::new(test_context()), Arc::new(transport.clone()))
}

/// Decoded value of a query parameter in a request URL.
pub(crate) fn query_param(url: &str, key: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}
