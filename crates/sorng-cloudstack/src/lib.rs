//! # sorng-cloudstack – CloudStack API engine
//!
//! Signs CloudStack query requests with HMAC-SHA1, sends them over HTTP,
//! classifies the response (including the "nothing matches" signal), parses
//! the XML body and hydrates records, following pagination where needed.
//! Template, key pair, public address and network adapters sit on top.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  CloudStackService  (service.rs)                 │
//! │  └── per-session bundle of:                      │
//! │       TemplateClient · KeypairClient             │
//! │       AddressClient  · NetworkClient             │
//! ├──────────────────────────────────────────────────┤
//! │  CsClient  (client.rs)                           │
//! │  ├── get       (sign → transport → classify)     │
//! │  └── list_all  (Paginator, page size 500)        │
//! ├──────────────────────────────────────────────────┤
//! │  CsSigner (signing.rs) · HttpTransport           │
//! │  classify · XmlDocument · hydrate · WorkerPool   │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Async jobs and resource tags are delegated to [`JobWaiter`] and
//! [`TagService`] implementations supplied by the caller.

// ── Sub-modules ─────────────────────────────────────────────────────────

pub mod error;
pub mod config;
pub mod param;
pub mod signing;
pub mod wire;
pub mod xml;
pub mod transport;
pub mod classify;
pub mod hydrate;
pub mod client;
pub mod paginate;
pub mod pool;

// Collaborators
pub mod jobs;
pub mod tags;

// Resource adapters
pub mod templates;
pub mod keypairs;
pub mod addresses;
pub mod networks;

pub mod service;

#[cfg(test)]
mod testing;

// ── Re-exports for ergonomic access ─────────────────────────────────────

pub use classify::{classify, NOT_FOUND_CODES};
pub use client::CsClient;
pub use config::{ContextProvider, EndpointContext, ProxyConfig, DEFAULT_PAGE_SIZE};
pub use error::{CsError, CsErrorKind, CsResult, ParsedError};
pub use hydrate::{Architecture, HydrationScope, Platform, ResourceStatus};
pub use jobs::{ImmediateJobs, JobWaiter};
pub use param::Param;
pub use pool::{Collector, WorkerPool};
pub use service::{CloudStackService, CloudStackServiceState, CsSession};
pub use signing::CsSigner;
pub use tags::{Tag, TagService};
pub use transport::{HttpTransport, RawResponse, Transport};
pub use wire::{LogWire, WireObserver};
pub use xml::{XmlDocument, XmlElement};
