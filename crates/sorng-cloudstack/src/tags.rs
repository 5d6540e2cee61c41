//! Resource tag management.
//!
//! Tags are plain key/value metadata attached server-side; the engine only
//! forwards them to a [`TagService`] together with the CloudStack resource
//! type name.

use crate::error::CsResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

#[async_trait]
pub trait TagService: Send + Sync {
    async fn create_tags(&self, resource_ids: &[String], resource_type: &str, tags: &[Tag]) -> CsResult<()>;

    async fn update_tags(&self, resource_ids: &[String], resource_type: &str, tags: &[Tag]) -> CsResult<()>;

    async fn remove_tags(&self, resource_ids: &[String], resource_type: &str, tags: &[Tag]) -> CsResult<()>;
}
