//! SSH key pairs.

use crate::client::CsClient;
use crate::error::{CsError, CsResult};
use crate::hydrate::{fields, hydrate_first, HydrationScope};
use crate::param::Param;
use crate::xml::XmlElement;
use serde::{Deserialize, Serialize};

pub const CREATE_KEYPAIR: &str = "createSSHKeyPair";
pub const DELETE_KEYPAIR: &str = "deleteSSHKeyPair";
pub const LIST_KEYPAIRS: &str = "listSSHKeyPairs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshKeypair {
    /// Key pairs are addressed by name.
    pub name: String,
    pub fingerprint: String,
    /// Only present in the response to a create.
    pub private_key: Option<String>,
    pub owner_id: Option<String>,
    pub region_id: String,
}

#[derive(Clone)]
pub struct KeypairClient {
    client: CsClient,
}

impl KeypairClient {
    pub fn new(client: CsClient) -> Self {
        Self { client }
    }

    /// Generate a new key pair. The returned value carries the private key.
    pub async fn create(&self, name: &str) -> CsResult<SshKeypair> {
        let scope = self.client.scope()?;
        let created = match self.client.get(CREATE_KEYPAIR, &[Param::new("name", name)]).await? {
            Some(doc) => hydrate_first(&doc, "keypair", |e| to_keypair(e, &scope))?,
            None => None,
        };
        created.ok_or_else(|| CsError::communication("Request did not error, but no keypair was generated"))
    }

    pub async fn delete(&self, name: &str) -> CsResult<()> {
        self.client.get(DELETE_KEYPAIR, &[Param::new("name", name)]).await?;
        Ok(())
    }

    pub async fn get_keypair(&self, name: &str) -> CsResult<Option<SshKeypair>> {
        let scope = self.client.scope()?;
        match self.client.get(LIST_KEYPAIRS, &[Param::new("name", name)]).await? {
            Some(doc) => hydrate_first(&doc, "sshkeypair", |e| to_keypair(e, &scope)),
            None => Ok(None),
        }
    }

    pub async fn get_fingerprint(&self, name: &str) -> CsResult<Option<String>> {
        Ok(self.get_keypair(name).await?.map(|kp| kp.fingerprint))
    }

    /// Uploading an existing public key is not offered by this cloud.
    pub async fn import(&self, _name: &str, _public_key: &str) -> CsResult<SshKeypair> {
        Err(CsError::internal("Import of keypairs is not supported"))
    }

    pub async fn list(&self) -> CsResult<Vec<SshKeypair>> {
        let scope = self.client.scope()?;
        self.client
            .list_all(LIST_KEYPAIRS, &[], "sshkeypair", |e| to_keypair(e, &scope))
            .await
    }

    pub async fn is_subscribed(&self) -> CsResult<bool> {
        self.client.is_subscribed().await
    }
}

/// Build a key pair from a `<keypair>` or `<sshkeypair>` element.
///
/// Fails when the caller has no active zone; skips elements missing a name
/// or fingerprint.
pub fn to_keypair(element: &XmlElement, scope: &HydrationScope) -> CsResult<Option<SshKeypair>> {
    let region_id = scope
        .region_id
        .clone()
        .ok_or_else(|| CsError::internal("No region is part of this request"))?;
    let (mut name, mut fingerprint, mut private_key) = (None, None, None);
    for field in fields(element) {
        match field.name.as_str() {
            "name" => name = field.trimmed().map(str::to_string),
            "fingerprint" => fingerprint = field.trimmed().map(str::to_string),
            "privatekey" => private_key = field.trimmed().map(str::to_string),
            _ => {}
        }
    }
    let (name, fingerprint) = match (name, fingerprint) {
        (Some(name), Some(fingerprint)) => (name, fingerprint),
        _ => return Ok(None),
    };
    Ok(Some(SshKeypair {
        name,
        fingerprint,
        private_key,
        owner_id: scope.account_number.clone(),
        region_id,
    }))
}
