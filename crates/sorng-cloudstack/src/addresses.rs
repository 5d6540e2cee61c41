//! Public IP addresses.
//!
//! Addresses are allocated into the caller's pool with
//! `associateIpAddress` (an async job) and given back with
//! `disassociateIpAddress`. Port forwarding rules hang off an address and
//! are listed and removed here; creating them needs a virtual machine and
//! lives elsewhere.

use crate::client::CsClient;
use crate::error::{CsError, CsResult};
use crate::hydrate::{fields, hydrate_all, HydrationScope, ResourceStatus};
use crate::jobs::JobWaiter;
use crate::param::Param;
use crate::tags::{Tag, TagService};
use crate::xml::{XmlDocument, XmlElement};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const ASSOCIATE_IP_ADDRESS: &str = "associateIpAddress";
pub const DISASSOCIATE_IP_ADDRESS: &str = "disassociateIpAddress";
pub const LIST_PUBLIC_IP_ADDRESSES: &str = "listPublicIpAddresses";
pub const LIST_PORT_FORWARDING_RULES: &str = "listPortForwardingRules";
pub const DELETE_PORT_FORWARDING_RULE: &str = "deletePortForwardingRule";

/// Resource type name used for address tags.
pub const RESOURCE_TYPE: &str = "PublicIpAddress";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAddress {
    pub id: String,
    pub address: Option<String>,
    pub region_id: String,
    /// Virtual machine the address is attached to.
    pub server_id: Option<String>,
    pub vlan_id: Option<String>,
    pub for_vlan: bool,
}

impl IpAddress {
    pub fn is_assigned(&self) -> bool {
        self.server_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TCP" => Some(Protocol::Tcp),
            "UDP" => Some(Protocol::Udp),
            "ICMP" => Some(Protocol::Icmp),
            _ => None,
        }
    }
}

/// Port forwarding from a public address to a virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    pub id: Option<String>,
    pub address_id: String,
    pub public_port: Option<u16>,
    pub private_port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub server_id: Option<String>,
}

#[derive(Clone)]
pub struct AddressClient {
    client: CsClient,
    jobs: Arc<dyn JobWaiter>,
    tags: Arc<dyn TagService>,
}

impl AddressClient {
    pub fn new(client: CsClient, jobs: Arc<dyn JobWaiter>, tags: Arc<dyn TagService>) -> Self {
        Self { client, jobs, tags }
    }

    pub async fn get_ip_address(&self, address_id: &str) -> CsResult<Option<IpAddress>> {
        let scope = self.client.scope()?;
        let doc = match self
            .client
            .get(LIST_PUBLIC_IP_ADDRESSES, &[Param::new("id", address_id)])
            .await
        {
            Ok(Some(doc)) => doc,
            Ok(None) => return Ok(None),
            Err(e) if e.has_code(431) => return Ok(None),
            Err(e) => return Err(e),
        };
        for element in doc.elements_by_tag_name("publicipaddress") {
            if let Some(address) = to_address(element, &scope)? {
                if address.id == address_id {
                    return Ok(Some(address));
                }
            }
        }
        Ok(None)
    }

    /// Allocated addresses in the active zone.
    pub async fn list_ip_pool(&self, unassigned_only: bool) -> CsResult<Vec<IpAddress>> {
        let scope = self.client.scope()?;
        let params = self.zone_params(&scope);
        self.client
            .list_all(LIST_PUBLIC_IP_ADDRESSES, &params, "publicipaddress", |e| {
                Ok(to_address(e, &scope)?.filter(|a| !unassigned_only || !a.is_assigned()))
            })
            .await
    }

    /// Id and availability of every allocated address.
    pub async fn list_ip_pool_status(&self) -> CsResult<Vec<ResourceStatus<bool>>> {
        let scope = self.client.scope()?;
        let params = self.zone_params(&scope);
        self.client
            .list_all(LIST_PUBLIC_IP_ADDRESSES, &params, "publicipaddress", |e| Ok(to_status(e)))
            .await
    }

    /// Allocate a new public address and return its id.
    pub async fn request(&self) -> CsResult<String> {
        let scope = self.client.scope()?;
        self.associate(self.zone_params(&scope)).await
    }

    /// Allocate a new public address on a guest network.
    pub async fn request_for_vlan(&self, vlan_id: &str) -> CsResult<String> {
        let scope = self.client.scope()?;
        let mut params = self.zone_params(&scope);
        params.push(Param::new("networkId", vlan_id));
        self.associate(params).await
    }

    async fn associate(&self, params: Vec<Param>) -> CsResult<String> {
        let doc = self.client.get_required(ASSOCIATE_IP_ADDRESS, &params).await?;
        let mut id = doc
            .first_text("id")
            .or_else(|| doc.first_text("jobid"))
            .map(str::to_string)
            .ok_or_else(|| CsError::communication("Failed to request an IP address without error"))?;

        if let Some(done) = self.jobs.wait_for_job(doc, ASSOCIATE_IP_ADDRESS).await? {
            if let Some(final_id) = allocated_id(&done) {
                id = final_id;
            }
        }
        Ok(id)
    }

    /// Port forwarding rules of an address.
    pub async fn list_rules(&self, address_id: &str) -> CsResult<Vec<ForwardingRule>> {
        let doc = self
            .client
            .get(LIST_PORT_FORWARDING_RULES, &[Param::new("ipaddressid", address_id)])
            .await?
            .ok_or_else(|| CsError::internal(format!("No such IP address: {}", address_id)))?;
        let rules = hydrate_all(&doc, "portforwardingrule", |e| to_rule(e, address_id).map(Some))?;
        for rule in &rules {
            log::debug!("list_rules(): * {:?}", rule);
        }
        Ok(rules)
    }

    pub async fn stop_forward(&self, rule_id: &str) -> CsResult<()> {
        if let Some(doc) = self
            .client
            .get(DELETE_PORT_FORWARDING_RULE, &[Param::new("id", rule_id)])
            .await?
        {
            self.jobs.wait_for_job(doc, DELETE_PORT_FORWARDING_RULE).await?;
        }
        Ok(())
    }

    /// Give an address back. Addresses are released by `id`; servers old
    /// enough to only know them by value are not supported.
    pub async fn release_from_pool(&self, address_id: &str) -> CsResult<()> {
        self.client
            .get(DISASSOCIATE_IP_ADDRESS, &[Param::new("id", address_id)])
            .await?;
        Ok(())
    }

    pub async fn set_tags(&self, address_ids: &[String], tags: &[Tag]) -> CsResult<()> {
        self.tags.remove_tags(address_ids, RESOURCE_TYPE, &[]).await?;
        self.tags.create_tags(address_ids, RESOURCE_TYPE, tags).await
    }

    pub async fn update_tags(&self, address_ids: &[String], tags: &[Tag]) -> CsResult<()> {
        self.tags.update_tags(address_ids, RESOURCE_TYPE, tags).await
    }

    pub async fn remove_tags(&self, address_ids: &[String], tags: &[Tag]) -> CsResult<()> {
        self.tags.remove_tags(address_ids, RESOURCE_TYPE, tags).await
    }

    /// Whether the caller may list addresses in the active zone.
    pub async fn is_subscribed(&self) -> CsResult<bool> {
        let scope = self.client.scope()?;
        match self
            .client
            .get(LIST_PUBLIC_IP_ADDRESSES, &self.zone_params(&scope))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_subscribed() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn zone_params(&self, scope: &HydrationScope) -> Vec<Param> {
        scope
            .region_id
            .iter()
            .map(|region| Param::new("zoneId", region))
            .collect()
    }
}

/// `id` of the `<ipaddress>` element in a finished associate job.
fn allocated_id(doc: &XmlDocument) -> Option<String> {
    doc.elements_by_tag_name("ipaddress")
        .first()
        .and_then(|e| e.child_text("id"))
        .map(str::to_string)
}

/// Build a rule from a `<portforwardingrule>` element.
pub fn to_rule(element: &XmlElement, address_id: &str) -> CsResult<ForwardingRule> {
    let mut rule = ForwardingRule {
        id: None,
        address_id: address_id.to_string(),
        public_port: None,
        private_port: None,
        protocol: None,
        server_id: None,
    };
    for field in fields(element) {
        match field.name.as_str() {
            "id" => rule.id = field.owned(),
            "publicport" => rule.public_port = parse_port(field.trimmed())?,
            "privateport" => rule.private_port = parse_port(field.trimmed())?,
            "protocol" => {
                if let Some(v) = field.trimmed() {
                    rule.protocol = Some(
                        Protocol::parse(v)
                            .ok_or_else(|| CsError::internal(format!("Unknown protocol: {}", v)))?,
                    );
                }
            }
            "virtualmachineid" => rule.server_id = field.owned(),
            _ => {}
        }
    }
    Ok(rule)
}

fn parse_port(value: Option<&str>) -> CsResult<Option<u16>> {
    value
        .map(|v| {
            v.parse::<u16>()
                .map_err(|e| CsError::internal(format!("Invalid port {}: {}", v, e)))
        })
        .transpose()
}

/// Build an address from a `<publicipaddress>` element.
///
/// Addresses in any state other than `Allocated` are skipped.
pub fn to_address(element: &XmlElement, scope: &HydrationScope) -> CsResult<Option<IpAddress>> {
    let mut region_id = scope
        .region_id
        .clone()
        .ok_or_else(|| CsError::internal("No region was set for this request"))?;
    let (mut id, mut address, mut server_id, mut vlan_id) = (None, None, None, None);

    for field in fields(element) {
        let value = field.value;
        match field.name.as_str() {
            "id" if value.is_some() => id = field.owned(),
            "ipaddress" if value.is_some() => {
                // older servers only identify addresses by their value
                if id.is_none() {
                    id = field.owned();
                }
                address = field.owned();
            }
            "zoneid" => {
                if let Some(zone) = value {
                    region_id = zone.to_string();
                }
            }
            "virtualmachineid" => server_id = field.owned(),
            "state" => {
                if value.map(|v| !v.eq_ignore_ascii_case("allocated")).unwrap_or(false) {
                    return Ok(None);
                }
            }
            "associatednetworkid" => {
                if value.is_some() {
                    vlan_id = field.owned();
                }
            }
            _ => {}
        }
    }

    Ok(id.map(|id| IpAddress {
        id,
        address,
        region_id,
        server_id,
        for_vlan: vlan_id.is_some(),
        vlan_id,
    }))
}

/// Status of a `<publicipaddress>` element: available when no virtual
/// machine holds it.
pub fn to_status(element: &XmlElement) -> Option<ResourceStatus<bool>> {
    let mut id = None;
    let mut available = true;
    for field in fields(element) {
        match field.name.as_str() {
            "id" => id = field.value,
            "virtualmachineid" => available = field.trimmed().map(str::is_empty).unwrap_or(true),
            "state" => {
                if field.value.map(|v| !v.eq_ignore_ascii_case("allocated")).unwrap_or(false) {
                    return None;
                }
            }
            _ => {}
        }
    }
    id.map(|id| ResourceStatus::new(id, available))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::RecordingJobs;
    use crate::tags::tests::RecordingTags;
    use crate::testing::{client_with, query_param, ScriptedTransport};

    const POOL: &str = "<listpublicipaddressesresponse><count>3</count>\
        <publicipaddress><id>ip-1</id><ipaddress>203.0.113.10</ipaddress><zoneid>zone-1</zoneid>\
        <state>Allocated</state><virtualmachineid>vm-1</virtualmachineid></publicipaddress>\
        <publicipaddress><id>ip-2</id><ipaddress>203.0.113.11</ipaddress><state>allocated</state>\
        <associatednetworkid>net-7</associatednetworkid></publicipaddress>\
        <publicipaddress><id>ip-3</id><ipaddress>203.0.113.12</ipaddress><state>Releasing</state></publicipaddress>\
        </listpublicipaddressesresponse>";

    fn addresses(transport: &ScriptedTransport, jobs: Arc<RecordingJobs>) -> AddressClient {
        AddressClient::new(client_with(transport), jobs, Arc::new(RecordingTags::default()))
    }

    #[tokio::test]
    async fn pool_skips_unallocated() {
        let transport = ScriptedTransport::new(vec![(200, Some(POOL))]);
        let pool = addresses(&transport, Arc::new(RecordingJobs::default()))
            .list_ip_pool(false)
            .await
            .unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool[0].server_id.as_deref(), Some("vm-1"));
        assert!(pool[1].for_vlan);
        assert_eq!(pool[1].vlan_id.as_deref(), Some("net-7"));
        assert_eq!(pool[1].region_id, "zone-1");
        assert_eq!(query_param(&transport.urls()[0], "zoneId").as_deref(), Some("zone-1"));
    }

    #[tokio::test]
    async fn unassigned_only() {
        let transport = ScriptedTransport::new(vec![(200, Some(POOL))]);
        let pool = addresses(&transport, Arc::new(RecordingJobs::default()))
            .list_ip_pool(true)
            .await
            .unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].id, "ip-2");
    }

    #[tokio::test]
    async fn pool_status() {
        let transport = ScriptedTransport::new(vec![(200, Some(POOL))]);
        let statuses = addresses(&transport, Arc::new(RecordingJobs::default()))
            .list_ip_pool_status()
            .await
            .unwrap();
        assert_eq!(
            statuses,
            vec![ResourceStatus::new("ip-1", false), ResourceStatus::new("ip-2", true)]
        );
    }

    #[tokio::test]
    async fn get_address_matches_id() {
        let transport = ScriptedTransport::new(vec![(200, Some(POOL)), (431, Some("<html/>"))]);
        let client = addresses(&transport, Arc::new(RecordingJobs::default()));
        let found = client.get_ip_address("ip-2").await.unwrap().unwrap();
        assert_eq!(found.address.as_deref(), Some("203.0.113.11"));
        assert!(client.get_ip_address("ip-9").await.unwrap().is_none());
    }

    #[test]
    fn value_doubles_as_id() {
        let doc = XmlDocument::parse("<publicipaddress><ipaddress>198.51.100.4</ipaddress></publicipaddress>").unwrap();
        let scope = HydrationScope::new(Some("zone-1"), None);
        let address = to_address(doc.root(), &scope).unwrap().unwrap();
        assert_eq!(address.id, "198.51.100.4");
        assert!(to_address(doc.root(), &HydrationScope::default()).is_err());
    }

    #[tokio::test]
    async fn request_uses_job_result() {
        let transport = ScriptedTransport::new(vec![(
            200,
            Some("<associateipaddressresponse><jobid>job-1</jobid></associateipaddressresponse>"),
        )]);
        let jobs = Arc::new(RecordingJobs::answering(
            "<queryasyncjobresultresponse><jobresult><ipaddress><id>ip-42</id>\
             <ipaddress>203.0.113.42</ipaddress></ipaddress></jobresult></queryasyncjobresultresponse>",
        ));
        let id = addresses(&transport, jobs.clone()).request().await.unwrap();
        assert_eq!(id, "ip-42");
        assert_eq!(jobs.descriptions(), vec![ASSOCIATE_IP_ADDRESS]);
    }

    #[tokio::test]
    async fn request_without_id_fails() {
        let transport = ScriptedTransport::new(vec![(200, Some("<associateipaddressresponse/>"))]);
        let err = addresses(&transport, Arc::new(RecordingJobs::default()))
            .request()
            .await
            .unwrap_err();
        assert_eq!(err.message, "Failed to request an IP address without error");
        assert_eq!(err.kind, crate::error::CsErrorKind::Communication);
        assert!(!err.has_code(200));
    }

    #[tokio::test]
    async fn request_on_network() {
        let transport = ScriptedTransport::new(vec![(
            200,
            Some("<associateipaddressresponse><id>ip-7</id><jobid>job-7</jobid></associateipaddressresponse>"),
        )]);
        let jobs = Arc::new(RecordingJobs::default());
        let id = addresses(&transport, jobs.clone()).request_for_vlan("net-7").await.unwrap();
        assert_eq!(id, "ip-7");
        assert_eq!(jobs.descriptions(), vec![ASSOCIATE_IP_ADDRESS]);
        let url = &transport.urls()[0];
        assert_eq!(query_param(url, "command").as_deref(), Some("associateIpAddress"));
        assert_eq!(query_param(url, "zoneId").as_deref(), Some("zone-1"));
        assert_eq!(query_param(url, "networkId").as_deref(), Some("net-7"));
    }

    #[tokio::test]
    async fn rules_for_address() {
        let body = "<listportforwardingrulesresponse><count>2</count>\
            <portforwardingrule><id>r-1</id><publicport>2222</publicport><privateport>22</privateport>\
            <protocol>tcp</protocol><virtualmachineid>vm-1</virtualmachineid></portforwardingrule>\
            <portforwardingrule><id>r-2</id><publicport>53</publicport><privateport>53</privateport>\
            <protocol>UDP</protocol></portforwardingrule></listportforwardingrulesresponse>";
        let transport = ScriptedTransport::new(vec![(200, Some(body))]);
        let rules = addresses(&transport, Arc::new(RecordingJobs::default()))
            .list_rules("ip-1")
            .await
            .unwrap();
        assert_eq!(
            rules[0],
            ForwardingRule {
                id: Some("r-1".into()),
                address_id: "ip-1".into(),
                public_port: Some(2222),
                private_port: Some(22),
                protocol: Some(Protocol::Tcp),
                server_id: Some("vm-1".into()),
            }
        );
        assert_eq!(rules[1].protocol, Some(Protocol::Udp));
        assert_eq!(rules[1].server_id, None);
        let url = &transport.urls()[0];
        assert_eq!(query_param(url, "command").as_deref(), Some("listPortForwardingRules"));
        assert_eq!(query_param(url, "ipaddressid").as_deref(), Some("ip-1"));
    }

    #[tokio::test]
    async fn rules_for_unknown_address() {
        let transport = ScriptedTransport::new(vec![(431, Some("<html/>"))]);
        let err = addresses(&transport, Arc::new(RecordingJobs::default()))
            .list_rules("ip-9")
            .await
            .unwrap_err();
        assert_eq!(err.message, "No such IP address: ip-9");
    }

    #[test]
    fn malformed_rule_is_rejected() {
        let doc = XmlDocument::parse("<portforwardingrule><publicport>http</publicport></portforwardingrule>").unwrap();
        assert!(to_rule(doc.root(), "ip-1").is_err());
        let doc = XmlDocument::parse("<portforwardingrule><protocol>sctp</protocol></portforwardingrule>").unwrap();
        assert!(to_rule(doc.root(), "ip-1").is_err());
    }

    #[tokio::test]
    async fn stop_forward_waits_for_job() {
        let transport = ScriptedTransport::new(vec![(
            200,
            Some("<deleteportforwardingruleresponse><jobid>j-3</jobid></deleteportforwardingruleresponse>"),
        )]);
        let jobs = Arc::new(RecordingJobs::default());
        addresses(&transport, jobs.clone()).stop_forward("r-1").await.unwrap();
        assert_eq!(jobs.descriptions(), vec![DELETE_PORT_FORWARDING_RULE]);
        let url = &transport.urls()[0];
        assert_eq!(query_param(url, "command").as_deref(), Some("deletePortForwardingRule"));
        assert_eq!(query_param(url, "id").as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn release() {
        let transport = ScriptedTransport::new(vec![(200, Some("<disassociateipaddressresponse><jobid>j</jobid></disassociateipaddressresponse>"))]);
        addresses(&transport, Arc::new(RecordingJobs::default()))
            .release_from_pool("ip-1")
            .await
            .unwrap();
        let url = &transport.urls()[0];
        assert_eq!(query_param(url, "command").as_deref(), Some("disassociateIpAddress"));
        assert_eq!(query_param(url, "id").as_deref(), Some("ip-1"));
        assert_eq!(query_param(url, "ipaddress"), None);
    }

    #[tokio::test]
    async fn subscription_check() {
        let transport = ScriptedTransport::new(vec![(
            531,
            Some("<r><errorcode>531</errorcode><errortext>not allowed</errortext></r>"),
        )]);
        let client = addresses(&transport, Arc::new(RecordingJobs::default()));
        assert!(!client.is_subscribed().await.unwrap());
    }
}
