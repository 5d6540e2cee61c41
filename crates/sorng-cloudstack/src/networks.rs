//! Guest networks (VLANs) and network offerings.

use crate::client::CsClient;
use crate::error::{CsError, CsResult};
use crate::hydrate::{fields, hydrate_first, HydrationScope, ResourceStatus};
use crate::jobs::JobWaiter;
use crate::param::Param;
use crate::tags::{Tag, TagService};
use crate::xml::XmlElement;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

pub const CREATE_EGRESS_RULE: &str = "createEgressFirewallRule";
pub const CREATE_NETWORK: &str = "createNetwork";
pub const DELETE_NETWORK: &str = "deleteNetwork";
pub const LIST_NETWORK_OFFERINGS: &str = "listNetworkOfferings";
pub const LIST_NETWORKS: &str = "listNetworks";

/// Resource type name used for network tags.
pub const RESOURCE_TYPE: &str = "Network";

const DEFAULT_NETMASK: &str = "255.255.255.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VlanState {
    Pending,
    Available,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub region_id: Option<String>,
    pub domain_name: Option<String>,
    pub dns_servers: Vec<String>,
    /// Network address and prefix, e.g. `10.1.1.0/24`.
    pub cidr: Option<String>,
    pub gateway: Option<String>,
    pub network_type: Option<String>,
    pub owner_id: Option<String>,
    pub state: VlanState,
    pub tags: HashMap<String, String>,
}

impl Vlan {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkOffering {
    pub id: Option<String>,
    pub availability: String,
    pub network_type: String,
}

impl NetworkOffering {
    pub fn is_available(&self) -> bool {
        !self.availability.eq_ignore_ascii_case("unavailable")
    }
}

#[derive(Clone)]
pub struct NetworkClient {
    client: CsClient,
    jobs: Arc<dyn JobWaiter>,
    tags: Arc<dyn TagService>,
    domain_id: Option<String>,
}

impl NetworkClient {
    pub fn new(client: CsClient, jobs: Arc<dyn JobWaiter>, tags: Arc<dyn TagService>) -> Self {
        Self {
            client,
            jobs,
            tags,
            domain_id: None,
        }
    }

    /// Domain of the caller's account; account filters need it.
    pub fn with_domain(mut self, domain_id: &str) -> Self {
        self.domain_id = Some(domain_id.to_string());
        self
    }

    pub async fn get_vlan(&self, vlan_id: &str) -> CsResult<Option<Vlan>> {
        let scope = self.client.scope()?;
        let mut params = zone_params(&scope);
        params.push(Param::new("id", vlan_id));
        match self.client.get(LIST_NETWORKS, &params).await {
            Ok(Some(doc)) => hydrate_first(&doc, "network", |e| Ok(to_network(e, &scope))),
            Ok(None) => Ok(None),
            Err(e) if e.has_code(431) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Networks in the active zone usable for deployment.
    pub async fn list_vlans(&self) -> CsResult<Vec<Vlan>> {
        let scope = self.client.scope()?;
        let mut params = zone_params(&scope);
        params.push(Param::new("canusefordeploy", "true"));
        self.client
            .list_all(LIST_NETWORKS, &params, "network", |e| Ok(to_network(e, &scope)))
            .await
    }

    pub async fn list_vlan_status(&self) -> CsResult<Vec<ResourceStatus<VlanState>>> {
        let scope = self.client.scope()?;
        let mut params = zone_params(&scope);
        params.push(Param::new("canusefordeploy", "true"));
        self.client
            .list_all(LIST_NETWORKS, &params, "network", |e| {
                Ok(e.child_text("id")
                    .map(|id| ResourceStatus::new(id, VlanState::Available)))
            })
            .await
    }

    /// Networks a new machine lands on when none is named. Networks hidden
    /// from display or flagged as non-default are left out.
    pub async fn list_default_networks(&self, shared: bool, for_deploy: bool) -> CsResult<Vec<Vlan>> {
        let scope = self.client.scope()?;
        let mut params = zone_params(&scope);
        if for_deploy {
            params.push(Param::new("canUseForDeploy", "true"));
        }
        if !shared {
            params.push(Param::optional("account", scope.account_number.as_deref()));
            if let Some(ref domain) = self.domain_id {
                params.push(Param::new("domainid", domain));
            }
        }
        self.client
            .list_all(LIST_NETWORKS, &params, "network", |e| {
                Ok(to_network(e, &scope).filter(|vlan| {
                    ["displaynetwork", "isdefault"]
                        .iter()
                        .all(|key| vlan.tag(key).map(|v| v == "true").unwrap_or(true))
                }))
            })
            .await
    }

    /// Offerings available in a zone.
    pub async fn list_network_offerings(&self, region_id: &str) -> CsResult<Vec<NetworkOffering>> {
        let params = [Param::new("zoneId", region_id)];
        self.client
            .list_all(LIST_NETWORK_OFFERINGS, &params, "networkoffering", |e| {
                Ok(Some(to_offering(e)))
            })
            .await
    }

    /// First available isolated offering in a zone.
    pub async fn find_isolated_offering(&self, region_id: &str) -> CsResult<Option<String>> {
        Ok(self
            .list_network_offerings(region_id)
            .await?
            .into_iter()
            .find(|o| o.is_available() && o.network_type == "Isolated")
            .and_then(|o| o.id))
    }

    /// Create an isolated guest network in the active zone.
    ///
    /// The gateway is the address part of `cidr`. A default egress rule
    /// opening all outbound traffic is added (failure only warns) and the
    /// network is tagged with `Name` and `Description`. CloudStack takes
    /// DNS servers from the zone, so `dns_servers` is not sent.
    pub async fn create_vlan(
        &self,
        cidr: &str,
        name: &str,
        description: &str,
        domain_name: Option<&str>,
        dns_servers: &[String],
    ) -> CsResult<Vlan> {
        let scope = self.client.scope()?;
        let region_id = scope
            .region_id
            .clone()
            .ok_or_else(|| CsError::internal("No region was set for this request"))?;
        let offering = self
            .find_isolated_offering(&region_id)
            .await?
            .ok_or_else(|| CsError::internal(format!("No offerings exist for {}", region_id)))?;
        let (gateway, netmask) = split_cidr(cidr)?;

        let mut params = vec![
            Param::new("zoneId", &region_id),
            Param::new("networkOfferingId", &offering),
            Param::new("name", name),
            Param::new("displayText", name),
            Param::new("gateway", &gateway),
            Param::new("netmask", &netmask),
        ];
        if let Some(domain) = domain_name {
            params.push(Param::new("networkDomain", domain));
        }
        if !dns_servers.is_empty() {
            log::debug!("create_vlan(): ignoring DNS servers {:?}", dns_servers);
        }

        let doc = self.client.get_required(CREATE_NETWORK, &params).await?;
        let vlan = hydrate_first(&doc, "network", |e| Ok(to_network(e, &scope)))?.ok_or_else(|| {
            CsError::internal("Creation requested failed to create a network without an error")
        })?;

        let egress = [
            Param::new("protocol", "All"),
            Param::new("cidrlist", "0.0.0.0/0"),
            Param::new("networkid", &vlan.id),
        ];
        if let Err(e) = self.client.get(CREATE_EGRESS_RULE, &egress).await {
            log::warn!("Unable to create default egress rule for {}: {}", vlan.id, e);
        }

        let tags = [Tag::new("Name", name), Tag::new("Description", description)];
        self.tags
            .create_tags(&[vlan.id.clone()], RESOURCE_TYPE, &tags)
            .await?;
        Ok(vlan)
    }

    pub async fn remove_vlan(&self, vlan_id: &str) -> CsResult<()> {
        if let Some(doc) = self
            .client
            .get(DELETE_NETWORK, &[Param::new("id", vlan_id)])
            .await?
        {
            self.jobs.wait_for_job(doc, "Delete VLAN").await?;
        }
        Ok(())
    }

    pub async fn set_tags(&self, vlan_ids: &[String], tags: &[Tag]) -> CsResult<()> {
        self.tags.remove_tags(vlan_ids, RESOURCE_TYPE, &[]).await?;
        self.tags.create_tags(vlan_ids, RESOURCE_TYPE, tags).await
    }

    pub async fn update_tags(&self, vlan_ids: &[String], tags: &[Tag]) -> CsResult<()> {
        self.tags.update_tags(vlan_ids, RESOURCE_TYPE, tags).await
    }

    pub async fn remove_tags(&self, vlan_ids: &[String], tags: &[Tag]) -> CsResult<()> {
        self.tags.remove_tags(vlan_ids, RESOURCE_TYPE, tags).await
    }

    pub async fn is_subscribed(&self) -> CsResult<bool> {
        let scope = self.client.scope()?;
        match self.client.get(LIST_NETWORKS, &zone_params(&scope)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_subscribed() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn zone_params(scope: &HydrationScope) -> Vec<Param> {
    scope
        .region_id
        .iter()
        .map(|region| Param::new("zoneId", region))
        .collect()
}

/// Build a network from a `<network>` element. Elements without an id are
/// skipped.
pub fn to_network(element: &XmlElement, scope: &HydrationScope) -> Option<Vlan> {
    let (mut id, mut name, mut domain_name, mut network_type) = (None, None, None, None);
    let (mut netmask, mut gateway) = (None, None);
    let mut region_id = scope.region_id.clone();
    let mut owner_id = scope.account_number.clone();
    let mut dns_servers = Vec::new();
    let mut tags = HashMap::new();

    for field in fields(element) {
        let value = field.value;
        match field.name.as_str() {
            "id" => id = field.owned(),
            "name" => {
                if name.is_none() {
                    name = field.owned();
                }
            }
            "displaytext" => name = field.owned(),
            key @ ("displaynetwork" | "isdefault") => {
                if let Some(v) = value {
                    tags.insert(key.to_string(), v.to_string());
                }
            }
            "networkdomain" => domain_name = field.owned(),
            "zoneid" => {
                if value.is_some() {
                    region_id = field.owned();
                }
            }
            "netmask" => netmask = field.owned(),
            "gateway" => gateway = field.owned(),
            "networkofferingdisplaytext" => network_type = field.owned(),
            "account" => owner_id = field.owned(),
            key if key.starts_with("dns") => {
                if let Some(v) = field.trimmed().filter(|v| !v.is_empty()) {
                    dns_servers.push(v.to_string());
                }
            }
            _ => {}
        }
    }

    let id = id?;
    let name = name.unwrap_or_else(|| id.clone());
    let cidr = gateway
        .as_deref()
        .and_then(|gw| to_cidr(gw, netmask.as_deref().unwrap_or(DEFAULT_NETMASK)));

    Some(Vlan {
        description: name.clone(),
        id,
        name,
        region_id,
        domain_name,
        dns_servers,
        cidr,
        gateway,
        network_type,
        owner_id,
        state: VlanState::Available,
        tags,
    })
}

/// Address and dotted netmask of an `a.b.c.d/prefix` block.
pub fn split_cidr(cidr: &str) -> CsResult<(String, String)> {
    let invalid = || CsError::internal(format!("Unable to parse netmask from {}", cidr));
    let (address, prefix) = cidr.trim().split_once('/').ok_or_else(invalid)?;
    let address = address.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    let prefix = prefix.parse::<u32>().ok().filter(|p| *p <= 32).ok_or_else(invalid)?;
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    Ok((address.to_string(), Ipv4Addr::from(mask).to_string()))
}

/// `network/prefix` for a gateway inside a netmask.
pub fn to_cidr(gateway: &str, netmask: &str) -> Option<String> {
    let parsed = gateway
        .trim()
        .parse::<Ipv4Addr>()
        .and_then(|gw| netmask.trim().parse::<Ipv4Addr>().map(|mask| (gw, mask)));
    match parsed {
        Ok((gw, mask)) => {
            let mask = u32::from(mask);
            let network = Ipv4Addr::from(u32::from(gw) & mask);
            Some(format!("{}/{}", network, mask.count_ones()))
        }
        Err(e) => {
            log::warn!("Unable to compute CIDR from {} / {}: {}", gateway, netmask, e);
            None
        }
    }
}

fn to_offering(element: &XmlElement) -> NetworkOffering {
    let mut offering = NetworkOffering {
        id: None,
        availability: "unavailable".to_string(),
        network_type: "direct".to_string(),
    };
    for field in fields(element) {
        match field.name.as_str() {
            "id" => offering.id = field.trimmed().map(str::to_string),
            "availability" => {
                offering.availability = field.trimmed().unwrap_or("unavailable").to_string()
            }
            "guestiptype" => offering.network_type = field.trimmed().unwrap_or("direct").to_string(),
            _ => {}
        }
    }
    offering
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::RecordingJobs;
    use crate::tags::tests::RecordingTags;
    use crate::testing::{client_with, query_param, ScriptedTransport};
    use crate::xml::XmlDocument;

    const NETWORKS: &str = "<listnetworksresponse><count>3</count>\
        <network><id>net-1</id><name>guest</name><displaytext>Guest Network</displaytext>\
        <dns1>8.8.8.8</dns1><dns2> </dns2><dns3>8.8.4.4</dns3><gateway>10.1.1.1</gateway>\
        <netmask>255.255.255.0</netmask><networkdomain>cs.internal</networkdomain>\
        <networkofferingdisplaytext>Isolated with SNAT</networkofferingdisplaytext>\
        <account>admin</account><isdefault>true</isdefault></network>\
        <network><id>net-2</id><gateway>172.16.4.9</gateway><netmask>255.255.252.0</netmask>\
        <displaynetwork>false</displaynetwork></network>\
        <network><id>net-3</id><name>plain</name><gateway>192.168.7.1</gateway><isdefault>false</isdefault></network>\
        </listnetworksresponse>";

    fn networks(transport: &ScriptedTransport, jobs: Arc<RecordingJobs>) -> NetworkClient {
        NetworkClient::new(client_with(transport), jobs, Arc::new(RecordingTags::default()))
    }

    #[test]
    fn hydrates_network() {
        let doc = XmlDocument::parse(NETWORKS).unwrap();
        let scope = HydrationScope::new(Some("zone-1"), Some("admin"));
        let vlans: Vec<_> = doc
            .elements_by_tag_name("network")
            .into_iter()
            .filter_map(|e| to_network(e, &scope))
            .collect();
        assert_eq!(vlans.len(), 3);

        let first = &vlans[0];
        assert_eq!(first.name, "Guest Network");
        assert_eq!(first.description, "Guest Network");
        assert_eq!(first.dns_servers, vec!["8.8.8.8", "8.8.4.4"]);
        assert_eq!(first.cidr.as_deref(), Some("10.1.1.0/24"));
        assert_eq!(first.domain_name.as_deref(), Some("cs.internal"));
        assert_eq!(first.network_type.as_deref(), Some("Isolated with SNAT"));
        assert_eq!(first.region_id.as_deref(), Some("zone-1"));

        assert_eq!(vlans[1].name, "net-2");
        assert_eq!(vlans[1].cidr.as_deref(), Some("172.16.4.0/22"));
        assert_eq!(vlans[2].cidr.as_deref(), Some("192.168.7.0/24"));
    }

    #[test]
    fn cidr_from_gateway() {
        assert_eq!(to_cidr("10.0.5.1", "255.255.0.0").as_deref(), Some("10.0.0.0/16"));
        assert_eq!(to_cidr("not-an-ip", "255.255.255.0"), None);
    }

    #[tokio::test]
    async fn default_networks_filter_hidden_and_non_default() {
        let transport = ScriptedTransport::new(vec![(200, Some(NETWORKS))]);
        let client = networks(&transport, Arc::new(RecordingJobs::default())).with_domain("dom-1");
        let vlans = client.list_default_networks(false, true).await.unwrap();
        let ids: Vec<_> = vlans.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["net-1"]);
        let url = &transport.urls()[0];
        assert_eq!(query_param(url, "account").as_deref(), Some("admin"));
        assert_eq!(query_param(url, "domainid").as_deref(), Some("dom-1"));
        assert_eq!(query_param(url, "canUseForDeploy").as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn shared_default_networks_skip_account_filter() {
        let transport = ScriptedTransport::new(vec![(200, Some(NETWORKS))]);
        let client = networks(&transport, Arc::new(RecordingJobs::default()));
        client.list_default_networks(true, false).await.unwrap();
        let url = &transport.urls()[0];
        assert_eq!(query_param(url, "account"), None);
        assert_eq!(query_param(url, "canUseForDeploy"), None);
    }

    #[tokio::test]
    async fn status_listing() {
        let transport = ScriptedTransport::new(vec![(200, Some(NETWORKS))]);
        let statuses = networks(&transport, Arc::new(RecordingJobs::default()))
            .list_vlan_status()
            .await
            .unwrap();
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[0], ResourceStatus::new("net-1", VlanState::Available));
    }

    #[tokio::test]
    async fn get_vlan_missing_is_none() {
        let transport = ScriptedTransport::new(vec![(431, Some("<html>no</html>"))]);
        let client = networks(&transport, Arc::new(RecordingJobs::default()));
        assert!(client.get_vlan("net-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offerings_defaults() {
        let body = "<r><networkoffering><id> off-1 </id><guestiptype>Isolated</guestiptype>\
            <availability>Optional</availability></networkoffering>\
            <networkoffering><id>off-2</id><availability/></networkoffering></r>";
        let transport = ScriptedTransport::new(vec![(200, Some(body)), (200, Some(body))]);
        let client = networks(&transport, Arc::new(RecordingJobs::default()));
        let offerings = client.list_network_offerings("zone-1").await.unwrap();
        assert_eq!(offerings[0].id.as_deref(), Some("off-1"));
        assert_eq!(offerings[1].availability, "unavailable");
        assert_eq!(offerings[1].network_type, "direct");
        assert_eq!(client.find_isolated_offering("zone-1").await.unwrap().as_deref(), Some("off-1"));
    }

    #[test]
    fn cidr_split() {
        let (gateway, netmask) = split_cidr("10.20.0.1/22").unwrap();
        assert_eq!(gateway, "10.20.0.1");
        assert_eq!(netmask, "255.255.252.0");
        assert_eq!(split_cidr("10.0.0.0/32").unwrap().1, "255.255.255.255");
        assert_eq!(split_cidr("0.0.0.0/0").unwrap().1, "0.0.0.0");
        assert!(split_cidr("10.0.0.1").is_err());
        assert!(split_cidr("10.0.0.1/33").is_err());
        assert!(split_cidr("ten/24").is_err());
    }

    const OFFERINGS: &str = "<listnetworkofferingsresponse><count>2</count>\
        <networkoffering><id>off-shared</id><guestiptype>Shared</guestiptype><availability>Optional</availability></networkoffering>\
        <networkoffering><id>off-iso</id><guestiptype>Isolated</guestiptype><availability>Required</availability></networkoffering>\
        </listnetworkofferingsresponse>";

    const CREATED: &str = "<createnetworkresponse><network><id>net-new</id><name>backend</name>\
        <displaytext>backend</displaytext><zoneid>zone-1</zoneid><gateway>10.8.0.1</gateway>\
        <netmask>255.255.255.0</netmask><networkdomain>corp.local</networkdomain></network></createnetworkresponse>";

    #[tokio::test]
    async fn create_vlan_sends_gateway_and_tags() {
        let transport = ScriptedTransport::new(vec![
            (200, Some(OFFERINGS)),
            (200, Some(CREATED)),
            (200, Some("<createegressfirewallruleresponse><jobid>j</jobid></createegressfirewallruleresponse>")),
        ]);
        let tags = Arc::new(RecordingTags::default());
        let client = NetworkClient::new(client_with(&transport), Arc::new(RecordingJobs::default()), tags.clone());
        let vlan = client
            .create_vlan("10.8.0.1/24", "backend", "Backend tier", Some("corp.local"), &[])
            .await
            .unwrap();
        assert_eq!(vlan.id, "net-new");
        assert_eq!(vlan.cidr.as_deref(), Some("10.8.0.0/24"));

        let urls = transport.urls();
        assert_eq!(urls.len(), 3);
        let create = &urls[1];
        assert_eq!(query_param(create, "command").as_deref(), Some("createNetwork"));
        assert_eq!(query_param(create, "zoneId").as_deref(), Some("zone-1"));
        assert_eq!(query_param(create, "networkOfferingId").as_deref(), Some("off-iso"));
        assert_eq!(query_param(create, "displayText").as_deref(), Some("backend"));
        assert_eq!(query_param(create, "gateway").as_deref(), Some("10.8.0.1"));
        assert_eq!(query_param(create, "netmask").as_deref(), Some("255.255.255.0"));
        assert_eq!(query_param(create, "networkDomain").as_deref(), Some("corp.local"));

        let egress = &urls[2];
        assert_eq!(query_param(egress, "command").as_deref(), Some("createEgressFirewallRule"));
        assert_eq!(query_param(egress, "networkid").as_deref(), Some("net-new"));
        assert_eq!(query_param(egress, "cidrlist").as_deref(), Some("0.0.0.0/0"));

        let calls = tags.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![(
                "create".to_string(),
                vec!["net-new".to_string()],
                RESOURCE_TYPE.to_string(),
                vec![Tag::new("Name", "backend"), Tag::new("Description", "Backend tier")],
            )]
        );
    }

    #[tokio::test]
    async fn create_vlan_survives_egress_failure() {
        let transport = ScriptedTransport::new(vec![
            (200, Some(OFFERINGS)),
            (200, Some(CREATED)),
            (530, Some("<r><errorcode>530</errorcode><errortext>egress unsupported</errortext></r>")),
        ]);
        let tags = Arc::new(RecordingTags::default());
        let client = NetworkClient::new(client_with(&transport), Arc::new(RecordingJobs::default()), tags.clone());
        let vlan = client.create_vlan("10.8.0.1/24", "backend", "b", None, &[]).await.unwrap();
        assert_eq!(vlan.id, "net-new");
        assert_eq!(query_param(&transport.urls()[1], "networkDomain"), None);
        assert_eq!(tags.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_vlan_needs_isolated_offering() {
        let shared_only = "<r><count>1</count><networkoffering><id>off-shared</id>\
            <guestiptype>Shared</guestiptype><availability>Optional</availability></networkoffering></r>";
        let transport = ScriptedTransport::new(vec![(200, Some(shared_only))]);
        let client = networks(&transport, Arc::new(RecordingJobs::default()));
        let err = client.create_vlan("10.8.0.1/24", "backend", "b", None, &[]).await.unwrap_err();
        assert_eq!(err.message, "No offerings exist for zone-1");
        assert_eq!(transport.urls().len(), 1);
    }

    #[tokio::test]
    async fn create_vlan_rejects_bad_cidr() {
        let transport = ScriptedTransport::new(vec![(200, Some(OFFERINGS))]);
        let client = networks(&transport, Arc::new(RecordingJobs::default()));
        let err = client.create_vlan("10.8.0.1", "backend", "b", None, &[]).await.unwrap_err();
        assert_eq!(err.message, "Unable to parse netmask from 10.8.0.1");
    }

    #[tokio::test]
    async fn remove_waits_for_job() {
        let transport = ScriptedTransport::new(vec![(200, Some("<deletenetworkresponse><jobid>j</jobid></deletenetworkresponse>"))]);
        let jobs = Arc::new(RecordingJobs::default());
        networks(&transport, jobs.clone()).remove_vlan("net-1").await.unwrap();
        assert_eq!(jobs.descriptions(), vec!["Delete VLAN"]);
    }
}
