//! Machine images: templates and ISOs.
//!
//! CloudStack keeps bootable templates and ISOs behind separate command
//! families. Lookups by id try the template commands first and fall back to
//! the ISO commands when the server answers with 431 ("no such template").

use crate::client::CsClient;
use crate::error::{CsError, CsResult};
use crate::hydrate::{
    fields, hydrate_first, parse_timestamp, Architecture, HydrationScope, Platform,
    ResourceStatus,
};
use crate::jobs::JobWaiter;
use crate::param::Param;
use crate::pool::{Collector, WorkerPool};
use crate::tags::{Tag, TagService};
use crate::xml::{XmlDocument, XmlElement};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const DELETE_ISO: &str = "deleteIso";
pub const DELETE_TEMPLATE: &str = "deleteTemplate";
pub const LIST_ISOS: &str = "listIsos";
pub const LIST_ISO_PERMISSIONS: &str = "listIsoPermissions";
pub const LIST_OS_TYPES: &str = "listOsTypes";
pub const LIST_TEMPLATES: &str = "listTemplates";
pub const LIST_TEMPLATE_PERMISSIONS: &str = "listTemplatePermissions";
pub const UPDATE_ISO_PERMISSIONS: &str = "updateIsoPermissions";
pub const UPDATE_TEMPLATE_PERMISSIONS: &str = "updateTemplatePermissions";

/// Resource type name used for template tags.
pub const RESOURCE_TYPE: &str = "Template";

/// Tag holding the CloudStack OS type id of an image.
pub const OS_TYPE_TAG: &str = "cloud.com.os.typeId";

// ── Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageState {
    Pending,
    Active,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineImage {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub owner_id: Option<String>,
    pub region_id: Option<String>,
    pub state: ImageState,
    pub architecture: Architecture,
    pub platform: Platform,
    /// Comma-separated list of detected software, e.g. `SQL Server 2008`.
    pub software: String,
    pub public: bool,
    pub iso: bool,
    pub created: Option<DateTime<Utc>>,
    pub tags: HashMap<String, String>,
}

/// Client-side filter applied to listed images.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageFilter {
    /// Only images owned by this account.
    pub account_number: Option<String>,
    pub architecture: Option<Architecture>,
    pub platform: Option<Platform>,
    /// Case-insensitive substring of the name or description.
    pub keyword: Option<String>,
}

impl ImageFilter {
    pub fn matches(&self, image: &MachineImage) -> bool {
        if let Some(ref account) = self.account_number {
            if image.owner_id.as_deref() != Some(account.as_str()) {
                return false;
            }
        }
        if let Some(arch) = self.architecture {
            if image.architecture != arch {
                return false;
            }
        }
        if let Some(platform) = self.platform {
            if image.platform != platform {
                return false;
            }
        }
        if let Some(ref keyword) = self.keyword {
            let keyword = keyword.to_lowercase();
            let hit = [image.name.as_deref(), image.description.as_deref()]
                .iter()
                .flatten()
                .any(|text| text.to_lowercase().contains(&keyword));
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Result of one lookup step in a template-then-ISO search.
enum Lookup {
    Found(XmlDocument),
    TryIso,
    Absent,
}

// ── Client ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TemplateClient {
    client: CsClient,
    jobs: Arc<dyn JobWaiter>,
    tags: Arc<dyn TagService>,
    hypervisors: Option<Vec<String>>,
    parent_account: Option<String>,
    pool: WorkerPool,
}

impl TemplateClient {
    pub fn new(client: CsClient, jobs: Arc<dyn JobWaiter>, tags: Arc<dyn TagService>) -> Self {
        Self {
            client,
            jobs,
            tags,
            hypervisors: None,
            parent_account: None,
            pool: WorkerPool::default(),
        }
    }

    /// Hypervisors available in the active zone. Images for any other
    /// hypervisor are left out of listings.
    pub fn with_hypervisors(mut self, hypervisors: Vec<String>) -> Self {
        self.hypervisors = Some(hypervisors);
        self
    }

    /// Account that may manage images on behalf of the caller.
    pub fn with_parent_account(mut self, account: &str) -> Self {
        self.parent_account = Some(account.to_string());
        self
    }

    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    /// Look up one image by id, template first, then ISO.
    pub async fn get_image(&self, image_id: &str) -> CsResult<Option<MachineImage>> {
        let scope = self.client.scope()?;
        let mut template_params = vec![
            Param::new("id", image_id),
            Param::new("templateFilter", "executable"),
        ];
        let mut iso_params = vec![
            Param::new("id", image_id),
            Param::new("isoFilter", "executable"),
        ];
        if let Some(ref region) = scope.region_id {
            template_params.push(Param::new("zoneId", region));
            iso_params.push(Param::new("zoneId", region));
        }
        iso_params.push(Param::new("bootable", "true"));

        let template = lookup(self.client.get(LIST_TEMPLATES, &template_params).await)?;
        let (doc, iso) = match template {
            Lookup::Found(doc) => (doc, false),
            Lookup::Absent => return Ok(None),
            Lookup::TryIso => match lookup(self.client.get(LIST_ISOS, &iso_params).await)? {
                Lookup::Found(doc) => (doc, true),
                Lookup::TryIso | Lookup::Absent => return Ok(None),
            },
        };
        let tag = if iso { "iso" } else { "template" };
        hydrate_first(&doc, tag, |e| {
            Ok(to_image(e, &scope, false, None).map(|img| if iso { mark_iso(img) } else { img }))
        })
    }

    /// Templates visible to the caller, across every page.
    pub async fn list_images(&self, filter: Option<&ImageFilter>) -> CsResult<Vec<MachineImage>> {
        let scope = self.client.scope()?;
        let mut params = self.zone_params(&scope);
        let template_filter = match filter.and_then(|f| f.account_number.as_ref()) {
            Some(_) => "executable",
            None => "selfexecutable",
        };
        params.push(Param::new("templateFilter", template_filter));

        let hypervisors = self.hypervisors.clone();
        self.client
            .list_all(LIST_TEMPLATES, &params, "template", |e| {
                Ok(to_image(e, &scope, false, hypervisors.as_deref())
                    .filter(|img| filter.map(|f| f.matches(img)).unwrap_or(true)))
            })
            .await
    }

    /// Bootable ISOs visible to the caller, across every page.
    pub async fn list_isos(&self, filter: Option<&ImageFilter>) -> CsResult<Vec<MachineImage>> {
        let scope = self.client.scope()?;
        let mut params = Vec::new();
        if let Some(ref region) = scope.region_id {
            params.push(Param::new("zoneId", region));
        }
        params.push(Param::new("bootable", "true"));
        let iso_filter = match filter.and_then(|f| f.account_number.as_ref()) {
            Some(_) => "executable",
            None => "selfexecutable",
        };
        params.push(Param::new("isoFilter", iso_filter));

        let hypervisors = self.hypervisors.clone();
        self.client
            .list_all(LIST_ISOS, &params, "iso", |e| {
                Ok(to_image(e, &scope, false, hypervisors.as_deref())
                    .map(mark_iso)
                    .filter(|img| filter.map(|f| f.matches(img)).unwrap_or(true)))
            })
            .await
    }

    /// Id and state of the caller's own templates and ISOs.
    pub async fn list_image_status(&self) -> CsResult<Vec<ResourceStatus<ImageState>>> {
        let scope = self.client.scope()?;
        let mut template_params = vec![Param::new("templateFilter", "self")];
        let mut iso_params = vec![Param::new("isoFilter", "self")];
        if let Some(ref region) = scope.region_id {
            template_params.push(Param::new("zoneId", region));
            iso_params.push(Param::new("zoneId", region));
        }
        iso_params.push(Param::new("bootable", "true"));

        let mut statuses = self
            .client
            .list_all(LIST_TEMPLATES, &template_params, "template", |e| Ok(to_status(e, false)))
            .await?;
        statuses.extend(
            self.client
                .list_all(LIST_ISOS, &iso_params, "iso", |e| Ok(to_status(e, false)))
                .await?,
        );
        Ok(statuses)
    }

    /// Public templates: featured and community, fetched in parallel.
    /// Community images already listed as featured are dropped.
    pub async fn search_public_images(&self, filter: &ImageFilter) -> CsResult<Vec<MachineImage>> {
        let scope = self.client.scope()?;
        let mut jobs = Vec::new();
        for category in ["featured", "community"] {
            let client = self.client.clone();
            let scope = scope.clone();
            let filter = filter.clone();
            let hypervisors = self.hypervisors.clone();
            let mut params = vec![Param::new("templateFilter", category)];
            params.extend(self.zone_params(&scope));
            jobs.push(move |collector: Collector<MachineImage>| async move {
                log::debug!("searching {} templates", category);
                let images = client
                    .list_all(LIST_TEMPLATES, &params, "template", |e| {
                        Ok(to_image(e, &scope, true, hypervisors.as_deref())
                            .filter(|img| filter.matches(img)))
                    })
                    .await?;
                collector.extend(images);
                Ok::<(), CsError>(())
            });
        }

        let found = self.pool.run(jobs).await?;
        let mut seen = HashSet::new();
        Ok(found
            .into_iter()
            .filter(|img| seen.insert(img.id.clone()))
            .collect())
    }

    /// Whether the image is shared with everyone.
    pub async fn is_image_shared_with_public(&self, image_id: &str) -> CsResult<bool> {
        let scope = self.client.scope()?;
        let template_params = [
            Param::new("templateFilter", "executable"),
            Param::new("id", image_id),
        ];
        let iso_params = [
            Param::new("id", image_id),
            Param::new("isoFilter", "executable"),
            Param::new("bootable", "true"),
        ];
        let (doc, tag) = match self.client.get(LIST_TEMPLATES, &template_params).await {
            Ok(Some(doc)) => (Some(doc), "template"),
            Ok(None) => (self.client.get(LIST_ISOS, &iso_params).await?, "iso"),
            Err(e) if e.has_code(431) => (self.client.get(LIST_ISOS, &iso_params).await?, "iso"),
            Err(e) => return Err(e),
        };
        let doc = match doc {
            Some(doc) => doc,
            None => return Ok(false),
        };
        Ok(doc
            .elements_by_tag_name(tag)
            .into_iter()
            .filter_map(|e| to_image(e, &scope, true, None))
            .any(|img| img.id == image_id))
    }

    /// Accounts the image is shared with, excluding the caller.
    pub async fn list_shares(&self, image_id: &str) -> CsResult<Vec<String>> {
        let scope = self.client.scope()?;
        let params = [Param::new("id", image_id)];
        let doc = match self.client.get(LIST_TEMPLATE_PERMISSIONS, &params).await {
            Ok(Some(doc)) => Some(doc),
            Ok(None) => self.client.get(LIST_ISO_PERMISSIONS, &params).await?,
            Err(e) if e.has_code(431) => self.client.get(LIST_ISO_PERMISSIONS, &params).await?,
            Err(e) => return Err(e),
        };
        let doc = match doc {
            Some(doc) => doc,
            None => return Ok(Vec::new()),
        };
        let own = scope.account_number.unwrap_or_default();
        Ok(doc
            .elements_by_tag_name("account")
            .into_iter()
            .filter_map(|e| e.text())
            .filter(|account| !account.eq_ignore_ascii_case(&own))
            .map(|account| account.to_string())
            .collect())
    }

    pub async fn add_image_share(&self, image_id: &str, account: &str) -> CsResult<()> {
        self.share(image_id, &[Param::new("accounts", account), Param::new("op", "add")])
            .await
    }

    pub async fn remove_image_share(&self, image_id: &str, account: &str) -> CsResult<()> {
        self.share(image_id, &[Param::new("accounts", account), Param::new("op", "remove")])
            .await
    }

    pub async fn add_public_share(&self, image_id: &str) -> CsResult<()> {
        self.share(image_id, &[Param::new("isPublic", "true")]).await
    }

    pub async fn remove_public_share(&self, image_id: &str) -> CsResult<()> {
        self.share(image_id, &[Param::new("isPublic", "false")]).await
    }

    pub async fn remove_all_image_shares(&self, image_id: &str) -> CsResult<()> {
        for account in self.list_shares(image_id).await? {
            self.remove_image_share(image_id, &account).await?;
        }
        self.remove_public_share(image_id).await
    }

    /// Delete an image the caller owns.
    pub async fn remove(&self, image_id: &str) -> CsResult<()> {
        let scope = self.client.scope()?;
        let image = self
            .get_image(image_id)
            .await?
            .ok_or_else(|| CsError::api(431, format!("Machine image {} does not exist", image_id)))?;
        if !self.can_manage(&scope, &image) {
            return Err(CsError::internal(format!(
                "{} cannot remove images belonging to {}",
                scope.account_number.as_deref().unwrap_or("unknown account"),
                image.owner_id.as_deref().unwrap_or("unknown account")
            )));
        }

        let mut params = vec![Param::new("id", image_id)];
        if let Some(ref region) = scope.region_id {
            params.push(Param::new("zoneid", region));
        }
        match self.client.get(DELETE_TEMPLATE, &params).await {
            Ok(Some(doc)) => {
                self.jobs.wait_for_job(doc, "Delete Template").await?;
            }
            Ok(None) => self.delete_iso(image_id).await?,
            Err(e) if e.has_code(431) => self.delete_iso(image_id).await?,
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Id of the OS type whose description matches the platform and
    /// architecture.
    pub async fn find_os_type(
        &self,
        platform: Platform,
        architecture: Architecture,
    ) -> CsResult<Option<String>> {
        let doc = match self.client.get(LIST_OS_TYPES, &[]).await? {
            Some(doc) => doc,
            None => return Ok(None),
        };
        for element in doc.elements_by_tag_name("ostype") {
            let mut id = None;
            let mut guessed = (None, Architecture::I64);
            for field in fields(element) {
                match field.name.as_str() {
                    "id" => id = field.owned(),
                    "description" => {
                        if let Some(desc) = field.value {
                            guessed = (Some(Platform::guess(desc)), Architecture::guess(desc));
                        }
                    }
                    _ => {}
                }
            }
            if guessed == (Some(platform), architecture) {
                if let Some(id) = id {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    /// Replace every tag on the images.
    pub async fn set_tags(&self, image_ids: &[String], tags: &[Tag]) -> CsResult<()> {
        self.tags.remove_tags(image_ids, RESOURCE_TYPE, &[]).await?;
        self.tags.create_tags(image_ids, RESOURCE_TYPE, tags).await
    }

    pub async fn update_tags(&self, image_ids: &[String], tags: &[Tag]) -> CsResult<()> {
        self.tags.update_tags(image_ids, RESOURCE_TYPE, tags).await
    }

    pub async fn remove_tags(&self, image_ids: &[String], tags: &[Tag]) -> CsResult<()> {
        self.tags.remove_tags(image_ids, RESOURCE_TYPE, tags).await
    }

    pub async fn is_subscribed(&self) -> CsResult<bool> {
        self.client.is_subscribed().await
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn zone_params(&self, scope: &HydrationScope) -> Vec<Param> {
        let mut params = Vec::new();
        if let Some(ref region) = scope.region_id {
            if !region.is_empty() {
                params.push(Param::new("zoneId", region));
            }
        }
        // a zone with a single hypervisor only ever runs images built for it
        if let Some([only]) = self.hypervisors.as_deref() {
            params.push(Param::new("hypervisor", only));
        }
        params
    }

    fn can_manage(&self, scope: &HydrationScope, image: &MachineImage) -> bool {
        if scope.owns(image.owner_id.as_deref()) {
            return true;
        }
        matches!(
            (self.parent_account.as_deref(), image.owner_id.as_deref()),
            (Some(parent), Some(owner)) if parent.eq_ignore_ascii_case(owner)
        )
    }

    /// Update template permissions, falling back to ISO permissions.
    async fn share(&self, image_id: &str, change: &[Param]) -> CsResult<()> {
        let scope = self.client.scope()?;
        let image = match self.get_image(image_id).await? {
            Some(image) => image,
            None => return Ok(()),
        };
        if !self.can_manage(&scope, &image) {
            log::warn!("{} is not owned by the caller; sharing unchanged", image_id);
            return Ok(());
        }
        let mut params = vec![Param::new("id", image_id)];
        params.extend_from_slice(change);

        match self.client.get(UPDATE_TEMPLATE_PERMISSIONS, &params).await {
            Ok(Some(doc)) => {
                self.jobs.wait_for_job(doc, "Share Template").await?;
            }
            Ok(None) => self.share_iso(&params).await?,
            Err(e) if e.has_code(431) => self.share_iso(&params).await?,
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn share_iso(&self, params: &[Param]) -> CsResult<()> {
        if let Some(doc) = self.client.get(UPDATE_ISO_PERMISSIONS, params).await? {
            self.jobs.wait_for_job(doc, "Share Iso").await?;
        }
        Ok(())
    }

    async fn delete_iso(&self, image_id: &str) -> CsResult<()> {
        if let Some(doc) = self.client.get(DELETE_ISO, &[Param::new("id", image_id)]).await? {
            self.jobs.wait_for_job(doc, "Delete Iso").await?;
        }
        Ok(())
    }
}

// ── Hydration ───────────────────────────────────────────────────────────

fn lookup(result: CsResult<Option<XmlDocument>>) -> CsResult<Lookup> {
    match result {
        Ok(Some(doc)) => Ok(Lookup::Found(doc)),
        Ok(None) => Ok(Lookup::TryIso),
        Err(e) if e.has_code(431) => Ok(Lookup::TryIso),
        Err(e)
            if e.message.contains("specify a valid template ID")
                || e.message.contains("does not have permission") =>
        {
            Ok(Lookup::Absent)
        }
        Err(e) => Err(e),
    }
}

fn mark_iso(mut image: MachineImage) -> MachineImage {
    image.iso = true;
    image.tags.insert("isISO".to_string(), "true".to_string());
    image
}

/// Build an image from a `<template>` or `<iso>` element.
///
/// Returns `None` without an id, for an unwanted hypervisor, when
/// `only_if_public` is set and the image is private, or when the image is
/// pinned to another zone.
pub fn to_image(
    element: &XmlElement,
    scope: &HydrationScope,
    only_if_public: bool,
    hypervisors: Option<&[String]>,
) -> Option<MachineImage> {
    let mut best_guess = Architecture::I64;
    let mut architecture = None;
    let mut platform: Option<Platform> = None;
    let mut tags = HashMap::new();
    let mut owner = scope.account_number.clone();
    let mut state = ImageState::Pending;
    let (mut id, mut name, mut description, mut region) = (None, None, None, None);
    let mut created = None;
    let mut public = false;
    let mut cross_zones = false;

    for field in fields(element) {
        let value = field.value;
        match field.name.as_str() {
            "id" => id = field.owned(),
            "crosszones" => cross_zones = field.is_true(),
            "zoneid" => region = field.owned(),
            "hypervisor" => {
                if let Some(wanted) = hypervisors {
                    if !value.map(|v| wanted.iter().any(|h| h == v)).unwrap_or(false) {
                        return None;
                    }
                }
            }
            "account" => owner = field.owned(),
            "name" | "displaytext" => {
                if let Some(v) = value {
                    if v.contains("x64") {
                        best_guess = Architecture::I64;
                    } else if v.contains("x32") {
                        best_guess = Architecture::I32;
                    }
                }
                if field.name == "name" {
                    name = field.owned();
                } else {
                    description = field.owned();
                }
            }
            "ispublic" => public = field.is_true(),
            "ostypename" => {
                if let Some(v) = value {
                    if v.contains("64") {
                        best_guess = Architecture::I64;
                    } else if v.contains("32") {
                        best_guess = Architecture::I32;
                    }
                    if platform.is_none() {
                        platform = Some(Platform::guess(v));
                    }
                }
            }
            "ostypeid" => {
                if let Some(v) = value {
                    tags.insert(OS_TYPE_TAG.to_string(), v.to_string());
                }
            }
            "bits" => {
                architecture = Some(match value {
                    None | Some("64") => Architecture::I64,
                    Some(_) => Architecture::I32,
                });
            }
            "created" => created = value.and_then(parse_timestamp),
            "isready" => {
                if field.is_true() {
                    state = ImageState::Active;
                }
            }
            "status" => {
                if !value.map(|v| v.eq_ignore_ascii_case("Download Complete")).unwrap_or(false) {
                    log::warn!("Template status={}", value.unwrap_or("null"));
                }
            }
            _ => {}
        }
    }

    let mut platform = platform.unwrap_or_default();
    if platform.is_unknown() {
        platform = Platform::guess_opt(name.as_deref());
    }
    if platform.is_unknown() {
        platform = Platform::guess_opt(description.as_deref());
    }

    if only_if_public && !public {
        return None;
    }
    if !scope.is_visible(region.as_deref(), cross_zones) {
        return None;
    }
    let id = id?;
    let software = guess_software(name.as_deref(), description.as_deref());

    Some(MachineImage {
        id,
        name,
        description,
        owner_id: owner,
        region_id: region,
        state,
        architecture: architecture.unwrap_or(best_guess),
        platform,
        software,
        public,
        iso: false,
        created,
        tags,
    })
}

/// Status-only hydration of a template or ISO.
pub fn to_status(element: &XmlElement, only_if_public: bool) -> Option<ResourceStatus<ImageState>> {
    let mut id = None;
    let mut public = false;
    let mut state = ImageState::Pending;
    for field in fields(element) {
        match field.name.as_str() {
            "id" => id = field.value,
            "ispublic" => public = field.is_true(),
            "isready" => {
                if field.is_true() {
                    state = ImageState::Active;
                }
            }
            _ => {}
        }
    }
    if only_if_public && !public {
        return None;
    }
    id.map(|id| ResourceStatus::new(id, state))
}

/// Detect bundled database software from the image name and description.
pub fn guess_software(name: Option<&str>, description: Option<&str>) -> String {
    let text = format!(
        "{} {}",
        name.unwrap_or("null"),
        description.unwrap_or("null")
    )
    .to_lowercase();
    text.split(',')
        .filter(|part| part.contains("sql server"))
        .map(|part| {
            if part.contains("sql server 2005") && !part.contains("sql server 2008") {
                "SQL Server 2005"
            } else {
                "SQL Server 2008"
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
