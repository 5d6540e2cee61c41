//! Paginated listing.
//!
//! The first request goes out with the caller's parameters. Its `count`
//! element gives the total, from which the number of pages follows; pages
//! 2..N are then fetched one after another with `pagesize` and `page` set.
//! Results keep server order within a page and ascending page order.

use crate::client::CsClient;
use crate::config::DEFAULT_PAGE_SIZE;
use crate::error::{CsError, CsResult};
use crate::hydrate::hydrate_all;
use crate::param::{set_param, Param};
use crate::xml::{XmlDocument, XmlElement};

/// Sequential lister over one command.
pub struct Paginator<'a> {
    client: &'a CsClient,
    page_size: u32,
}

impl<'a> Paginator<'a> {
    pub fn new(client: &'a CsClient) -> Self {
        Self {
            client,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Fetch every page and hydrate each element named `tag`.
    pub async fn list<T, F>(
        &self,
        command: &str,
        params: &[Param],
        tag: &str,
        mut hydrate: F,
    ) -> CsResult<Vec<T>>
    where
        T: Send,
        F: FnMut(&XmlElement) -> CsResult<Option<T>> + Send,
    {
        let first = match self.client.get(command, params).await? {
            Some(doc) => doc,
            None => return Ok(Vec::new()),
        };
        let pages = page_count(&first, self.page_size)?;
        let mut items = hydrate_all(&first, tag, &mut hydrate)?;
        drop(first);

        for page in 2..=pages {
            let mut paged = params.to_vec();
            set_param(&mut paged, "pagesize", &self.page_size.to_string());
            set_param(&mut paged, "page", &page.to_string());
            match self.client.get(command, &paged).await? {
                Some(doc) => items.extend(hydrate_all(&doc, tag, &mut hydrate)?),
                None => {
                    log::warn!("{}: page {} of {} reported no results", command, page, pages);
                    break;
                }
            }
        }
        Ok(items)
    }
}

/// Number of pages announced by the first response.
///
/// No `count` element (or an empty one) means a single page.
pub fn page_count(doc: &XmlDocument, page_size: u32) -> CsResult<u64> {
    let text = match doc.first_text("count") {
        Some(text) => text.trim(),
        None => return Ok(1),
    };
    let count: u64 = text
        .parse()
        .map_err(|_| CsError::communication(format!("Invalid count in response: {}", text)))?;
    Ok(count.div_ceil(u64::from(page_size.max(1))))
}
