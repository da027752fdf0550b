//! Offset-driven pagination over VK list endpoints.
//!
//! [`fetch_all`] turns a page fetcher into a lazy stream of items. One
//! page is in flight at a time; the next page is only requested once the
//! consumer has drained the current one. Independent streams (one per
//! group or post) can be polled concurrently and share the process-wide
//! rate limiter through their fetchers.

use std::collections::HashSet;
use std::future::Future;

use futures::Stream;
use vk_ingest_source_models::{Identified, Page};

use crate::FetchError;

/// Streams every item of a paginated listing.
///
/// `fetch_page(offset, count)` is called with `offset` starting at zero and
/// advancing by the requested count. The stream ends when:
///
/// * a page comes back shorter than requested (or VK's reported total is
///   reached),
/// * `max_items` items have been yielded, or
/// * `fetch_page` fails, in which case the error is yielded last. Items
///   yielded before the error stay valid.
///
/// Items whose id was already yielded earlier in the same stream are
/// skipped. VK listings shift when posts or comments are added while
/// paging, which makes the boundary item reappear on the next page.
pub fn fetch_all<T, F, Fut>(
    label: String,
    mut fetch_page: F,
    page_size: u64,
    max_items: Option<u64>,
) -> impl Stream<Item = Result<T, FetchError>>
where
    T: Identified,
    F: FnMut(u64, u64) -> Fut,
    Fut: Future<Output = Result<Page<T>, FetchError>>,
{
    let page_size = page_size.max(1);

    async_stream::try_stream! {
        let mut offset = 0u64;
        let mut yielded = 0u64;
        let mut pages = 0u64;
        let mut seen = HashSet::new();

        loop {
            let count = max_items.map_or(page_size, |max| page_size.min(max - yielded));
            if count == 0 {
                break;
            }

            let page = fetch_page(offset, count).await?;
            pages += 1;

            let has_more = page.has_more();
            let next_offset = page.next_offset();
            let received = page.items.len();

            for item in page.items {
                if !seen.insert(item.vk_id()) {
                    log::debug!("[{label}] skipping duplicate item {}", item.vk_id());
                    continue;
                }
                if max_items.is_some_and(|max| yielded >= max) {
                    break;
                }
                yielded += 1;
                yield item;
            }

            log::debug!(
                "[{label}] page {pages} at offset {offset}: {received} items (total: {yielded})"
            );

            if !has_more {
                break;
            }
            if max_items.is_some_and(|max| yielded >= max) {
                log::info!("[{label}] reached limit of {yielded} items");
                break;
            }

            offset = next_offset;
        }
    }
}
