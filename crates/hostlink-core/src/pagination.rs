//! Page/pageSize handling for list results.

use serde::Serialize;

use crate::error::{BridgeError, BridgeResult};
use crate::payload::Payload;

/// Page size used when the request does not name one.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page a client may request.
pub const MAX_PAGE_SIZE: usize = 200;

/// Validated pagination parameters (0-based page).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Reads optional `page` and `pageSize` fields from a payload.
    pub fn from_payload(payload: &Payload) -> BridgeResult<Self> {
        let page = payload
            .optional_u64("page")?
            .map(|p| usize::try_from(p).unwrap_or(usize::MAX))
            .unwrap_or(0);

        let page_size = match payload.optional_u64("pageSize")? {
            None => DEFAULT_PAGE_SIZE,
            Some(size) => {
                let size = usize::try_from(size).unwrap_or(usize::MAX);
                if size == 0 || size > MAX_PAGE_SIZE {
                    return Err(BridgeError::invalid_field(
                        "pageSize",
                        format!("must be between 1 and {MAX_PAGE_SIZE}"),
                    ));
                }
                size
            }
        };

        Ok(Self { page, page_size })
    }

    /// Slices `items` to the requested page.
    ///
    /// A page past the end yields an empty item list rather than an error.
    pub fn paginate<T>(&self, items: Vec<T>) -> Page<T> {
        let total_count = items.len();
        let skip = self.page.saturating_mul(self.page_size);

        let items = items
            .into_iter()
            .skip(skip)
            .take(self.page_size)
            .collect();

        Page {
            items,
            page: self.page,
            page_size: self.page_size,
            total_count,
        }
    }
}

/// One page of a list result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total_count: usize,
}
