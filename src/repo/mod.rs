// # Repositories
//
// Business CRUD over the SQL pool with the two-tier cache in front: reads
// are read-through (record and versioned-list keyspaces), mutations write
// SQL first, then invalidate both tiers and bump the entity's list version.

pub mod items;
pub mod users;

pub use items::{Item, ItemPatch, ItemRepository, NewItem};
pub use users::{NewUser, User, UserPatch, UserRepository};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

/// Pagination query accepted by every list endpoint.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ListParams {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl ListParams {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE)
    }

    pub fn offset(&self) -> i64 {
        (self.page() as i64 - 1) * self.per_page() as i64
    }

    pub fn limit(&self) -> i64 {
        self.per_page() as i64
    }

    /// The canonicalizable form used for list cache keys.
    pub fn to_query(self) -> BTreeMap<String, String> {
        let mut query = BTreeMap::new();
        query.insert("page".to_string(), self.page().to_string());
        query.insert("per_page".to_string(), self.per_page().to_string());
        query
    }
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            page: None,
            per_page: None,
        }
    }
}

/// One page of list results; this shape is what list caches store as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_params_normalization() {
        let params = ListParams::default();
        assert_eq!(params.page(), 1);
        assert_eq!(params.per_page(), DEFAULT_PER_PAGE);
        assert_eq!(params.offset(), 0);

        let params = ListParams {
            page: Some(0),
            per_page: Some(10_000),
        };
        assert_eq!(params.page(), 1);
        assert_eq!(params.per_page(), MAX_PER_PAGE);

        let params = ListParams {
            page: Some(3),
            per_page: Some(25),
        };
        assert_eq!(params.offset(), 50);
        assert_eq!(params.limit(), 25);
    }

    #[test]
    fn test_to_query_is_canonicalizable() {
        let params = ListParams {
            page: Some(2),
            per_page: None,
        };
        let query = params.to_query();
        assert_eq!(query.get("page").map(String::as_str), Some("2"));
        assert_eq!(query.get("per_page").map(String::as_str), Some("20"));
    }
}
