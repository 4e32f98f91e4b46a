//! Paged search over the projection.
//!
//! The in-memory store evaluates [`SearchQuery`] with [`SearchQuery::run`];
//! the Postgres store translates the same filters and orderings to SQL.

use crate::search::model::SearchItem;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Auctions ending within this window count as ending soon.
pub const ENDING_SOON_WINDOW: Duration = Duration::hours(6);

/// Largest accepted page size.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Result filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterBy {
    /// Bidding has closed
    Finished,
    /// Bidding closes within [`ENDING_SOON_WINDOW`]
    EndingSoon,
    /// Bidding is open
    Live,
}

/// Result ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderBy {
    /// Make, then model, alphabetically
    Make,
    /// Newest listing first
    New,
    /// Closest end time first
    #[default]
    EndingSoon,
}

const fn default_page_number() -> u32 {
    1
}

const fn default_page_size() -> u32 {
    4
}

/// Search parameters, as accepted on `GET /api/search`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    /// Case-insensitive substring of make, model or color
    #[serde(default)]
    pub search_term: Option<String>,
    /// Exact seller
    #[serde(default)]
    pub seller: Option<String>,
    /// Exact winner
    #[serde(default)]
    pub winner: Option<String>,
    /// Time-based filter
    #[serde(default)]
    pub filter_by: Option<FilterBy>,
    /// Ordering
    #[serde(default)]
    pub order_by: OrderBy,
    /// 1-based page
    #[serde(default = "default_page_number")]
    pub page_number: u32,
    /// Items per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            search_term: None,
            seller: None,
            winner: None,
            filter_by: None,
            order_by: OrderBy::default(),
            page_number: default_page_number(),
            page_size: default_page_size(),
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    /// Items on this page
    pub results: Vec<SearchItem>,
    /// Number of pages at this page size
    pub page_count: u64,
    /// Number of matching items
    pub total_count: u64,
}

impl SearchQuery {
    /// Page size clamped to `1..=MAX_PAGE_SIZE`.
    #[must_use]
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    /// Number of items skipped before this page.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page_number.max(1) - 1) * u64::from(self.effective_page_size())
    }

    /// Whether `item` passes every filter at `now`.
    #[must_use]
    pub fn matches(&self, item: &SearchItem, now: DateTime<Utc>) -> bool {
        if let Some(term) = self.search_term.as_deref().filter(|t| !t.is_empty()) {
            let term = term.to_lowercase();
            let hit = [&item.make, &item.model, &item.color]
                .iter()
                .any(|field| field.to_lowercase().contains(&term));
            if !hit {
                return false;
            }
        }
        if self.seller.as_ref().is_some_and(|seller| *seller != item.seller) {
            return false;
        }
        if self
            .winner
            .as_ref()
            .is_some_and(|winner| item.winner.as_ref() != Some(winner))
        {
            return false;
        }
        match self.filter_by {
            Some(FilterBy::Finished) => item.auction_end < now,
            Some(FilterBy::EndingSoon) => item.auction_end > now && item.auction_end < now + ENDING_SOON_WINDOW,
            Some(FilterBy::Live) => item.auction_end > now,
            None => true,
        }
    }

    /// Sort `items` by this query's ordering. Ties break on id.
    pub fn sort(&self, items: &mut [SearchItem]) {
        match self.order_by {
            OrderBy::Make => items.sort_by(|a, b| (&a.make, &a.model, a.id).cmp(&(&b.make, &b.model, b.id))),
            OrderBy::New => items.sort_by(|a, b| (b.created_at, a.id).cmp(&(a.created_at, b.id))),
            OrderBy::EndingSoon => items.sort_by_key(|item| (item.auction_end, item.id)),
        }
    }

    /// Filter, sort and page `items`.
    #[must_use]
    pub fn run<'a>(&self, items: impl IntoIterator<Item = &'a SearchItem>, now: DateTime<Utc>) -> SearchPage {
        let mut matching: Vec<SearchItem> = items
            .into_iter()
            .filter(|item| self.matches(item, now))
            .cloned()
            .collect();
        self.sort(&mut matching);

        let total_count = matching.len() as u64;
        let results = matching
            .into_iter()
            .skip(usize::try_from(self.offset()).unwrap_or(usize::MAX))
            .take(self.effective_page_size() as usize)
            .collect();

        self.page(results, total_count)
    }

    /// Assemble a page from already-selected results.
    #[must_use]
    pub fn page(&self, results: Vec<SearchItem>, total_count: u64) -> SearchPage {
        SearchPage {
            results,
            page_count: total_count.div_ceil(u64::from(self.effective_page_size())),
            total_count,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_support::auction;
    use gavel_testing::test_epoch;

    fn item(make: &str, model: &str, ends_in_hours: i64, created_minutes: i64) -> SearchItem {
        let mut a = auction();
        a.item.make = make.into();
        a.item.model = model.into();
        a.auction_end = test_epoch() + Duration::hours(ends_in_hours);
        a.created_at = test_epoch() + Duration::minutes(created_minutes);
        SearchItem::from(&a)
    }

    fn items() -> Vec<SearchItem> {
        vec![
            item("Ford", "GT", 48, 1),
            item("Audi", "R8", 2, 3),
            item("Ford", "Mustang", -1, 2),
            item("Bugatti", "Veyron", 5, 4),
        ]
    }

    fn makes(page: &SearchPage) -> Vec<&str> {
        page.results.iter().map(|i| i.make.as_str()).collect()
    }

    #[test]
    fn query_string_defaults() {
        let query: SearchQuery = serde_json::from_str(r#"{"filterBy":"endingSoon","orderBy":"new"}"#).unwrap();
        assert_eq!(query.filter_by, Some(FilterBy::EndingSoon));
        assert_eq!(query.order_by, OrderBy::New);
        assert_eq!(query.page_number, 1);
        assert_eq!(query.page_size, 4);
    }

    #[test]
    fn default_order_is_ending_soonest() {
        let page = SearchQuery::default().run(&items(), test_epoch());
        assert_eq!(makes(&page), vec!["Ford", "Audi", "Bugatti", "Ford"]);
        assert_eq!(page.total_count, 4);
        assert_eq!(page.page_count, 1);
    }

    #[test]
    fn time_filters() {
        let items = items();
        let run = |filter| {
            SearchQuery {
                filter_by: Some(filter),
                ..SearchQuery::default()
            }
            .run(&items, test_epoch())
            .total_count
        };
        assert_eq!(run(FilterBy::Finished), 1);
        assert_eq!(run(FilterBy::EndingSoon), 2);
        assert_eq!(run(FilterBy::Live), 3);
    }

    #[test]
    fn search_term_matches_case_insensitively() {
        let query = SearchQuery {
            search_term: Some("ford".into()),
            order_by: OrderBy::Make,
            ..SearchQuery::default()
        };
        let page = query.run(&items(), test_epoch());
        let models: Vec<&str> = page.results.iter().map(|i| i.model.as_str()).collect();
        assert_eq!(models, vec!["GT", "Mustang"]);
    }

    #[test]
    fn newest_first_and_paging() {
        let query = SearchQuery {
            order_by: OrderBy::New,
            page_number: 2,
            page_size: 3,
            ..SearchQuery::default()
        };
        let page = query.run(&items(), test_epoch());
        assert_eq!(makes(&page), vec!["Ford"]);
        assert_eq!(page.results[0].model, "GT");
        assert_eq!(page.page_count, 2);
    }

    #[test]
    fn seller_and_winner_filters() {
        let mut items = items();
        items[1].seller = "carol".into();
        items[2].winner = Some("dave".into());

        let by_seller = SearchQuery {
            seller: Some("carol".into()),
            ..SearchQuery::default()
        };
        assert_eq!(makes(&by_seller.run(&items, test_epoch())), vec!["Audi"]);

        let by_winner = SearchQuery {
            winner: Some("dave".into()),
            ..SearchQuery::default()
        };
        assert_eq!(by_winner.run(&items, test_epoch()).results[0].model, "Mustang");
    }
}
