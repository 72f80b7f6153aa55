use std::fmt;

use bolero::generator::TypeGenerator;

use crate::Comment;

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    PartialEq,
    bolero::generator::TypeGenerator,
    serde::Deserialize,
    serde::Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SortBy {
    #[default]
    Newest,
    Oldest,
    #[serde(alias = "likes")]
    MostLiked,
    #[serde(alias = "dislikes")]
    MostDisliked,
}

impl SortBy {
    /// Polarity of the votes this order ranks by, if it is vote-based
    pub fn ranking_polarity(&self) -> Option<bool> {
        match self {
            SortBy::Newest | SortBy::Oldest => None,
            SortBy::MostLiked => Some(true),
            SortBy::MostDisliked => Some(false),
        }
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortBy::Newest => "newest",
            SortBy::Oldest => "oldest",
            SortBy::MostLiked => "most-liked",
            SortBy::MostDisliked => "most-disliked",
        })
    }
}

/// Query string of the comment list
///
/// Unset fields are filled in by the server with its configured defaults.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    pub sort_by: Option<SortBy>,
    pub max_depth: Option<u32>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailQuery {
    pub max_depth: Option<u32>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: u64,
    pub total_pages: u64,
    pub total_comments: u64,
    pub limit: u64,
    pub items_on_page: u64,
    pub has_next: bool,
    pub has_prev: bool,
    pub next_page: Option<u64>,
    pub prev_page: Option<u64>,
}

impl Pagination {
    pub fn new(current_page: u64, limit: u64, total_comments: u64, items_on_page: u64) -> Self {
        let total_pages = (total_comments + limit - 1) / limit;
        let has_next = current_page < total_pages;
        let has_prev = current_page > 1;
        Pagination {
            current_page,
            total_pages,
            total_comments,
            limit,
            items_on_page,
            has_next,
            has_prev,
            next_page: has_next.then(|| current_page + 1),
            prev_page: has_prev.then(|| current_page - 1),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentPage {
    pub comments: Vec<Comment>,
    pub pagination: Pagination,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_aliases() {
        let q: ListQuery = serde_json::from_str(r#"{"sortBy": "likes"}"#).unwrap();
        assert_eq!(q.sort_by, Some(SortBy::MostLiked));
        let q: ListQuery = serde_json::from_str(r#"{"sortBy": "most-disliked"}"#).unwrap();
        assert_eq!(q.sort_by, Some(SortBy::MostDisliked));
        assert_eq!(SortBy::MostLiked.to_string(), "most-liked");
    }

    #[test]
    fn pagination_metadata() {
        let p = Pagination::new(1, 10, 25, 10);
        assert_eq!(p.total_pages, 3);
        assert_eq!((p.next_page, p.prev_page), (Some(2), None));
        let p = Pagination::new(3, 10, 25, 5);
        assert_eq!((p.has_next, p.has_prev), (false, true));
        assert_eq!(p.prev_page, Some(2));
        let p = Pagination::new(1, 10, 0, 0);
        assert_eq!(p.total_pages, 0);
        assert!(!p.has_next);
    }
}
