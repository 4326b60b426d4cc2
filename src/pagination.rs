//! Pagination strategies: detect a further page and build its request.
//!
//! Each strategy is a variant with an explicit extraction contract:
//!
//! - `Cursor` - opaque token in the body, sent back as a query parameter
//! - `NextLink` - full next-page URL in the body
//! - `LinkHeader` - `Link: <url>; rel="next"` response header
//! - `PageNumber` - incrementing page number; a short page ends the walk
//!
//! Field paths are dotted keys (`meta.next`) or JSON pointers (`/meta/next`).

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::request::RequestSpec;
use crate::response::ResponsePage;

pub const DEFAULT_MAX_PAGES: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaginationStrategy {
    #[default]
    None,
    Cursor {
        cursor_field: String,
        cursor_param: String,
    },
    NextLink {
        link_field: String,
    },
    LinkHeader,
    PageNumber {
        #[serde(default = "default_page_param")]
        page_param: String,
        #[serde(default)]
        page_size_param: Option<String>,
        page_size: usize,
        #[serde(default = "default_start_page")]
        start_page: u64,
    },
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_start_page() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PaginationSettings {
    #[serde(flatten)]
    pub strategy: PaginationStrategy,
    /// Where the result list lives in each page body. When absent, the
    /// body itself must be the list.
    #[serde(default)]
    pub results_field: Option<String>,
    /// Stop as soon as a page yields no results, even if its metadata
    /// advertises another page.
    #[serde(default = "default_stop_on_empty")]
    pub stop_on_empty: bool,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

fn default_stop_on_empty() -> bool {
    true
}

fn default_max_pages() -> usize {
    DEFAULT_MAX_PAGES
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self::new(PaginationStrategy::None)
    }
}

impl PaginationSettings {
    pub fn new(strategy: PaginationStrategy) -> Self {
        Self {
            strategy,
            results_field: None,
            stop_on_empty: true,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn cursor(cursor_field: impl Into<String>, cursor_param: impl Into<String>) -> Self {
        Self::new(PaginationStrategy::Cursor {
            cursor_field: cursor_field.into(),
            cursor_param: cursor_param.into(),
        })
    }

    pub fn next_link(link_field: impl Into<String>) -> Self {
        Self::new(PaginationStrategy::NextLink {
            link_field: link_field.into(),
        })
    }

    pub fn link_header() -> Self {
        Self::new(PaginationStrategy::LinkHeader)
    }

    pub fn page_number(page_param: impl Into<String>, page_size: usize) -> Self {
        Self::new(PaginationStrategy::PageNumber {
            page_param: page_param.into(),
            page_size_param: None,
            page_size,
            start_page: 1,
        })
    }

    pub fn with_results_field(mut self, field: impl Into<String>) -> Self {
        self.results_field = Some(field.into());
        self
    }

    pub fn with_stop_on_empty(mut self, stop: bool) -> Self {
        self.stop_on_empty = stop;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_page_size_param(mut self, param: impl Into<String>) -> Self {
        if let PaginationStrategy::PageNumber {
            page_size_param, ..
        } = &mut self.strategy
        {
            *page_size_param = Some(param.into());
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.strategy != PaginationStrategy::None
    }

    /// Sets up the first request of a walk (page-number parameters).
    pub fn prepare_first(&self, request: &mut RequestSpec) {
        if let PaginationStrategy::PageNumber {
            page_param,
            page_size_param,
            page_size,
            start_page,
        } = &self.strategy
        {
            if request.query_value(page_param).is_none() {
                request.set_query(page_param, start_page.to_string());
            }
            if let Some(size_param) = page_size_param {
                if request.query_value(size_param).is_none() {
                    request.set_query(size_param, page_size.to_string());
                }
            }
        }
    }

    /// Result items carried by a page. A missing field or a non-JSON body
    /// yields no items; a field that is present but not a list is malformed.
    pub fn results(&self, page: &ResponsePage) -> Result<Vec<Value>, ApiError> {
        let Some(body) = page.body.as_json() else {
            return Ok(Vec::new());
        };

        match &self.results_field {
            Some(field) => match lookup(body, field) {
                None | Some(Value::Null) => Ok(Vec::new()),
                Some(Value::Array(items)) => Ok(items.clone()),
                Some(other) => Err(ApiError::pagination(format!(
                    "results field '{}' is not a list (found {})",
                    field,
                    kind(other)
                ))),
            },
            None => match body {
                Value::Array(items) => Ok(items.clone()),
                _ => Ok(Vec::new()),
            },
        }
    }

    /// Whether the page's own metadata advertises another page.
    pub fn has_next(&self, page: &ResponsePage) -> Result<bool, ApiError> {
        match &self.strategy {
            PaginationStrategy::None => Ok(false),
            PaginationStrategy::Cursor { cursor_field, .. } => {
                Ok(self.cursor_value(page, cursor_field)?.is_some())
            }
            PaginationStrategy::NextLink { link_field } => {
                Ok(self.body_link(page, link_field)?.is_some())
            }
            PaginationStrategy::LinkHeader => Ok(page.links().contains_key("next")),
            PaginationStrategy::PageNumber { page_size, .. } => {
                Ok(self.results(page)?.len() >= *page_size)
            }
        }
    }

    /// Builds the request for the page after `page`. Relative next links
    /// resolve against the URL `previous` was sent to.
    pub fn build_next(
        &self,
        page: &ResponsePage,
        previous: &RequestSpec,
        base_url: &Url,
    ) -> Result<RequestSpec, ApiError> {
        let mut next = previous.clone();

        match &self.strategy {
            PaginationStrategy::None => {
                return Err(ApiError::pagination("pagination is not configured"));
            }
            PaginationStrategy::Cursor {
                cursor_field,
                cursor_param,
            } => {
                let cursor = self
                    .cursor_value(page, cursor_field)?
                    .ok_or_else(|| ApiError::pagination(format!("no cursor at '{}'", cursor_field)))?;
                next.set_query(cursor_param, cursor);
            }
            PaginationStrategy::NextLink { link_field } => {
                let link = self
                    .body_link(page, link_field)?
                    .ok_or_else(|| ApiError::pagination(format!("no link at '{}'", link_field)))?;
                follow_link(&mut next, &previous.resolve_url(base_url)?, &link)?;
            }
            PaginationStrategy::LinkHeader => {
                let link = page
                    .links()
                    .remove("next")
                    .ok_or_else(|| ApiError::pagination("no rel=\"next\" in Link header"))?;
                follow_link(&mut next, &previous.resolve_url(base_url)?, &link)?;
            }
            PaginationStrategy::PageNumber {
                page_param,
                start_page,
                ..
            } => {
                let current = match previous.query_value(page_param) {
                    Some(value) => value.parse::<u64>().map_err(|_| {
                        ApiError::pagination(format!(
                            "page parameter '{}' is not a number: '{}'",
                            page_param, value
                        ))
                    })?,
                    None => *start_page,
                };
                next.set_query(page_param, (current + 1).to_string());
            }
        }

        Ok(next)
    }

    /// The next request to issue, or `None` when the walk is over.
    /// `item_count` is the number of results the page yielded.
    pub fn next_request(
        &self,
        page: &ResponsePage,
        previous: &RequestSpec,
        base_url: &Url,
        item_count: usize,
    ) -> Result<Option<RequestSpec>, ApiError> {
        if self.stop_on_empty && item_count == 0 {
            return Ok(None);
        }
        if !self.has_next(page)? {
            return Ok(None);
        }
        self.build_next(page, previous, base_url).map(Some)
    }

    fn cursor_value(&self, page: &ResponsePage, field: &str) -> Result<Option<String>, ApiError> {
        let Some(body) = page.body.as_json() else {
            return Ok(None);
        };
        match lookup(body, field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(ApiError::pagination(format!(
                "cursor field '{}' must be a string or number (found {})",
                field,
                kind(other)
            ))),
        }
    }

    fn body_link(&self, page: &ResponsePage, field: &str) -> Result<Option<String>, ApiError> {
        let Some(body) = page.body.as_json() else {
            return Ok(None);
        };
        match lookup(body, field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(ApiError::pagination(format!(
                "link field '{}' must be a string (found {})",
                field,
                kind(other)
            ))),
        }
    }
}

/// Points `request` at `link` as resolved against `current`. The link
/// already carries its own query string.
fn follow_link(request: &mut RequestSpec, current: &Url, link: &str) -> Result<(), ApiError> {
    let url = current
        .join(link)
        .map_err(|e| ApiError::pagination(format!("next link '{}': {}", link, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::pagination(format!(
            "next link '{}' is not an http(s) URL",
            link
        )));
    }
    request.target = url.into();
    request.query.clear();
    Ok(())
}

/// Resolves a dotted path or JSON pointer inside `value`.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.starts_with('/') {
        return value.pointer(path);
    }
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
