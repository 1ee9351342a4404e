//! Lazy page sequences over a connector endpoint.
//!
//! A [`Paginator`] issues one `send` per call to [`Paginator::next_page`] and
//! never prefetches. Once it yields an error, reaches a terminal page, hits
//! its `max_items` cap or observes cancellation, every later call returns
//! `None`.

use std::sync::Arc;

use futures_core::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ConnectorResult;
use crate::client::Client;
use crate::error::ErrorKind;
use crate::request::RequestSpec;

pub type ItemsExtractor = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;
pub type CursorExtractor = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;
pub type NumberExtractor = Arc<dyn Fn(&Value) -> Option<u64> + Send + Sync>;

/// Looks up a dotted path such as `paging.next.after`. Numeric segments
/// index into arrays.
pub fn value_at<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index)),
        _ => None,
    })
}

pub fn items_at(path: impl Into<String>) -> ItemsExtractor {
    let path = path.into();
    Arc::new(move |body: &Value| match value_at(body, &path) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    })
}

/// Reads a continuation token; numbers are stringified and empty strings
/// count as absent.
pub fn string_at(path: impl Into<String>) -> CursorExtractor {
    let path = path.into();
    Arc::new(move |body: &Value| match value_at(body, &path)? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

pub fn number_at(path: impl Into<String>) -> NumberExtractor {
    let path = path.into();
    Arc::new(move |body: &Value| match value_at(body, &path)? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Clone)]
pub struct CursorPagination {
    page_size: usize,
    limit_param: String,
    cursor_param: String,
    initial_cursor: Option<String>,
    items: ItemsExtractor,
    next_cursor: CursorExtractor,
}

impl CursorPagination {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            limit_param: "limit".to_owned(),
            cursor_param: "after".to_owned(),
            initial_cursor: None,
            items: items_at("results"),
            next_cursor: string_at("paging.next.after"),
        }
    }

    pub fn limit_param(mut self, name: impl Into<String>) -> Self {
        self.limit_param = name.into();
        self
    }

    pub fn cursor_param(mut self, name: impl Into<String>) -> Self {
        self.cursor_param = name.into();
        self
    }

    pub fn initial_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.initial_cursor = Some(cursor.into());
        self
    }

    pub fn items(mut self, items: ItemsExtractor) -> Self {
        self.items = items;
        self
    }

    pub fn items_path(self, path: impl Into<String>) -> Self {
        self.items(items_at(path))
    }

    pub fn next_cursor(mut self, next_cursor: CursorExtractor) -> Self {
        self.next_cursor = next_cursor;
        self
    }

    pub fn next_cursor_path(self, path: impl Into<String>) -> Self {
        self.next_cursor(string_at(path))
    }
}

#[derive(Clone)]
pub struct OffsetPagination {
    page_size: usize,
    limit_param: String,
    offset_param: String,
    start_offset: u64,
    items: ItemsExtractor,
}

impl OffsetPagination {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            limit_param: "limit".to_owned(),
            offset_param: "offset".to_owned(),
            start_offset: 0,
            items: items_at("results"),
        }
    }

    pub fn limit_param(mut self, name: impl Into<String>) -> Self {
        self.limit_param = name.into();
        self
    }

    pub fn offset_param(mut self, name: impl Into<String>) -> Self {
        self.offset_param = name.into();
        self
    }

    pub fn start_offset(mut self, start_offset: u64) -> Self {
        self.start_offset = start_offset;
        self
    }

    pub fn items(mut self, items: ItemsExtractor) -> Self {
        self.items = items;
        self
    }

    pub fn items_path(self, path: impl Into<String>) -> Self {
        self.items(items_at(path))
    }
}

#[derive(Clone)]
pub struct PageNumberPagination {
    page_size: usize,
    page_size_param: String,
    page_param: String,
    start_page: u64,
    items: ItemsExtractor,
    last_page: Option<NumberExtractor>,
    next_link: Option<CursorExtractor>,
}

impl PageNumberPagination {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            page_size_param: "per_page".to_owned(),
            page_param: "page".to_owned(),
            start_page: 1,
            items: items_at("results"),
            last_page: None,
            next_link: None,
        }
    }

    pub fn page_size_param(mut self, name: impl Into<String>) -> Self {
        self.page_size_param = name.into();
        self
    }

    pub fn page_param(mut self, name: impl Into<String>) -> Self {
        self.page_param = name.into();
        self
    }

    pub fn start_page(mut self, start_page: u64) -> Self {
        self.start_page = start_page.max(1);
        self
    }

    pub fn items(mut self, items: ItemsExtractor) -> Self {
        self.items = items;
        self
    }

    pub fn items_path(self, path: impl Into<String>) -> Self {
        self.items(items_at(path))
    }

    /// Server-reported last page, e.g. `meta.total_pages`.
    pub fn last_page(mut self, last_page: NumberExtractor) -> Self {
        self.last_page = Some(last_page);
        self
    }

    pub fn last_page_path(self, path: impl Into<String>) -> Self {
        self.last_page(number_at(path))
    }

    /// Link to the next page, e.g. `links.next`. When configured, its absence
    /// ends the sequence.
    pub fn next_link(mut self, next_link: CursorExtractor) -> Self {
        self.next_link = Some(next_link);
        self
    }

    pub fn next_link_path(self, path: impl Into<String>) -> Self {
        self.next_link(string_at(path))
    }
}

#[derive(Clone)]
pub enum PaginationStrategy {
    Cursor(CursorPagination),
    Offset(OffsetPagination),
    PageNumber(PageNumberPagination),
}

impl PaginationStrategy {
    pub fn cursor(page_size: usize) -> Self {
        Self::Cursor(CursorPagination::new(page_size))
    }

    pub fn offset(page_size: usize) -> Self {
        Self::Offset(OffsetPagination::new(page_size))
    }

    pub fn page_number(page_size: usize) -> Self {
        Self::PageNumber(PageNumberPagination::new(page_size))
    }

    fn initial_state(&self) -> PageState {
        match self {
            Self::Cursor(cursor) => PageState::Cursor(cursor.initial_cursor.clone()),
            Self::Offset(offset) => PageState::Offset(offset.start_offset),
            Self::PageNumber(page_number) => PageState::PageNumber(page_number.start_page),
        }
    }
}

impl From<CursorPagination> for PaginationStrategy {
    fn from(strategy: CursorPagination) -> Self {
        Self::Cursor(strategy)
    }
}

impl From<OffsetPagination> for PaginationStrategy {
    fn from(strategy: OffsetPagination) -> Self {
        Self::Offset(strategy)
    }
}

impl From<PageNumberPagination> for PaginationStrategy {
    fn from(strategy: PageNumberPagination) -> Self {
        Self::PageNumber(strategy)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum PageState {
    Cursor(Option<String>),
    Offset(u64),
    PageNumber(u64),
}

/// What the last fetched page says about the sequence.
struct PageStep {
    items: Vec<Value>,
    yield_items: bool,
    next: Option<PageState>,
}

pub struct Paginator {
    client: Client,
    strategy: PaginationStrategy,
    base: RequestSpec,
    state: PageState,
    max_items: Option<usize>,
    cancellation: Option<CancellationToken>,
    yielded_items: usize,
    pages_fetched: usize,
    finished: bool,
}

impl Paginator {
    pub(crate) fn new(client: Client, strategy: PaginationStrategy, base: RequestSpec) -> Self {
        let state = strategy.initial_state();
        Self {
            client,
            strategy,
            base,
            state,
            max_items: None,
            cancellation: None,
            yielded_items: 0,
            pages_fetched: 0,
            finished: false,
        }
    }

    /// Caps the total number of items yielded. The batch that reaches the cap
    /// is truncated and no further request is sent.
    pub fn max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        if max_items == 0 {
            self.finished = true;
        }
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn items_yielded(&self) -> usize {
        self.yielded_items
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn next_page(&mut self) -> Option<ConnectorResult<Vec<Value>>> {
        if self.finished {
            return None;
        }
        if self
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            debug!("pagination cancelled");
            self.finished = true;
            return None;
        }

        let request = self.page_request();
        let result = match &self.cancellation {
            Some(cancellation) => self.client.send_with_cancellation(request, cancellation).await,
            None => self.client.send(request).await,
        };
        self.pages_fetched += 1;

        let response = match result {
            Ok(response) => response,
            Err(error) if error.kind() == ErrorKind::Cancelled && self.is_cancelled() => {
                debug!("pagination cancelled during request");
                self.finished = true;
                return None;
            }
            Err(error) => {
                self.finished = true;
                return Some(Err(error));
            }
        };
        let body = match response.json_value() {
            Ok(body) => body,
            Err(error) => {
                self.finished = true;
                return Some(Err(error));
            }
        };

        let step = self.advance(&body);
        match step.next {
            Some(next) => self.state = next,
            None => self.finished = true,
        }
        if !step.yield_items {
            return None;
        }

        let mut items = step.items;
        if let Some(max_items) = self.max_items {
            let remaining = max_items.saturating_sub(self.yielded_items);
            if items.len() >= remaining {
                items.truncate(remaining);
                self.finished = true;
            }
        }
        self.yielded_items += items.len();
        debug!(
            page = self.pages_fetched,
            items = items.len(),
            finished = self.finished,
            "fetched page"
        );
        Some(Ok(items))
    }

    /// Drains every remaining page. Stops at the first error.
    pub async fn collect_all(mut self) -> ConnectorResult<Vec<Value>> {
        let mut collected = Vec::new();
        while let Some(batch) = self.next_page().await {
            collected.extend(batch?);
        }
        Ok(collected)
    }

    pub fn into_stream(self) -> impl Stream<Item = ConnectorResult<Vec<Value>>> + Send {
        futures_util::stream::unfold(self, |mut paginator| async move {
            let batch = paginator.next_page().await?;
            Some((batch, paginator))
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    fn page_request(&self) -> RequestSpec {
        let mut request = self.base.clone();
        match (&self.strategy, &self.state) {
            (PaginationStrategy::Cursor(cursor), PageState::Cursor(current)) => {
                request.set_query(&cursor.limit_param, Some(cursor.page_size.to_string()));
                request.set_query(&cursor.cursor_param, current.clone());
            }
            (PaginationStrategy::Offset(offset), PageState::Offset(current)) => {
                request.set_query(&offset.limit_param, Some(offset.page_size.to_string()));
                request.set_query(&offset.offset_param, Some(current.to_string()));
            }
            (PaginationStrategy::PageNumber(page_number), PageState::PageNumber(current)) => {
                request.set_query(
                    &page_number.page_size_param,
                    Some(page_number.page_size.to_string()),
                );
                request.set_query(&page_number.page_param, Some(current.to_string()));
            }
            _ => {}
        }
        request
    }

    fn advance(&self, body: &Value) -> PageStep {
        match (&self.strategy, &self.state) {
            (PaginationStrategy::Cursor(cursor), _) => {
                let items = (cursor.items)(body);
                // An empty batch is still handed to the caller, but always ends
                // the sequence.
                let next = (cursor.next_cursor)(body)
                    .filter(|_| !items.is_empty())
                    .map(|next| PageState::Cursor(Some(next)));
                PageStep {
                    items,
                    yield_items: true,
                    next,
                }
            }
            (PaginationStrategy::Offset(offset), PageState::Offset(current)) => {
                let items = (offset.items)(body);
                let received = items.len();
                let next = (received >= offset.page_size)
                    .then(|| PageState::Offset(current.saturating_add(received as u64)));
                PageStep {
                    yield_items: received > 0,
                    items,
                    next,
                }
            }
            (PaginationStrategy::PageNumber(page_number), PageState::PageNumber(current)) => {
                let items = (page_number.items)(body);
                let received = items.len();
                let link_says_more = page_number
                    .next_link
                    .as_ref()
                    .map(|next_link| next_link(body).is_some());
                let bound_says_more = page_number
                    .last_page
                    .as_ref()
                    .and_then(|last_page| last_page(body))
                    .map(|last_page| *current < last_page);
                let has_more = received > 0
                    && match (link_says_more, bound_says_more) {
                        (None, None) => received >= page_number.page_size,
                        (link, bound) => link.unwrap_or(true) && bound.unwrap_or(true),
                    };
                PageStep {
                    yield_items: received > 0,
                    items,
                    next: has_more.then(|| PageState::PageNumber(current.saturating_add(1))),
                }
            }
            _ => PageStep {
                items: Vec::new(),
                yield_items: false,
                next: None,
            },
        }
    }
}
