// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Page-oriented iteration over list operations.

use crate::Result;
use crate::callable::{CallContext, UnaryCallable};
use crate::error::Error;
use futures::Stream;
use futures::stream::StreamExt;
use pin_project::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Teaches the paging layer about a list operation.
///
/// Tokens are opaque to the framework; the descriptor defines the
/// [empty][Self::empty_token] (terminal) token and how tokens move between
/// a response and the next request.
pub trait PagedListDescriptor: Send + Sync + 'static {
    type Request: Clone + Send + Sync + 'static;
    type Response: Send + 'static;
    type Item: Send + Sync + 'static;
    type Token: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static;

    fn empty_token(&self) -> Self::Token;
    fn inject_token(&self, request: &mut Self::Request, token: Self::Token);
    fn extract_next_token(&self, response: &Self::Response) -> Self::Token;
    fn extract_resources(&self, response: &Self::Response) -> Vec<Self::Item>;
    fn inject_page_size(&self, request: &mut Self::Request, size: u32);
    fn extract_page_size(&self, request: &Self::Request) -> Option<u32>;
}

/// A [UnaryCallable] whose responses are pages of a list operation.
pub struct PagedCallable<D: PagedListDescriptor> {
    inner: UnaryCallable<D::Request, D::Response>,
    descriptor: Arc<D>,
}

impl<D: PagedListDescriptor> Clone for PagedCallable<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            descriptor: self.descriptor.clone(),
        }
    }
}

impl<D: PagedListDescriptor> PagedCallable<D> {
    pub(crate) fn new(inner: UnaryCallable<D::Request, D::Response>, descriptor: Arc<D>) -> Self {
        Self { inner, descriptor }
    }

    /// Issues the first call and wraps the response for page iteration.
    pub async fn call(&self, request: D::Request) -> Result<PagedListResponse<D>> {
        self.call_with_context(request, CallContext::default())
            .await
    }

    pub async fn call_with_context(
        &self,
        request: D::Request,
        context: CallContext,
    ) -> Result<PagedListResponse<D>> {
        let fetcher = Fetcher {
            inner: self.inner.clone(),
            context,
        };
        let response = fetcher.fetch(request.clone()).await?;
        let page = Page::from_response(self.descriptor.clone(), fetcher, request, response);
        Ok(PagedListResponse { page })
    }

    pub fn future_call(
        &self,
        request: D::Request,
    ) -> futures::future::BoxFuture<'static, Result<PagedListResponse<D>>> {
        let this = self.clone();
        Box::pin(async move { this.call(request).await })
    }
}

/// Re-invokes the underlying (possibly retrying) callable with the context
/// of the original call.
struct Fetcher<D: PagedListDescriptor> {
    inner: UnaryCallable<D::Request, D::Response>,
    context: CallContext,
}

impl<D: PagedListDescriptor> Clone for Fetcher<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            context: self.context.clone(),
        }
    }
}

impl<D: PagedListDescriptor> Fetcher<D> {
    fn fetch(
        &self,
        request: D::Request,
    ) -> futures::future::BoxFuture<'static, Result<D::Response>> {
        self.inner
            .future_call_with_context(request, self.context.clone())
    }
}

/// One page of results.
pub struct Page<D: PagedListDescriptor> {
    descriptor: Arc<D>,
    fetcher: Fetcher<D>,
    request: D::Request,
    items: Vec<D::Item>,
    next_token: D::Token,
}

impl<D: PagedListDescriptor> Page<D> {
    fn from_response(
        descriptor: Arc<D>,
        fetcher: Fetcher<D>,
        request: D::Request,
        response: D::Response,
    ) -> Self {
        let items = descriptor.extract_resources(&response);
        let next_token = descriptor.extract_next_token(&response);
        Self {
            descriptor,
            fetcher,
            request,
            items,
            next_token,
        }
    }

    pub fn items(&self) -> &[D::Item] {
        &self.items
    }

    pub fn into_items(self) -> Vec<D::Item> {
        self.items
    }

    pub fn has_next_page(&self) -> bool {
        self.next_token != self.descriptor.empty_token()
    }

    /// Fetches the next page, or `None` at the terminal token.
    pub async fn next_page(&self) -> Result<Option<Page<D>>> {
        if !self.has_next_page() {
            return Ok(None);
        }
        let mut request = self.request.clone();
        self.descriptor
            .inject_token(&mut request, self.next_token.clone());
        let response = self.fetcher.fetch(request.clone()).await?;
        Ok(Some(Page::from_response(
            self.descriptor.clone(),
            self.fetcher.clone(),
            request,
            response,
        )))
    }
}

/// The result of calling a [PagedCallable]: the first page, plus lazy and
/// eager expansions over the following pages.
pub struct PagedListResponse<D: PagedListDescriptor> {
    page: Page<D>,
}

impl<D: PagedListDescriptor> PagedListResponse<D> {
    pub fn page(&self) -> &Page<D> {
        &self.page
    }

    pub fn into_page(self) -> Page<D> {
        self.page
    }

    /// A lazy stream over every element of every page. Page N+1 is fetched
    /// only after the items of page N are consumed.
    pub fn all_items(self) -> ItemStream<D> {
        enum Cursor<D: PagedListDescriptor> {
            Start(Page<D>),
            Next(Page<D>),
            Done,
        }
        let pages = futures::stream::unfold(Cursor::Start(self.page), |cursor| async move {
            let advance = |mut page: Page<D>| {
                let items = std::mem::take(&mut page.items);
                let cursor = if page.has_next_page() {
                    Cursor::Next(page)
                } else {
                    Cursor::Done
                };
                (items, cursor)
            };
            match cursor {
                Cursor::Start(page) => {
                    let (items, cursor) = advance(page);
                    Some((Ok(items), cursor))
                }
                Cursor::Next(page) => match page.next_page().await {
                    Err(e) => Some((Err(e), Cursor::Done)),
                    Ok(None) => None,
                    Ok(Some(next)) => {
                        let (items, cursor) = advance(next);
                        Some((Ok(items), cursor))
                    }
                },
                Cursor::Done => None,
            }
        });
        let items = pages.flat_map(|outcome| match outcome {
            Ok(items) => futures::stream::iter(items.into_iter().map(Ok)).boxed(),
            Err(e) => futures::stream::once(async move { Err(e) }).boxed(),
        });
        ItemStream {
            stream: items.boxed(),
        }
    }

    /// Accumulates whole pages into a collection of exactly
    /// `collection_size` elements.
    ///
    /// Fails with a validation error when a page boundary does not align
    /// with the requested size, or when the pages terminate before
    /// `collection_size` elements were collected.
    pub async fn expand_to_fixed_size_collection(
        self,
        collection_size: usize,
    ) -> Result<FixedSizeCollection<D>> {
        FixedSizeCollection::expand(self.page, collection_size, false).await
    }
}

/// A stream over the elements of a paged list operation.
#[pin_project]
pub struct ItemStream<D: PagedListDescriptor> {
    #[pin]
    stream: Pin<Box<dyn Stream<Item = Result<D::Item>> + Send>>,
}

impl<D: PagedListDescriptor> ItemStream<D> {
    pub async fn next(&mut self) -> Option<Result<D::Item>> {
        self.stream.next().await
    }
}

impl<D: PagedListDescriptor> Stream for ItemStream<D> {
    type Item = Result<D::Item>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().stream.poll_next(cx)
    }
}

/// Exactly `collection_size` elements accumulated from whole pages, except
/// possibly the final collection of a sequence, which may be shorter.
pub struct FixedSizeCollection<D: PagedListDescriptor> {
    items: Vec<D::Item>,
    collection_size: usize,
    next: Option<Page<D>>,
}

impl<D: PagedListDescriptor> std::fmt::Debug for FixedSizeCollection<D>
where
    D::Item: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedSizeCollection")
            .field("items", &self.items)
            .field("collection_size", &self.collection_size)
            .field("has_next_collection", &self.next.is_some())
            .finish()
    }
}

impl<D: PagedListDescriptor> FixedSizeCollection<D> {
    async fn expand(
        first: Page<D>,
        collection_size: usize,
        allow_partial: bool,
    ) -> Result<Self> {
        if collection_size == 0 {
            return Err(Error::validation(
                "the collection size must be greater than zero",
            ));
        }
        let mut items = Vec::new();
        let mut page = first;
        loop {
            if items.len() + page.items.len() > collection_size {
                return Err(Error::validation(format!(
                    "the page boundaries do not align with a collection of {collection_size}: \
                     a page would grow the collection to {}",
                    items.len() + page.items.len()
                )));
            }
            items.append(&mut page.items);
            if items.len() == collection_size {
                let next = page.has_next_page().then_some(page);
                return Ok(Self {
                    items,
                    collection_size,
                    next,
                });
            }
            match page.next_page().await? {
                Some(next) => page = next,
                None if allow_partial => {
                    return Ok(Self {
                        items,
                        collection_size,
                        next: None,
                    });
                }
                None => {
                    return Err(Error::validation(format!(
                        "the pages ended after {} elements, fewer than the requested \
                         collection size {collection_size}",
                        items.len()
                    )));
                }
            }
        }
    }

    pub fn items(&self) -> &[D::Item] {
        &self.items
    }

    pub fn into_items(self) -> Vec<D::Item> {
        self.items
    }

    pub fn collection_size(&self) -> usize {
        self.collection_size
    }

    pub fn has_next_collection(&self) -> bool {
        self.next.is_some()
    }

    /// Continues the sequence with the same collection size. The final
    /// collection may hold fewer elements; `None` when no page follows.
    pub async fn next_collection(&self) -> Result<Option<FixedSizeCollection<D>>> {
        let Some(page) = &self.next else {
            return Ok(None);
        };
        let next = match page.next_page().await? {
            Some(next) => next,
            None => return Ok(None),
        };
        let collection = Self::expand(next, self.collection_size, true).await?;
        Ok(if collection.items.is_empty() {
            None
        } else {
            Some(collection)
        })
    }
}
