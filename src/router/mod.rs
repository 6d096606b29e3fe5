//! Label-based request routing
//!
//! A `Router` dispatches contexts to handlers by `request.label()`. It
//! is a plain registry: build it with `add_handler` /
//! `add_default_handler`, then pass `into_handler()` to the crawler as
//! its request handler.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::CrawlingContext;
use crate::errors::CrawlError;

/// Handler signature shared by routes and the crawler itself.
pub type RequestHandlerFn =
    Arc<dyn Fn(Arc<CrawlingContext>) -> BoxFuture<'static, Result<(), CrawlError>> + Send + Sync>;

/// Label-dispatched handler registry.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, RequestHandlerFn>,
    default_handler: Option<RequestHandlerFn>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one label. Replaces any previous handler
    /// for the same label.
    pub fn add_handler(&mut self, label: impl Into<String>, handler: RequestHandlerFn) {
        let label = label.into();
        if self.routes.insert(label.clone(), handler).is_some() {
            log::warn!("Route handler for label {label:?} was replaced");
        }
    }

    /// Register the handler used for unlabeled requests and labels
    /// without their own route
    pub fn add_default_handler(&mut self, handler: RequestHandlerFn) {
        if self.default_handler.replace(handler).is_some() {
            log::warn!("Default route handler was replaced");
        }
    }

    #[must_use]
    pub fn has_default_handler(&self) -> bool {
        self.default_handler.is_some()
    }

    /// Dispatch one context to the matching route.
    pub async fn invoke(&self, ctx: Arc<CrawlingContext>) -> Result<(), CrawlError> {
        let label = ctx.label();
        let handler = match &label {
            Some(label) => self.routes.get(label).or(self.default_handler.as_ref()),
            None => self.default_handler.as_ref(),
        };
        match handler {
            Some(handler) => handler(ctx).await,
            None => Err(CrawlError::MissingRoute { label }),
        }
    }

    /// Adapt this router into a crawler request handler.
    #[must_use]
    pub fn into_handler(self) -> RequestHandlerFn {
        let router = Arc::new(self);
        Arc::new(move |ctx| {
            let router = Arc::clone(&router);
            Box::pin(async move { router.invoke(ctx).await })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use tokio_util::sync::CancellationToken;

    fn context_with_label(label: Option<&str>) -> Arc<CrawlingContext> {
        let mut builder = Request::builder("https://example.com/");
        if let Some(label) = label {
            builder = builder.label(label);
        }
        Arc::new(CrawlingContext::new(
            builder.build().expect("valid request"),
            None,
            None,
            None,
            None,
            CancellationToken::new(),
        ))
    }

    fn tagging_handler(
        tag: &'static str,
        seen: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    ) -> RequestHandlerFn {
        Arc::new(move |_ctx| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.lock().push(tag);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_dispatch_by_label() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut router = Router::new();
        router.add_handler("DETAIL", tagging_handler("detail", Arc::clone(&seen)));
        router.add_default_handler(tagging_handler("default", Arc::clone(&seen)));

        router
            .invoke(context_with_label(Some("DETAIL")))
            .await
            .expect("route matches");
        router
            .invoke(context_with_label(None))
            .await
            .expect("default matches");
        router
            .invoke(context_with_label(Some("UNKNOWN")))
            .await
            .expect("unknown label falls back to default");

        assert_eq!(*seen.lock(), vec!["detail", "default", "default"]);
    }

    #[tokio::test]
    async fn test_missing_route_without_default() {
        let router = Router::new();
        let result = router.invoke(context_with_label(Some("ORPHAN"))).await;
        assert!(matches!(
            result,
            Err(CrawlError::MissingRoute { label: Some(label) }) if label == "ORPHAN"
        ));
    }

    #[tokio::test]
    async fn test_into_handler_adapts() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut router = Router::new();
        router.add_default_handler(tagging_handler("default", Arc::clone(&seen)));

        let handler = router.into_handler();
        handler(context_with_label(None)).await.expect("handler runs");
        assert_eq!(*seen.lock(), vec!["default"]);
    }
}
