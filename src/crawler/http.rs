//! HTTP-flavored pipeline stages
//!
//! The canonical stages for raw-HTTP crawling: apply session state,
//! perform the request with the navigation deadline and a MIME gate,
//! and prepare the body for the handler. Also provides
//! `CrawlingContext::send_request` for ad-hoc fetches from handlers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::context::{ContextPipeline, CrawlingContext, HttpResponse, Stage};
use crate::errors::CrawlError;
use crate::request::{HttpMethod, Request, RequestState};

/// Hook run inside the navigation stage, before or after the request
pub type NavigationHookFn =
    Arc<dyn Fn(Arc<CrawlingContext>) -> BoxFuture<'static, Result<(), CrawlError>> + Send + Sync>;

/// MIME types accepted without any `additional_mime_types`
const DEFAULT_ALLOWED_MIME_TYPES: [&str; 2] = ["text/html", "application/xhtml+xml"];

/// Response statuses treated as anti-bot blocking
const BLOCKED_STATUS_CODES: [u16; 3] = [401, 403, 429];

/// Options for the HTTP stage set.
#[derive(Debug, Clone, Default)]
pub struct HttpPipelineOptions {
    /// Unioned with the default MIME set; a response outside the union
    /// aborts the download
    pub additional_mime_types: Vec<String>,
}

fn allowed_mime_set(options: &HttpPipelineOptions) -> HashSet<String> {
    DEFAULT_ALLOWED_MIME_TYPES
        .iter()
        .map(|mime| (*mime).to_string())
        .chain(
            options
                .additional_mime_types
                .iter()
                .map(|mime| mime.to_ascii_lowercase()),
        )
        .collect()
}

/// The `type/subtype` part of a Content-Type header, lowercased
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

/// Execute one HTTP exchange and buffer the response.
///
/// `operation` labels timeout errors so the engine can tell a real
/// navigation timeout (which marks the session bad) apart from an
/// ad-hoc `send_request` fetch.
async fn execute(
    client: &reqwest::Client,
    request: &Request,
    extra_headers: &HashMap<String, String>,
    timeout: Duration,
    operation: &'static str,
) -> Result<HttpResponse, CrawlError> {
    let mut builder = client.request(to_reqwest_method(request.method), request.url.as_str());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    for (name, value) in extra_headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(payload) = &request.payload {
        builder = builder.body(payload.clone());
    }

    let exchange = async {
        let response = builder
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e, operation))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e, operation))?
            .to_vec();
        Ok(HttpResponse { status, headers, body, final_url })
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(CrawlError::Timeout { operation, timeout }),
    }
}

fn classify_reqwest_error(error: &reqwest::Error, operation: &'static str) -> CrawlError {
    if error.is_timeout() {
        CrawlError::Timeout {
            operation,
            timeout: Duration::ZERO,
        }
    } else {
        CrawlError::Retryable(anyhow::anyhow!("request failed: {error}"))
    }
}

/// Build the canonical HTTP stage pipeline.
pub(crate) fn build_http_pipeline(
    pre_navigation_hooks: Vec<NavigationHookFn>,
    post_navigation_hooks: Vec<NavigationHookFn>,
    options: &HttpPipelineOptions,
    navigation_timeout: Duration,
) -> ContextPipeline {
    let allowed = Arc::new(allowed_mime_set(options));

    let prepare = Stage::new(
        "prepare_request",
        Arc::new(|ctx: Arc<CrawlingContext>| {
            Box::pin(async move {
                if let Some(session) = &ctx.session
                    && let Some(cookie_header) = session.cookie_header_for(&ctx.url())
                {
                    ctx.with_request(|r| {
                        r.headers
                            .entry("cookie".to_string())
                            .or_insert(cookie_header);
                    });
                }
                Ok(())
            })
        }),
    );

    let perform_allowed = Arc::clone(&allowed);
    let perform = Stage::new(
        "perform_http_request",
        Arc::new(move |ctx: Arc<CrawlingContext>| {
            let pre_hooks = pre_navigation_hooks.clone();
            let post_hooks = post_navigation_hooks.clone();
            let allowed = Arc::clone(&perform_allowed);
            Box::pin(async move {
                let request = ctx.request();
                if request.skip_navigation {
                    log::debug!("Skipping navigation for {}", request.url);
                    return Ok(());
                }

                for hook in &pre_hooks {
                    if ctx.cancellation.is_cancelled() {
                        return Err(CrawlError::Retryable(anyhow::anyhow!(
                            "request cancelled during pre-navigation hooks"
                        )));
                    }
                    hook(Arc::clone(&ctx)).await?;
                }

                let client = ctx.http_client().ok_or_else(|| {
                    CrawlError::non_retryable("no HTTP client attached to this crawl")
                })?;
                let request = ctx.request();
                let response = execute(
                    &client,
                    &request,
                    &HashMap::new(),
                    navigation_timeout,
                    "navigation",
                )
                .await?;

                if BLOCKED_STATUS_CODES.contains(&response.status) {
                    return Err(CrawlError::session(format!(
                        "blocked with status {} at {}",
                        response.status, request.url
                    )));
                }
                if response.status >= 500 {
                    return Err(CrawlError::Retryable(anyhow::anyhow!(
                        "server error {} at {}",
                        response.status,
                        request.url
                    )));
                }

                // a missing Content-Type is outside the allowed set too
                let content_type = response.header("content-type").unwrap_or("");
                let mime = essence(content_type);
                if !allowed.contains(&mime) {
                    return Err(CrawlError::non_retryable(format!(
                        "content type {mime:?} is not allowed at {}",
                        request.url
                    )));
                }

                if let Some(session) = &ctx.session {
                    let set_cookies: Vec<String> = response
                        .headers
                        .iter()
                        .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
                        .map(|(_, value)| value.clone())
                        .collect();
                    if !set_cookies.is_empty() {
                        session.store_response_cookies(&response.final_url, &set_cookies);
                    }
                }

                ctx.with_request(|r| {
                    r.loaded_url = Some(response.final_url.clone());
                    r.state = RequestState::AfterNav;
                });
                ctx.set_response(response);

                for hook in &post_hooks {
                    if ctx.cancellation.is_cancelled() {
                        return Err(CrawlError::Retryable(anyhow::anyhow!(
                            "request cancelled during post-navigation hooks"
                        )));
                    }
                    hook(Arc::clone(&ctx)).await?;
                }
                Ok(())
            })
        }),
    );

    let parse = Stage::new(
        "parse_body",
        Arc::new(move |ctx: Arc<CrawlingContext>| {
            Box::pin(async move {
                let Some(response) = ctx.response() else {
                    return Ok(());
                };
                let mime = essence(response.header("content-type").unwrap_or(""));
                if mime == "application/json"
                    && response.parse_json::<serde_json::Value>().is_err()
                {
                    return Err(CrawlError::non_retryable(format!(
                        "response body at {} is not valid JSON",
                        response.final_url
                    )));
                }
                log::trace!(
                    "Buffered {} byte(s) of {mime} from {}",
                    response.body.len(),
                    response.final_url
                );
                Ok(())
            })
        }),
    );

    ContextPipeline::new()
        .add_stage(prepare)
        .add_stage(perform)
        .add_stage(parse)
}

/// Overrides for `CrawlingContext::send_request`.
#[derive(Debug, Clone, Default)]
pub struct SendRequestOptions {
    /// Target URL; defaults to the context's request URL
    pub url: Option<String>,
    pub method: Option<HttpMethod>,
    pub headers: HashMap<String, String>,
}

impl CrawlingContext {
    /// Perform an ad-hoc HTTP request sharing this context's session
    /// cookies. The response is returned directly and not stored on the
    /// context; no MIME gating is applied.
    pub async fn send_request(
        &self,
        options: SendRequestOptions,
    ) -> Result<HttpResponse, CrawlError> {
        let client = self
            .http_client()
            .ok_or_else(|| CrawlError::non_retryable("no HTTP client attached to this crawl"))?;

        let mut request = self.request();
        if let Some(url) = options.url {
            request.url = url;
        }
        if let Some(method) = options.method {
            request.method = method;
        }

        let mut extra_headers = options.headers;
        if let Some(session) = &self.session
            && let Some(cookie_header) = session.cookie_header_for(&request.url)
        {
            extra_headers
                .entry("cookie".to_string())
                .or_insert(cookie_header);
        }

        let response = execute(
            &client,
            &request,
            &extra_headers,
            Duration::from_secs(30),
            "send_request",
        )
        .await?;

        if let Some(session) = &self.session {
            let set_cookies: Vec<String> = response
                .headers
                .iter()
                .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
                .map(|(_, value)| value.clone())
                .collect();
            if !set_cookies.is_empty() {
                session.store_response_cookies(&response.final_url, &set_cookies);
            }
        }

        Ok(response)
    }
}
