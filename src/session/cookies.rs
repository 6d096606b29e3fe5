//! Serializable cookie state carried by a session
//!
//! A deliberately small jar: enough to round-trip `Set-Cookie` headers
//! between responses and subsequent requests of the same session, and to
//! survive session-pool persistence. No public-suffix logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// One stored cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

fn default_path() -> String {
    "/".to_string()
}

impl Cookie {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    fn matches(&self, host: &str, path: &str, now: DateTime<Utc>) -> bool {
        if self.is_expired(now) {
            return false;
        }
        let domain_ok =
            host == self.domain || host.ends_with(&format!(".{}", self.domain));
        let path_ok = path.starts_with(&self.path);
        domain_ok && path_ok
    }
}

/// Domain/path-scoped cookie storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    /// Insert or replace a cookie identified by (name, domain, path).
    pub fn set(&mut self, cookie: Cookie) {
        self.cookies.retain(|existing| {
            !(existing.name == cookie.name
                && existing.domain == cookie.domain
                && existing.path == cookie.path)
        });
        self.cookies.push(cookie);
    }

    /// Absorb `Set-Cookie` headers from a response for `url`.
    ///
    /// Unparseable headers are skipped with a debug log; a malformed
    /// cookie must never fail a request.
    pub fn store_from_response(&mut self, url: &str, set_cookie_headers: &[String]) {
        let Ok(parsed) = Url::parse(url) else {
            log::debug!("Ignoring cookies for unparseable URL {url}");
            return;
        };
        let Some(host) = parsed.host_str() else {
            return;
        };

        for header in set_cookie_headers {
            match parse_set_cookie(header, host) {
                Some(cookie) => self.set(cookie),
                None => log::debug!("Skipping unparseable Set-Cookie header: {header}"),
            }
        }
    }

    /// Render the `Cookie` request header for `url`, if any cookie applies.
    #[must_use]
    pub fn header_for(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let path = parsed.path();
        let now = Utc::now();

        let rendered: Vec<String> = self
            .cookies
            .iter()
            .filter(|cookie| cookie.matches(host, path, now))
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect();

        if rendered.is_empty() {
            None
        } else {
            Some(rendered.join("; "))
        }
    }
}

/// Parse one `Set-Cookie` header value.
///
/// Understands `Domain`, `Path`, `Expires` and `Max-Age`; everything else
/// is ignored. Returns `None` when the name/value pair is missing.
fn parse_set_cookie(header: &str, default_host: &str) -> Option<Cookie> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = Cookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        domain: default_host.to_string(),
        path: default_path(),
        expires: None,
    };

    for attribute in parts {
        let attribute = attribute.trim();
        let (key, val) = match attribute.split_once('=') {
            Some((key, val)) => (key.trim().to_ascii_lowercase(), val.trim()),
            None => (attribute.to_ascii_lowercase(), ""),
        };
        match key.as_str() {
            "domain" => {
                cookie.domain = val.trim_start_matches('.').to_ascii_lowercase();
            }
            "path" if !val.is_empty() => {
                cookie.path = val.to_string();
            }
            "max-age" => {
                if let Ok(secs) = val.parse::<i64>() {
                    cookie.expires = Some(Utc::now() + chrono::Duration::seconds(secs));
                }
            }
            "expires" => {
                if let Ok(when) = DateTime::parse_from_rfc2822(val) {
                    cookie.expires = Some(when.with_timezone(&Utc));
                }
            }
            _ => {}
        }
    }

    Some(cookie)
}
