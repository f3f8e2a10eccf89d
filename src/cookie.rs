use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::Uri;
use http::header::{HeaderValue, SET_COOKIE};

use crate::request::Request;
use crate::response::Response;
use crate::util::lock_unpoisoned;

/// Narrow cookie-jar contract used by the `cookies` middleware.
pub trait CookieStore: Send + Sync {
    /// `Cookie` header value for `request`, if any cookie applies.
    fn cookie_header(&self, request: &Request) -> Option<HeaderValue>;

    /// Stores the `Set-Cookie` headers of `response`.
    fn extract_cookies(&self, request: &Request, response: &Response);
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    host_only: bool,
    path: String,
    secure: bool,
    expires: Option<SystemTime>,
}

impl StoredCookie {
    fn parse(set_cookie: &str, uri: &Uri, now: SystemTime) -> Option<Self> {
        let mut parts = set_cookie.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let host = uri.host()?.to_ascii_lowercase();

        let mut cookie = Self {
            name: name.to_owned(),
            value: value.trim().trim_matches('"').to_owned(),
            domain: host.clone(),
            host_only: true,
            path: default_path(uri.path()),
            secure: false,
            expires: None,
        };
        let mut max_age = None;

        for attribute in parts {
            let (key, value) = match attribute.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (attribute.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !value.is_empty() => {
                    let domain = value.trim_start_matches('.').to_ascii_lowercase();
                    if !domain_matches(&host, &domain) {
                        return None;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" if value.starts_with('/') => cookie.path = value.to_owned(),
                "secure" => cookie.secure = true,
                "max-age" => max_age = value.parse::<i64>().ok(),
                "expires" => {
                    if let Ok(expires) = httpdate::parse_http_date(value) {
                        cookie.expires = Some(expires);
                    }
                }
                _ => {}
            }
        }

        // Max-Age wins over Expires. An age past the clock's range never
        // expires.
        if let Some(seconds) = max_age {
            cookie.expires = if seconds <= 0 {
                Some(SystemTime::UNIX_EPOCH)
            } else {
                now.checked_add(Duration::from_secs(seconds.unsigned_abs()))
            };
        }
        Some(cookie)
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    fn matches(&self, uri: &Uri, now: SystemTime) -> bool {
        let Some(host) = uri.host() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };
        domain_ok
            && path_matches(uri.path(), &self.path)
            && (!self.secure || uri.scheme_str() == Some("https"))
            && !self.is_expired(now)
    }

    fn same_slot(&self, other: &Self) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    let request_path = if request_path.is_empty() {
        "/"
    } else {
        request_path
    };
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path[cookie_path.len()..].starts_with('/'))
}

fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_owned();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(index) => request_path[..index].to_owned(),
    }
}

/// In-memory cookie jar.
#[derive(Default)]
pub struct CookieJar {
    cookies: Mutex<Vec<StoredCookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jar pre-filled with session cookies valid for `domain` and its
    /// subdomains.
    pub fn from_pairs<I, K, V>(pairs: I, domain: &str) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let domain = domain.trim_start_matches('.').to_ascii_lowercase();
        let cookies = pairs
            .into_iter()
            .map(|(name, value)| StoredCookie {
                name: name.into(),
                value: value.into(),
                domain: domain.clone(),
                host_only: false,
                path: "/".to_owned(),
                secure: false,
                expires: None,
            })
            .collect();
        Self {
            cookies: Mutex::new(cookies),
        }
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.cookies).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.cookies).clear();
    }

    /// Value of the first stored cookie called `name`.
    pub fn get(&self, name: &str) -> Option<String> {
        lock_unpoisoned(&self.cookies)
            .iter()
            .find(|cookie| cookie.name == name)
            .map(|cookie| cookie.value.clone())
    }

    /// Stores one `Set-Cookie` line as if received from `uri`.
    pub fn set_cookie(&self, set_cookie: &str, uri: &Uri) -> bool {
        let now = SystemTime::now();
        let Some(cookie) = StoredCookie::parse(set_cookie, uri, now) else {
            return false;
        };
        let mut cookies = lock_unpoisoned(&self.cookies);
        cookies.retain(|stored| !stored.same_slot(&cookie));
        if !cookie.is_expired(now) {
            cookies.push(cookie);
        }
        true
    }
}

impl CookieStore for CookieJar {
    fn cookie_header(&self, request: &Request) -> Option<HeaderValue> {
        let now = SystemTime::now();
        let mut cookies = lock_unpoisoned(&self.cookies);
        cookies.retain(|cookie| !cookie.is_expired(now));
        let mut matching = cookies
            .iter()
            .filter(|cookie| cookie.matches(request.uri(), now))
            .collect::<Vec<_>>();
        if matching.is_empty() {
            return None;
        }
        // Longer paths first.
        matching.sort_by(|left, right| right.path.len().cmp(&left.path.len()));
        let header = matching
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&header).ok()
    }

    fn extract_cookies(&self, request: &Request, response: &Response) {
        for value in response.headers().get_all(SET_COOKIE) {
            if let Ok(line) = value.to_str() {
                self.set_cookie(line, request.uri());
            }
        }
    }
}

impl fmt::Debug for CookieJar {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CookieJar")
            .field("cookies", &self.len())
            .finish()
    }
}
