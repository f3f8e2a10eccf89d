use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::Uri;

use crate::client::Client;
use crate::cookie::CookieStore;
use crate::request::Request;
use crate::response::Response;

pub type RedirectCallback = Arc<dyn Fn(&Request, &Response, &Uri) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

const DEFAULT_MAX_REDIRECTS: usize = 5;
const EXPECT_CONTINUE_THRESHOLD: usize = 1024 * 1024;

/// How redirects are followed for one call.
#[derive(Clone)]
pub struct RedirectConfig {
    enabled: bool,
    max: usize,
    protocols: Vec<String>,
    strict: bool,
    referer: bool,
    track_redirects: bool,
    on_redirect: Option<RedirectCallback>,
}

impl RedirectConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::follow()
        }
    }

    pub fn follow() -> Self {
        Self {
            enabled: true,
            max: DEFAULT_MAX_REDIRECTS,
            protocols: vec!["http".to_owned(), "https".to_owned()],
            strict: false,
            referer: false,
            track_redirects: false,
            on_redirect: None,
        }
    }

    pub fn limited(max: usize) -> Self {
        Self::follow().max(max)
    }

    pub fn max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols
            .into_iter()
            .map(|protocol| protocol.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Strict mode keeps the method and body on 301/302, as RFC 7231 reads.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn referer(mut self, referer: bool) -> Self {
        self.referer = referer;
        self
    }

    pub fn track_redirects(mut self, track_redirects: bool) -> Self {
        self.track_redirects = track_redirects;
        self
    }

    pub fn on_redirect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Request, &Response, &Uri) + Send + Sync + 'static,
    {
        self.on_redirect = Some(Arc::new(callback));
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_redirects(&self) -> usize {
        self.max
    }

    pub fn allowed_protocols(&self) -> &[String] {
        &self.protocols
    }

    pub fn allows_protocol(&self, scheme: &str) -> bool {
        self.protocols
            .iter()
            .any(|protocol| protocol.eq_ignore_ascii_case(scheme))
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn adds_referer(&self) -> bool {
        self.referer
    }

    pub fn tracks_redirects(&self) -> bool {
        self.track_redirects
    }

    pub(crate) fn redirect_callback(&self) -> Option<&RedirectCallback> {
        self.on_redirect.as_ref()
    }
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self::follow()
    }
}

impl From<bool> for RedirectConfig {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::follow()
        } else {
            Self::disabled()
        }
    }
}

impl fmt::Debug for RedirectConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RedirectConfig")
            .field("enabled", &self.enabled)
            .field("max", &self.max)
            .field("protocols", &self.protocols)
            .field("strict", &self.strict)
            .field("referer", &self.referer)
            .field("track_redirects", &self.track_redirects)
            .field("on_redirect", &self.on_redirect.is_some())
            .finish()
    }
}

/// When `prepare_body` adds `Expect: 100-Continue`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExpectContinue {
    /// Bodies of 1 MiB or more on HTTP/1.1.
    #[default]
    Auto,
    Never,
    Always,
    Threshold(usize),
}

impl ExpectContinue {
    pub(crate) fn applies(self, body_len: usize) -> bool {
        if body_len == 0 {
            return false;
        }
        match self {
            Self::Auto => body_len >= EXPECT_CONTINUE_THRESHOLD,
            Self::Never => false,
            Self::Always => true,
            Self::Threshold(threshold) => body_len >= threshold,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub download_total: u64,
    pub downloaded: u64,
    pub upload_total: u64,
    pub uploaded: u64,
}

/// Redirect bookkeeping carried across hops of one logical send.
#[derive(Clone, Debug, Default)]
pub(crate) struct RedirectState {
    pub(crate) count: usize,
    pub(crate) scheme: Option<String>,
    pub(crate) origin: Option<Request>,
    pub(crate) history: Vec<String>,
    pub(crate) status_history: Vec<u16>,
}

/// The per-call options bag. Unlike [`Request::config`], these belong to a
/// single trip through the handler stack.
#[derive(Clone)]
pub struct RequestOptions {
    pub allow_redirects: RedirectConfig,
    pub http_errors: bool,
    pub cookies: Option<Arc<dyn CookieStore>>,
    pub expect: ExpectContinue,
    pub future: bool,
    pub(crate) retries: usize,
    pub(crate) delay: Option<Duration>,
    pub(crate) redirect: RedirectState,
    pub(crate) client: Option<Client>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_redirects(mut self, redirects: impl Into<RedirectConfig>) -> Self {
        self.allow_redirects = redirects.into();
        self
    }

    pub fn http_errors(mut self, http_errors: bool) -> Self {
        self.http_errors = http_errors;
        self
    }

    pub fn cookies(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookies = Some(store);
        self
    }

    pub fn expect(mut self, expect: ExpectContinue) -> Self {
        self.expect = expect;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Retries already spent by the retry middleware for this call.
    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Wait applied by the transport bridge before the next send.
    pub fn pending_delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn redirect_count(&self) -> usize {
        self.redirect.count
    }

    pub fn client(&self) -> Option<&Client> {
        self.client.as_ref()
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            allow_redirects: RedirectConfig::follow(),
            http_errors: true,
            cookies: None,
            expect: ExpectContinue::Auto,
            future: false,
            retries: 0,
            delay: None,
            redirect: RedirectState::default(),
            client: None,
        }
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RequestOptions")
            .field("allow_redirects", &self.allow_redirects)
            .field("http_errors", &self.http_errors)
            .field("cookies", &self.cookies.is_some())
            .field("expect", &self.expect)
            .field("future", &self.future)
            .field("retries", &self.retries)
            .field("delay", &self.delay)
            .field("redirect_count", &self.redirect.count)
            .finish()
    }
}
