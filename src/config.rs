use http::HeaderMap;

use crate::fsm::DEFAULT_MAX_TRANSITIONS;
use crate::options::{ExpectContinue, RedirectConfig, RequestOptions};

/// Preset bundles of client defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    /// Follows up to 5 redirects and raises errors for 4xx/5xx.
    #[default]
    Standard,
    /// Follows up to 10 redirects with a Referer and keeps cookies.
    Browser,
    /// Neither follows redirects nor raises status errors.
    Raw,
}

#[derive(Clone, Debug)]
pub struct ProfileDefaults {
    pub redirects: RedirectConfig,
    pub http_errors: bool,
    pub cookies: bool,
    pub expect: ExpectContinue,
    pub max_transitions: usize,
}

impl ClientProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::Standard => ProfileDefaults {
                redirects: RedirectConfig::follow(),
                http_errors: true,
                cookies: false,
                expect: ExpectContinue::Auto,
                max_transitions: DEFAULT_MAX_TRANSITIONS,
            },
            Self::Browser => ProfileDefaults {
                redirects: RedirectConfig::limited(10).referer(true),
                http_errors: true,
                cookies: true,
                expect: ExpectContinue::Auto,
                max_transitions: DEFAULT_MAX_TRANSITIONS,
            },
            Self::Raw => ProfileDefaults {
                redirects: RedirectConfig::disabled(),
                http_errors: false,
                cookies: false,
                expect: ExpectContinue::Never,
                max_transitions: DEFAULT_MAX_TRANSITIONS,
            },
        }
    }
}

/// Settings a built client applies to every request.
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub(crate) base_url: Option<String>,
    pub(crate) default_headers: HeaderMap,
    pub(crate) default_options: RequestOptions,
    pub(crate) max_transitions: usize,
}

impl ClientConfig {
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    pub fn default_options(&self) -> &RequestOptions {
        &self.default_options
    }

    pub fn max_transitions(&self) -> usize {
        self.max_transitions
    }
}

#[cfg(test)]
mod tests {
    use super::ClientProfile;

    #[test]
    fn profiles_resolve_to_distinct_defaults() {
        let standard = ClientProfile::default().defaults();
        assert!(standard.redirects.is_enabled());
        assert_eq!(standard.redirects.max_redirects(), 5);
        assert!(standard.http_errors);
        assert!(!standard.cookies);

        let browser = ClientProfile::Browser.defaults();
        assert_eq!(browser.redirects.max_redirects(), 10);
        assert!(browser.redirects.adds_referer());
        assert!(browser.cookies);

        let raw = ClientProfile::Raw.defaults();
        assert!(!raw.redirects.is_enabled());
        assert!(!raw.http_errors);
    }
}
