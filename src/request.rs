use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{Extensions, HeaderMap, Method, Uri, Version};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::client::Client;
use crate::error::Error;
use crate::handler::ResponseFuture;
use crate::options::{RedirectConfig, RequestOptions};
use crate::response::Response;
use crate::util::{append_query_pairs, parse_header_name, parse_header_value};

/// A logical HTTP request.
///
/// `config` is the persistent per-request bag: it travels with the request
/// across redirects and retries, unlike [`RequestOptions`] which belong to a
/// single call through the handler stack.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    version: Version,
    config: Extensions,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            version: Version::HTTP_11,
            config: Extensions::new(),
        }
    }

    pub fn try_new(method: Method, uri: &str) -> crate::Result<Self> {
        let parsed = uri.parse::<Uri>().map_err(|_| Error::InvalidUri {
            uri: uri.to_owned(),
        })?;
        if parsed.scheme().is_none() || parsed.host().is_none() {
            return Err(Error::InvalidUri {
                uri: uri.to_owned(),
            });
        }
        Ok(Self::new(method, parsed))
    }

    pub fn get(uri: &str) -> crate::Result<Self> {
        Self::try_new(Method::GET, uri)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn set_uri(&mut self, uri: Uri) {
        self.uri = uri;
    }

    pub fn url(&self) -> String {
        self.uri.to_string()
    }

    pub fn scheme(&self) -> &str {
        self.uri.scheme_str().unwrap_or_default()
    }

    pub fn host(&self) -> &str {
        self.uri.host().unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn config(&self) -> &Extensions {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Extensions {
        &mut self.config
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_with_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.with_header(name, value))
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }
}

pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: Method,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Bytes>,
    version: Option<Version>,
    options: RequestOptions,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, path: String) -> Self {
        Self {
            client,
            method,
            path,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            version: None,
            options: client.default_options(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query<T>(mut self, params: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params).map_err(|source| {
            Error::SerializeQuery {
                source: source.into(),
            }
        })?;
        self.query_pairs.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::Serialize {
            source: source.into(),
        })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn form<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload).map_err(|source| {
            Error::SerializeForm {
                source: source.into(),
            }
        })?;
        Ok(self.body(encoded).header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        ))
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn allow_redirects(mut self, redirects: RedirectConfig) -> Self {
        self.options.allow_redirects = redirects;
        self
    }

    pub fn http_errors(mut self, http_errors: bool) -> Self {
        self.options.http_errors = http_errors;
        self
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> crate::Result<(Request, RequestOptions)> {
        let path = append_query_pairs(&self.path, &self.query_pairs);
        let mut request = self.client.create_request(self.method, &path)?;
        for (name, value) in &self.headers {
            request.set_header(name.clone(), value.clone());
        }
        if let Some(body) = self.body {
            request.set_body(body);
        }
        if let Some(version) = self.version {
            request.set_version(version);
        }
        Ok((request, self.options))
    }

    pub async fn send(self) -> crate::Result<Response> {
        let client = self.client;
        let (request, options) = self.build()?;
        client.send_with(request, options).await
    }

    /// Builds the request now and hands back the in-flight future. Build
    /// failures such as an unparsable URL are returned before any I/O.
    pub fn send_async(self) -> crate::Result<ResponseFuture> {
        let client = self.client.clone();
        let (request, mut options) = self.build()?;
        options.future = true;
        Ok(client.send_async_with(request, options))
    }

    pub async fn send_json<T>(self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self.send().await?;
        response.json()
    }
}
