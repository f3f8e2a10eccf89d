use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::SystemTime;

use http::{HeaderMap, Version};

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

/// Turns a request, its response and/or its error into one log line.
///
/// Templates substitute `{name}` placeholders:
///
/// - `{request}`, `{response}`: full messages
/// - `{req_headers}`, `{res_headers}`: start line plus headers
/// - `{req_body}`, `{res_body}`
/// - `{ts}`, `{date_iso_8601}`: current time as an HTTP date
/// - `{method}`, `{uri}` (alias `{url}`), `{target}`, `{host}`
/// - `{version}` (alias `{req_version}`), `{res_version}`
/// - `{code}`, `{phrase}`, `{error}`
/// - `{req_header_<name>}`, `{res_header_<name>}`
///
/// Unknown names expand to nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageFormatter {
    template: String,
}

impl MessageFormatter {
    /// Common-log style line.
    pub const CLF: &'static str = "{host} {req_header_User-Agent} - [{ts}] \"{method} {target} HTTP/{version}\" {code} {res_header_Content-Length}";
    pub const DEBUG: &'static str = ">>>>>>>>\n{request}\n<<<<<<<<\n{response}\n--------\n{error}";
    pub const SHORT: &'static str = "[{ts}] \"{method} {target} HTTP/{version}\" {code}";

    pub fn new(template: impl Into<String>) -> Self {
        let template = template.into();
        if template.is_empty() {
            return Self::default();
        }
        Self { template }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn format(
        &self,
        request: &Request,
        response: Option<&Response>,
        error: Option<&Error>,
    ) -> String {
        let mut cache = HashMap::<&str, String>::new();
        let mut output = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(open) = rest.find('{') {
            output.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                output.push_str(&rest[open..]);
                return output;
            };
            let name = after[..close].trim();
            if is_placeholder_name(name) {
                let value = cache
                    .entry(name)
                    .or_insert_with(|| expand(name, request, response, error));
                output.push_str(value);
            } else {
                output.push_str(&rest[open..open + close + 2]);
            }
            rest = &after[close + 1..];
        }
        output.push_str(rest);
        output
    }
}

impl Default for MessageFormatter {
    fn default() -> Self {
        Self {
            template: Self::CLF.to_owned(),
        }
    }
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.'))
}

fn expand(
    name: &str,
    request: &Request,
    response: Option<&Response>,
    error: Option<&Error>,
) -> String {
    match name {
        "request" => format!(
            "{}\r\n\r\n{}",
            request_head(request),
            String::from_utf8_lossy(request.body())
        ),
        "response" => response
            .map(|response| {
                format!("{}\r\n\r\n{}", response_head(response), response.text_lossy())
            })
            .unwrap_or_default(),
        "req_headers" => request_head(request),
        "res_headers" => response.map(response_head).unwrap_or_default(),
        "req_body" => String::from_utf8_lossy(request.body()).into_owned(),
        "res_body" => response.map(Response::text_lossy).unwrap_or_default(),
        "ts" | "date_iso_8601" => httpdate::fmt_http_date(SystemTime::now()),
        "method" => request.method().to_string(),
        "uri" | "url" => request.url(),
        "target" => request_target(request),
        "version" | "req_version" => version_str(request.version()).to_owned(),
        "res_version" => response
            .map(|response| version_str(response.version()).to_owned())
            .unwrap_or_default(),
        "host" => request
            .header_str("host")
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| request.host().to_owned()),
        "code" => response
            .map(|response| response.status_code().to_string())
            .unwrap_or_else(|| "NULL".to_owned()),
        "phrase" => response
            .map(|response| response.reason_phrase().to_owned())
            .unwrap_or_else(|| "NULL".to_owned()),
        "error" => error.map(ToString::to_string).unwrap_or_else(|| "NULL".to_owned()),
        other => {
            if let Some(header) = other.strip_prefix("req_header_") {
                joined_header(request.headers(), header)
            } else if let Some(header) = other.strip_prefix("res_header_") {
                response
                    .map(|response| joined_header(response.headers(), header))
                    .unwrap_or_default()
            } else {
                String::new()
            }
        }
    }
}

fn request_target(request: &Request) -> String {
    match request.query() {
        Some(query) => format!("{}?{query}", request.path()),
        None => request.path().to_owned(),
    }
}

fn request_head(request: &Request) -> String {
    let mut head = format!(
        "{} {} HTTP/{}",
        request.method(),
        request_target(request),
        version_str(request.version())
    );
    push_headers(&mut head, request.headers());
    head
}

fn response_head(response: &Response) -> String {
    let mut head = format!(
        "HTTP/{} {} {}",
        version_str(response.version()),
        response.status_code(),
        response.reason_phrase()
    );
    push_headers(&mut head, response.headers());
    head
}

fn push_headers(head: &mut String, headers: &HeaderMap) {
    for (name, value) in headers {
        let _ = write!(
            head,
            "\r\n{}: {}",
            name,
            String::from_utf8_lossy(value.as_bytes())
        );
    }
}

fn joined_header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get_all(name)
        .iter()
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    }
}
