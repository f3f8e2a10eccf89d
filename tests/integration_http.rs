#![cfg(feature = "hyper-transport")]

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqflow::prelude::{Client, Error, ErrorCode, RedirectConfig, RetryPolicy};
use reqflow::{HyperTransport, IDEMPOTENCY_KEY_HEADER, Pool, PoolConfig, TransportErrorKind};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
}

impl MockResponse {
    fn new(status: u16, headers: Vec<(&str, &str)>, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
            body: body.into().into_bytes(),
            delay: Duration::ZERO,
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

struct MockServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let served_clone = Arc::clone(&served);
        let captured_clone = Arc::clone(&captured);

        let join = thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            let mut response_index = 0;

            while response_index < responses.len() && std::time::Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        if let Ok(request) = read_request(&mut stream) {
                            captured_clone
                                .lock()
                                .expect("lock captured requests")
                                .push(request);
                        }

                        served_clone.fetch_add(1, Ordering::SeqCst);
                        let response = &responses[response_index];
                        response_index += 1;

                        if !response.delay.is_zero() {
                            thread::sleep(response.delay);
                        }

                        let _ = write_response(&mut stream, response);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            captured,
            join: Some(join),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if find_header_end(&raw).is_some() {
            break;
        }
    }

    let header_end = find_header_end(&raw).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "malformed request without header terminator",
        )
    })?;

    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing request line")
    })?;
    let mut request_line_parts = request_line.split_whitespace();
    let method = request_line_parts.next().unwrap_or_default().to_owned();
    let path = request_line_parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let body = &response.body;
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        body.len()
    );
    for (name, value) in &response.headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        302 => "Found",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy::standard()
        .max_attempts(3)
        .base_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(5))
        .jitter_ratio(0.0)
}

#[derive(Debug, Deserialize)]
struct Item {
    id: u32,
    name: String,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_json_resolves_base_url_and_sends_default_headers() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        vec![("Content-Type", "application/json")],
        r#"{"id":7,"name":"widget"}"#,
    )]);
    let client = Client::builder()
        .base_url(server.url("/v1"))
        .try_default_header("User-Agent", "reqflow-it")
        .expect("default header")
        .try_build()
        .expect("client should build");

    let item: Item = client
        .get("/items/7")
        .send_json()
        .await
        .expect("request should succeed");

    assert_eq!(item.id, 7);
    assert_eq!(item.name, "widget");
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/v1/items/7");
    assert_eq!(
        requests[0].headers.get("user-agent").map(String::as_str),
        Some("reqflow-it")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn not_found_from_server_raises_client_status() {
    let server = MockServer::start(vec![MockResponse::new(404, vec![], "gone")]);
    let client = Client::builder().try_build().expect("client should build");

    let error = client
        .get(server.url("/missing"))
        .send()
        .await
        .expect_err("404 should raise");

    assert_eq!(error.code(), ErrorCode::ClientStatus);
    assert_eq!(error.status(), Some(404));
    assert_eq!(
        error.response().map(|response| response.body().as_ref().to_vec()),
        Some(b"gone".to_vec())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retries_post_with_idempotency_key_then_succeeds() {
    let server = MockServer::start(vec![
        MockResponse::new(503, vec![], "busy"),
        MockResponse::new(201, vec![], "created"),
    ]);
    let client = Client::builder()
        .retry_policy(fast_retries())
        .try_build()
        .expect("client should build");

    let response = client
        .post(server.url("/orders"))
        .try_header(IDEMPOTENCY_KEY_HEADER, "order-1")
        .expect("idempotency header")
        .body(r#"{"sku":"a"}"#)
        .send()
        .await
        .expect("second attempt succeeds");

    assert_eq!(response.status_code(), 201);
    assert_eq!(server.served_count(), 2);
    for request in server.requests() {
        assert_eq!(request.method, "POST");
        assert_eq!(request.body, br#"{"sku":"a"}"#);
        assert_eq!(
            request.headers.get(IDEMPOTENCY_KEY_HEADER).map(String::as_str),
            Some("order-1")
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_without_idempotency_key_does_not_retry() {
    let server = MockServer::start(vec![MockResponse::new(503, vec![], "busy")]);
    let client = Client::builder()
        .retry_policy(fast_retries())
        .try_build()
        .expect("client should build");

    let error = client
        .post(server.url("/orders"))
        .body("{}")
        .send()
        .await
        .expect_err("503 should raise");

    assert_eq!(error.code(), ErrorCode::ServerStatus);
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_timeout_is_reported() {
    let server = MockServer::start(vec![
        MockResponse::new(200, vec![], "slow").delayed(Duration::from_millis(400)),
    ]);
    let client = Client::builder()
        .transport(
            HyperTransport::builder()
                .timeout(Duration::from_millis(50))
                .build(),
        )
        .try_build()
        .expect("client should build");

    let error = client
        .get(server.url("/slow"))
        .send()
        .await
        .expect_err("request should time out");

    assert_eq!(error.code(), ErrorCode::Timeout);
    assert!(error.to_string().contains("50ms"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connection_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let address = listener.local_addr().expect("probe address");
    drop(listener);

    let client = Client::builder().try_build().expect("client should build");
    let error = client
        .get(format!("http://{address}/"))
        .send()
        .await
        .expect_err("nothing listens on the port");

    match error {
        Error::Transport { kind, uri, .. } => {
            assert_eq!(kind, TransportErrorKind::Connect);
            assert!(uri.starts_with(&format!("http://{address}")));
        }
        other => panic!("unexpected error variant: {other}"),
    }
}

#[derive(Serialize)]
struct Search<'a> {
    q: &'a str,
    page: u32,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_and_form_helpers_encode_payloads() {
    let server = MockServer::start(vec![
        MockResponse::new(200, vec![], ""),
        MockResponse::new(200, vec![], ""),
    ]);
    let client = Client::builder()
        .base_url(&server.base_url)
        .try_build()
        .expect("client should build");

    client
        .get("/search")
        .query(&Search {
            q: "rust http",
            page: 2,
        })
        .expect("query should encode")
        .query_pair("lang", "en&fr")
        .send()
        .await
        .expect("search should succeed");

    client
        .post("/login")
        .form(&[("user", "ada"), ("note", "a+b c")])
        .expect("form should encode")
        .send()
        .await
        .expect("login should succeed");

    let requests = server.requests();
    assert_eq!(requests[0].path, "/search?q=rust+http&page=2&lang=en%26fr");
    assert_eq!(
        requests[1].headers.get("content-type").map(String::as_str),
        Some("application/x-www-form-urlencoded")
    );
    assert_eq!(requests[1].body, b"user=ada&note=a%2Bb+c");
    assert_eq!(
        requests[1].headers.get("content-length").map(String::as_str),
        Some("21")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follows_relative_redirect_and_carries_cookies() {
    let server = MockServer::start(vec![
        MockResponse::new(
            302,
            vec![("Location", "/final"), ("Set-Cookie", "session=s1; Path=/")],
            "",
        ),
        MockResponse::new(200, vec![], "landed"),
    ]);
    let client = Client::builder()
        .cookies(true)
        .allow_redirects(RedirectConfig::follow().track_redirects(true))
        .try_build()
        .expect("client should build");

    let response = client
        .get(server.url("/start"))
        .send()
        .await
        .expect("redirect should be followed");

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.body().as_ref(), b"landed");
    assert_eq!(
        response.effective_url(),
        Some(server.url("/final").as_str())
    );
    assert_eq!(
        response.header_values(reqflow::REDIRECT_HISTORY_HEADER),
        [server.url("/final")]
    );

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].path, "/final");
    assert_eq!(
        requests[1].headers.get("cookie").map(String::as_str),
        Some("session=s1")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_sends_every_request_to_the_server() {
    let server = MockServer::start(
        (0..4)
            .map(|index| MockResponse::new(200, vec![], format!("r{index}")))
            .collect(),
    );
    let client = Client::builder().try_build().expect("client should build");
    let requests = (0..4)
        .map(|index| {
            client
                .create_request(http::Method::GET, &server.url(&format!("/item/{index}")))
                .expect("request should build")
        })
        .collect::<Vec<_>>();

    let outcomes = Pool::batch(&client, requests, PoolConfig::new().concurrency(2)).await;

    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(Result::is_ok));
    let mut paths = server
        .requests()
        .into_iter()
        .map(|request| request.path)
        .collect::<Vec<_>>();
    paths.sort();
    assert_eq!(paths, ["/item/0", "/item/1", "/item/2", "/item/3"]);
}
