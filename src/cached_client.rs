use easy_error::{Error, ResultExt};
use log::{debug, error, warn};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use crate::site::USER_AGENT;
use std::fs::create_dir_all;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

/// Facilitates response type selection in `CachedClient`
/// by converting the cached and fetched bodies to requested type.
pub trait DataType: std::convert::AsRef<[u8]> + Clone {
    fn from_bytes(contents: &[u8]) -> Self;
}

impl DataType for String {
    fn from_bytes(contents: &[u8]) -> Self {
        // Pages and stylesheets of the site are UTF-8; assume it for both
        // the network and the cache so the two never disagree.
        String::from_utf8_lossy(contents).to_string()
    }
}

impl DataType for Vec<u8> {
    fn from_bytes(contents: &[u8]) -> Self {
        Vec::from(contents)
    }
}

/// Wraps the response from `CachedClient` to allow the consumer
/// to find out whether the resource was fetched, obtained from cache, or is missing.
#[derive(Debug)]
pub enum Resource<T: DataType> {
    Fetched(T),
    Cached(T),
    /// Non-200 response, or the network kept failing until retries ran out
    /// (reported as 404 with no body).
    Unavailable(StatusCode),
}

impl<T: DataType> Resource<T> {
    pub fn contents(&self) -> Option<&T> {
        match self {
            Resource::Fetched(contents) => Some(contents),
            Resource::Cached(contents) => Some(contents),
            Resource::Unavailable(_) => None,
        }
    }

    pub fn into_contents(self) -> Option<T> {
        match self {
            Resource::Fetched(contents) => Some(contents),
            Resource::Cached(contents) => Some(contents),
            Resource::Unavailable(_) => None,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Resource::Cached(_))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Resource::Unavailable(status) => *status,
            _ => StatusCode::OK,
        }
    }
}

/// How often and how patiently transient network failures are retried.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total number of attempts before giving up.
    pub max_attempts: u32,
    /// The wait after the n-th failed attempt is `n * backoff_step`.
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_step: Duration::from_secs(1),
        }
    }
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Wrapper around `reqwest::blocking::Client` that caches successful
/// responses forever in the provided directory and retries flaky connections.
pub struct CachedClient {
    client: Client,
    cache_dir: Option<PathBuf>,
    retry: RetryPolicy,
}

impl CachedClient {
    pub fn new(cache_dir: Option<PathBuf>, timeout: Duration, retry: RetryPolicy) -> Result<Self, Error> {
        if let Some(ref cache_path) = cache_dir {
            create_dir_all(cache_path).context(format!("Could not create cache directory {cache_path:?}"))?;
        }

        // No cookie store is configured, so no session state leaks from one request to the next.
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Could not build HTTP client")?;

        Ok(Self {
            client,
            cache_dir,
            retry,
        })
    }

    fn cache_file(&self, url: &Url) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|cache_path| cache_path.join(url.to_string().replace("/", "%2F")))
    }

    /// Issues a GET, retrying connection errors and timeouts with linear backoff.
    /// Once the attempts are exhausted a synthetic 404 with an empty body is returned.
    pub fn fetch_uncached(&self, url: &Url) -> Result<(StatusCode, Vec<u8>), Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self
                .client
                .get(url.clone())
                .send()
                .and_then(|response| {
                    let status = response.status();
                    response.bytes().map(|body| (status, body.to_vec()))
                });

            match outcome {
                Ok(result) => return Ok(result),
                // Refused, reset and dropped connections all count as transient.
                Err(err) if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() => {
                    error!(
                        "Error with connection to {url} ('{err}'); attempt {attempt} of {}.",
                        self.retry.max_attempts
                    );
                    if attempt >= self.retry.max_attempts {
                        return Ok((StatusCode::NOT_FOUND, Vec::new()));
                    }
                    sleep(self.retry.backoff_step * attempt);
                }
                Err(err) => return Err(err).context(format!("Could not retrieve {url}")),
            }
        }
    }

    /// Provides the contents of given URL in the format specified by the type parameter `T`:
    ///  - For `String`, the contents will be decoded using UTF-8 encoding.
    ///  - For `Vec<u8>`, the conents will be returned as they are.
    /// When the client has a cache directory available, it will attempt to look for the URL in there.
    pub fn fetch<T: DataType>(&self, url: &Url) -> Result<Resource<T>, Error> {
        let cached_file = self.cache_file(url);

        if let Some(ref cached_file) = cached_file {
            if cached_file.exists() {
                let cached_contents =
                    std::fs::read(cached_file).context(format!("Unable to load {cached_file:?} from cache"))?;
                debug!("Using {url} from cache");
                return Ok(Resource::Cached(T::from_bytes(&cached_contents)));
            }
        }

        let (status, body) = self.fetch_uncached(url)?;
        if status != StatusCode::OK {
            error!("HTTP CODE {} for {url}", status.as_u16());
            return Ok(Resource::Unavailable(status));
        }

        if let Some(cached_file) = cached_file {
            if let Err(err) = std::fs::write(&cached_file, &body) {
                warn!("Could not cache {url} as {cached_file:?}: {err}");
            }
        }
        debug!("Downloaded {url}");

        Ok(Resource::Fetched(T::from_bytes(&body)))
    }

    /// Cheap existence check. Successful bodies land in the cache,
    /// so a following `fetch` of the same URL does not hit the network again.
    pub fn probe(&self, url: &Url) -> bool {
        match self.fetch::<Vec<u8>>(url) {
            Ok(resource) => resource.contents().is_some(),
            Err(err) => {
                error!("Probe of {url} failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_client(cache_dir: Option<PathBuf>) -> CachedClient {
    CachedClient::new(
        cache_dir,
        Duration::from_secs(5),
        RetryPolicy {
            max_attempts: 5,
            backoff_step: Duration::from_millis(1),
        },
    )
    .unwrap()
}

#[test]
fn test_fetch_caches_successful_response() {
    let mut server = mockito::Server::new();
    let mock = server.mock("GET", "/css/app.css").with_body("body {}").expect(1).create();
    let cache = tempfile::tempdir().unwrap();
    let client = test_client(Some(cache.path().to_path_buf()));
    let url = Url::parse(&format!("{}/css/app.css", server.url())).unwrap();

    let first = client.fetch::<String>(&url).unwrap();
    assert!(!first.is_cached());
    assert_eq!(Some(&"body {}".to_string()), first.contents());

    let second = client.fetch::<String>(&url).unwrap();
    assert!(second.is_cached());
    assert_eq!(Some(&"body {}".to_string()), second.contents());

    mock.assert();
}

#[test]
fn test_fetch_does_not_cache_errors() {
    let mut server = mockito::Server::new();
    let mock = server.mock("GET", "/missing.png").with_status(404).expect(2).create();
    let cache = tempfile::tempdir().unwrap();
    let client = test_client(Some(cache.path().to_path_buf()));
    let url = Url::parse(&format!("{}/missing.png", server.url())).unwrap();

    for _ in 0..2 {
        let res = client.fetch::<Vec<u8>>(&url).unwrap();
        assert_eq!(StatusCode::NOT_FOUND, res.status());
        assert!(res.contents().is_none());
    }

    mock.assert();
}

#[test]
fn test_exhausted_retries_degrade_to_not_found() {
    // Nothing listens on port 1, every attempt is a connection error.
    let client = test_client(None);
    let url = Url::parse("http://127.0.0.1:1/img/left.png").unwrap();

    let res = client.fetch::<Vec<u8>>(&url).unwrap();
    assert_eq!(StatusCode::NOT_FOUND, res.status());
    assert!(res.into_contents().is_none());
    assert!(!client.probe(&url));
}

#[cfg(test)]
fn dropping_listener() -> (Url, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = Url::parse(&format!("http://{}/img/left.png", listener.local_addr().unwrap())).unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });
    (url, connections)
}

#[test]
fn test_dropped_connections_are_retried_then_not_found() {
    let (url, connections) = dropping_listener();
    let step = Duration::from_millis(10);
    let client = CachedClient::new(
        None,
        Duration::from_secs(5),
        RetryPolicy {
            max_attempts: 5,
            backoff_step: step,
        },
    )
    .unwrap();

    let started = std::time::Instant::now();
    let res = client.fetch::<Vec<u8>>(&url).unwrap();

    assert_eq!(StatusCode::NOT_FOUND, res.status());
    assert!(res.contents().is_none());
    assert_eq!(5, connections.load(std::sync::atomic::Ordering::SeqCst));
    // Waits of 1, 2, 3 and 4 steps between the five attempts.
    assert!(started.elapsed() >= step * 10);
}

#[test]
fn test_uncachable_response_is_still_returned() {
    let name = format!("/upload/{}.jpg", "a".repeat(300));
    let mut server = mockito::Server::new();
    let mock = server.mock("GET", name.as_str()).with_body("jpeg").expect(2).create();
    let cache = tempfile::tempdir().unwrap();
    let client = test_client(Some(cache.path().to_path_buf()));
    let url = Url::parse(&format!("{}{name}", server.url())).unwrap();

    let res = client.fetch::<Vec<u8>>(&url).unwrap();
    assert!(!res.is_cached());
    assert_eq!(Some(b"jpeg".to_vec()), res.into_contents());
    assert!(client.probe(&url));
    assert_eq!(0, std::fs::read_dir(cache.path()).unwrap().count());

    mock.assert();
}

#[test]
fn test_probe_fills_cache() {
    let mut server = mockito::Server::new();
    let mock = server.mock("GET", "/upload/cover.jpg").with_body(b"jpeg").expect(1).create();
    let cache = tempfile::tempdir().unwrap();
    let client = test_client(Some(cache.path().to_path_buf()));
    let url = Url::parse(&format!("{}/upload/cover.jpg", server.url())).unwrap();

    assert!(client.probe(&url));
    let res = client.fetch::<Vec<u8>>(&url).unwrap();
    assert!(res.is_cached());
    assert_eq!(b"jpeg".to_vec(), res.into_contents().unwrap());

    mock.assert();
}
