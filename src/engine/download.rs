//! Sample data download.
//!
//! A catalog is a small JSON document `{"url": <prefix>, "files": {<name>: <suffix>}}`.
//! Every listed file is fetched from `<prefix><suffix>` into the cache directory
//! and handed to the host as soon as it is on disk.

use super::{Procedure, WorkerContext};
use crate::config::Settings;
use crate::error::{LauncherError, Result};
use crate::model::{DeliveryItem, RunKind};
use futures::StreamExt;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(50);
/// Longest silence tolerated on a single read; a stalled transfer fails instead of hanging.
const READ_TIMEOUT: Duration = Duration::from_secs(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Display name, also the file name in the cache.
    pub name: String,
    /// Suffix appended to the catalog url.
    pub suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub url: String,
    /// Entries in authored order.
    pub files: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| LauncherError::io(path, e))?;
        let value: Value = serde_json::from_str(&text).map_err(|e| LauncherError::json(path, e))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let url = value
            .get("url")
            .ok_or_else(|| missing_key("url"))?
            .as_str()
            .ok_or_else(|| LauncherError::Configuration("key 'url' must be a string".into()))?;
        let files = value
            .get("files")
            .ok_or_else(|| missing_key("files"))?
            .as_object()
            .ok_or_else(|| LauncherError::Configuration("key 'files' must be an object".into()))?;

        let files = files
            .iter()
            .map(|(name, suffix)| {
                let suffix = suffix.as_str().ok_or_else(|| {
                    LauncherError::Configuration(format!("file '{name}' must map to a string"))
                })?;
                if !is_plain_file_name(name) {
                    return Err(LauncherError::Configuration(format!(
                        "file name '{name}' must not contain directories"
                    )));
                }
                Ok(CatalogEntry {
                    name: name.clone(),
                    suffix: suffix.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            url: url.to_string(),
            files,
        })
    }

    /// `<catalog_dir>/<name>.json`; a name that already ends in `.json` is used as is.
    pub fn path_for(catalog_dir: &Path, name: &str) -> PathBuf {
        if name.ends_with(".json") {
            catalog_dir.join(name)
        } else {
            catalog_dir.join(format!("{name}.json"))
        }
    }
}

fn missing_key(key: &str) -> LauncherError {
    LauncherError::Configuration(format!("key '{key}' is missing in catalog"))
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Retrieves one remote file into `target`. Returns the number of bytes written.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, target: &Path) -> Result<u64>;
}

/// HTTP fetcher running on the application's tokio runtime.
///
/// `fetch` blocks the calling thread and must not be called from inside the
/// runtime; the worker thread is a plain OS thread.
pub struct HttpFetcher {
    client: reqwest::Client,
    runtime: Handle,
}

impl HttpFetcher {
    pub fn new(runtime: Handle) -> Result<Self> {
        Self::with_timeouts(runtime, CONNECT_TIMEOUT, READ_TIMEOUT)
    }

    pub fn with_timeouts(
        runtime: Handle,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(format!("lowrank-decomposition/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LauncherError::ExternalTool(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, runtime })
    }

    async fn fetch_to(&self, url: &str, target: &Path) -> Result<u64> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| LauncherError::ExternalTool(format!("GET {url}: {e}")))?;

        // Stream into a sibling file so an interrupted transfer never looks complete.
        let partial = partial_path(target);
        let mut file = fs::File::create(&partial).map_err(|e| LauncherError::io(&partial, e))?;
        let mut stream = resp.bytes_stream();
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| LauncherError::ExternalTool(format!("GET {url}: {e}")))?;
            file.write_all(&chunk)
                .map_err(|e| LauncherError::io(&partial, e))?;
            total += chunk.len() as u64;
        }
        file.flush().map_err(|e| LauncherError::io(&partial, e))?;
        drop(file);

        fs::rename(&partial, target).map_err(|e| LauncherError::io(target, e))?;
        Ok(total)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, target: &Path) -> Result<u64> {
        let res = self.runtime.block_on(self.fetch_to(url, target));
        if res.is_err() {
            let _ = fs::remove_file(partial_path(target));
        }
        res
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

/// Download every file of a catalog into the cache directory.
pub struct DownloadJob {
    catalog: String,
    catalog_path: PathBuf,
    cache_dir: PathBuf,
    force_redownload: bool,
    fetcher: Arc<dyn Fetcher>,
}

impl DownloadJob {
    pub fn new(catalog: &str, settings: &Settings, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            catalog: catalog.to_string(),
            catalog_path: Catalog::path_for(&settings.catalog_dir, catalog),
            cache_dir: settings.cache_dir.clone(),
            force_redownload: settings.force_redownload,
            fetcher,
        }
    }

    fn needs_download(&self, target: &Path) -> bool {
        if self.force_redownload {
            return true;
        }
        fs::metadata(target).map(|m| m.len() == 0).unwrap_or(true)
    }
}

impl Procedure for DownloadJob {
    fn kind(&self) -> RunKind {
        RunKind::Download {
            catalog: self.catalog.clone(),
        }
    }

    fn run(self: Box<Self>, ctx: &WorkerContext) -> Result<()> {
        tracing::info!(catalog = %self.catalog, "Starting to download");
        let catalog = Catalog::load(&self.catalog_path)?;
        tracing::debug!(?catalog, "loaded catalog");
        fs::create_dir_all(&self.cache_dir).map_err(|e| LauncherError::io(&self.cache_dir, e))?;

        for entry in &catalog.files {
            ctx.check_cancelled()?;
            let target = self.cache_dir.join(&entry.name);
            if self.needs_download(&target) {
                let url = format!("{}{}", catalog.url, entry.suffix);
                tracing::info!("Requesting download {} from {}...", target.display(), url);
                let bytes = self.fetcher.fetch(&url, &target)?;
                tracing::debug!(name = %entry.name, bytes, "downloaded");
            } else {
                tracing::debug!(name = %entry.name, "using cached copy");
            }
            ctx.deliver(DeliveryItem::new(&entry.name, target));
        }

        tracing::info!(catalog = %self.catalog, "Finished with download");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::delivery_channel;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Writes the url into the target and remembers what was requested.
    #[derive(Default)]
    struct FakeFetcher {
        requests: Mutex<Vec<String>>,
        fail_on: Option<String>,
        cancel_after: Option<(String, CancellationToken)>,
    }

    impl Fetcher for FakeFetcher {
        fn fetch(&self, url: &str, target: &Path) -> Result<u64> {
            self.requests.lock().unwrap().push(url.to_string());
            if self.fail_on.as_deref() == Some(url) {
                return Err(LauncherError::ExternalTool(format!("GET {url}: 404")));
            }
            fs::write(target, url).map_err(|e| LauncherError::io(target, e))?;
            if let Some((after, token)) = &self.cancel_after {
                if after == url {
                    token.cancel();
                }
            }
            Ok(url.len() as u64)
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(catalog: Value) -> Self {
            let dir = tempfile::TempDir::new().unwrap();
            fs::create_dir_all(dir.path().join("catalogs")).unwrap();
            fs::write(
                dir.path().join("catalogs").join("Sample.json"),
                catalog.to_string(),
            )
            .unwrap();
            Self { dir }
        }

        fn settings(&self, force_redownload: bool) -> Settings {
            Settings {
                cache_dir: self.cache_dir(),
                catalog_dir: self.dir.path().join("catalogs"),
                force_redownload,
                ..Settings::default()
            }
        }

        fn cache_dir(&self) -> PathBuf {
            self.dir.path().join("cache")
        }
    }

    fn run_job(
        fx: &Fixture,
        force: bool,
        fetcher: Arc<FakeFetcher>,
        cancel: CancellationToken,
    ) -> (Result<()>, Vec<DeliveryItem>) {
        let job = DownloadJob::new("Sample", &fx.settings(force), fetcher);
        let (tx, mut queue) = delivery_channel();
        let res = Box::new(job).run(&WorkerContext::new(tx, cancel));
        let mut delivered = Vec::new();
        queue.drain(&mut |item| {
            delivered.push(item.clone());
            true
        });
        (res, delivered)
    }

    fn abc_catalog() -> Value {
        json!({"url": "http://x/", "files": {"A": "a.img", "B": "b.img", "C": "c.img"}})
    }

    #[test]
    fn test_single_file_catalog_downloads_once() {
        let fx = Fixture::new(json!({"url": "http://x/", "files": {"a.img": "a.img"}}));
        let fetcher = Arc::new(FakeFetcher::default());

        let (res, delivered) = run_job(&fx, false, fetcher.clone(), CancellationToken::new());

        res.unwrap();
        assert_eq!(*fetcher.requests.lock().unwrap(), ["http://x/a.img"]);
        assert_eq!(
            delivered,
            vec![DeliveryItem::new("a.img", fx.cache_dir().join("a.img"))]
        );
    }

    #[test]
    fn test_cached_files_are_not_fetched_again() {
        let fx = Fixture::new(abc_catalog());
        fs::create_dir_all(fx.cache_dir()).unwrap();
        fs::write(fx.cache_dir().join("A"), "cached").unwrap();
        fs::write(fx.cache_dir().join("B"), "").unwrap();
        let fetcher = Arc::new(FakeFetcher::default());

        let (res, delivered) = run_job(&fx, false, fetcher.clone(), CancellationToken::new());

        res.unwrap();
        // empty files count as missing
        assert_eq!(
            *fetcher.requests.lock().unwrap(),
            ["http://x/b.img", "http://x/c.img"]
        );
        assert_eq!(delivered.len(), 3);
        assert_eq!(fs::read_to_string(fx.cache_dir().join("A")).unwrap(), "cached");
    }

    #[test]
    fn test_force_redownload_fetches_everything() {
        let fx = Fixture::new(abc_catalog());
        fs::create_dir_all(fx.cache_dir()).unwrap();
        fs::write(fx.cache_dir().join("A"), "cached").unwrap();
        let fetcher = Arc::new(FakeFetcher::default());

        let (res, _) = run_job(&fx, true, fetcher.clone(), CancellationToken::new());

        res.unwrap();
        assert_eq!(fetcher.requests.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_abort_after_first_file() {
        let fx = Fixture::new(abc_catalog());
        let cancel = CancellationToken::new();
        let fetcher = Arc::new(FakeFetcher {
            cancel_after: Some(("http://x/a.img".into(), cancel.clone())),
            ..FakeFetcher::default()
        });

        let (res, delivered) = run_job(&fx, false, fetcher.clone(), cancel);

        assert!(res.unwrap_err().is_aborted());
        assert_eq!(
            delivered,
            vec![DeliveryItem::new("A", fx.cache_dir().join("A"))]
        );
        assert_eq!(*fetcher.requests.lock().unwrap(), ["http://x/a.img"]);
    }

    #[test]
    fn test_fetch_failure_stops_download() {
        let fx = Fixture::new(abc_catalog());
        let fetcher = Arc::new(FakeFetcher {
            fail_on: Some("http://x/b.img".into()),
            ..FakeFetcher::default()
        });

        let (res, delivered) = run_job(&fx, false, fetcher, CancellationToken::new());

        assert!(matches!(res, Err(LauncherError::ExternalTool(_))));
        assert_eq!(
            delivered,
            vec![DeliveryItem::new("A", fx.cache_dir().join("A"))]
        );
    }

    #[test]
    fn test_catalog_missing_keys() {
        let err = Catalog::from_value(&json!({"files": {}})).unwrap_err();
        assert!(err.to_string().contains("'url' is missing"), "{err}");

        let err = Catalog::from_value(&json!({"url": "http://x/"})).unwrap_err();
        assert!(err.to_string().contains("'files' is missing"), "{err}");
    }

    #[test]
    fn test_catalog_rejects_nested_names() {
        let err = Catalog::from_value(&json!({"url": "u", "files": {"../escape": "e"}}))
            .unwrap_err();
        assert!(matches!(err, LauncherError::Configuration(_)));
    }

    #[test]
    fn test_catalog_keeps_authored_order() {
        let catalog = Catalog::from_value(&json!({
            "url": "u",
            "files": {"zeta": "z", "alpha": "a"}
        }))
        .unwrap();
        let names: Vec<&str> = catalog.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha"]);
    }

    #[test]
    fn test_catalog_path() {
        let dir = Path::new("/data");
        assert_eq!(
            Catalog::path_for(dir, "Bullseye"),
            PathBuf::from("/data/Bullseye.json")
        );
        assert_eq!(
            Catalog::path_for(dir, "Bullseye.json"),
            PathBuf::from("/data/Bullseye.json")
        );
    }

    #[test]
    fn test_stalled_transfer_times_out() {
        use std::io::{Read, Write as _};
        use std::net::TcpListener;
        use std::sync::mpsc;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request);
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\nabc")
                .unwrap();
            socket.flush().unwrap();
            // Keep the connection open without sending the rest of the body.
            let _ = done_rx.recv_timeout(Duration::from_secs(30));
        });

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let fetcher = HttpFetcher::with_timeouts(
            runtime.handle().clone(),
            Duration::from_secs(5),
            Duration::from_millis(300),
        )
        .unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("a.img");
        let started = std::time::Instant::now();
        let err = fetcher
            .fetch(&format!("http://{addr}/a.img"), &target)
            .unwrap_err();

        assert!(matches!(err, LauncherError::ExternalTool(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());

        done_tx.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/cache/a.nrrd")),
            PathBuf::from("/cache/a.nrrd.part")
        );
    }
}
