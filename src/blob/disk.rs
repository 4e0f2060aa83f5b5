// On-disk blob storage
//
// Blobs live under a root directory, one file per key. Retrieval links are
// either plain file:// URLs, or http:// URLs answered by a small embedded
// server bound to an ephemeral local port.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path as RoutePath, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::{Key, Storage, StorageError};

/// How long the embedded server gets to drain in-flight requests when the
/// store is closed.
const SERVER_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Blob storage rooted at a directory on the local filesystem.
pub struct DiskStorage {
    root: PathBuf,
    base_url: Option<Url>,
    server: Mutex<Option<ServerHandle>>,
}

struct ServerHandle {
    token: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl DiskStorage {
    /// A store whose links are file:// URLs. Useful when every consumer runs
    /// on the same machine.
    pub fn new(root: impl Into<PathBuf>) -> DiskStorage {
        DiskStorage {
            root: root.into(),
            base_url: None,
            server: Mutex::new(None),
        }
    }

    /// A store that serves its blobs over HTTP from an ephemeral local port.
    pub async fn serve(root: impl Into<PathBuf>) -> Result<DiskStorage, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let token = CancellationToken::new();
        let task = tokio::spawn(run_server(listener, root.clone(), token.clone()));

        log::debug!("blob server listening on {addr}");

        let base_url = Url::parse(&format!("http://{addr}/"))
            .map_err(|e| StorageError::Server(e.to_string()))?;

        Ok(DiskStorage {
            root,
            base_url: Some(base_url),
            server: Mutex::new(Some(ServerHandle { token, task })),
        })
    }

    /// The address the embedded server is bound to, if there is one.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        let base = self.base_url.as_ref()?;
        let host = base.host_str()?;
        let port = base.port()?;
        format!("{host}:{port}").parse().ok()
    }

    fn path_for(&self, key: &Key) -> PathBuf {
        self.root.join(key.to_string())
    }
}

#[async_trait]
impl Storage for DiskStorage {
    async fn store(&self, data: &[u8]) -> Result<Key, StorageError> {
        let key = Key::for_bytes(data);
        let filename = self.path_for(&key);

        tokio::fs::create_dir_all(&self.root).await?;

        if tokio::fs::try_exists(&filename).await? {
            log::debug!("blob {key} already exists");
            return Ok(key);
        }

        log::debug!("saving blob {key} ({} bytes)", data.len());

        // Write to a unique temporary file and rename it into place, so
        // concurrent writers of the same bytes never observe a partial blob
        // and the last rename simply replaces identical content.
        let staging = self.root.join(format!(".staging-{}", Uuid::new_v4()));
        tokio::fs::write(&staging, data).await?;
        if let Err(e) = tokio::fs::rename(&staging, &filename).await {
            let _ = tokio::fs::remove_file(&staging).await;
            if !tokio::fs::try_exists(&filename).await.unwrap_or(false) {
                return Err(e.into());
            }
        }

        Ok(key)
    }

    async fn link(&self, key: Key, _valid_for: Duration) -> Result<Url, StorageError> {
        let filename = self.path_for(&key);

        match tokio::fs::metadata(&filename).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound)
            }
            Err(e) => return Err(e.into()),
        }

        match &self.base_url {
            Some(base) => base
                .join(&key.to_string())
                .map_err(|e| StorageError::Server(e.to_string())),
            None => file_url(&filename),
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        let handle = self.server.lock().unwrap().take();
        let Some(ServerHandle { token, mut task }) = handle else {
            return Ok(());
        };

        token.cancel();

        match tokio::time::timeout(SERVER_SHUTDOWN_DEADLINE, &mut task).await {
            Ok(Ok(result)) => result.map_err(StorageError::from),
            Ok(Err(join_error)) => Err(StorageError::Server(join_error.to_string())),
            Err(_) => {
                log::warn!("blob server didn't shut down in time, aborting it");
                task.abort();
                Ok(())
            }
        }
    }
}

impl Drop for DiskStorage {
    fn drop(&mut self) {
        // Don't leave a dangling server if the caller forgot to close.
        if let Ok(mut guard) = self.server.lock() {
            if let Some(handle) = guard.take() {
                log::warn!("DiskStorage was dropped without close(), shutting down its server");
                handle.token.cancel();
                handle.task.abort();
            }
        }
    }
}

async fn run_server(
    listener: tokio::net::TcpListener,
    root: PathBuf,
    token: CancellationToken,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/{key}", get(serve_blob))
        .with_state(root);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

async fn serve_blob(
    State(root): State<PathBuf>,
    RoutePath(raw_key): RoutePath<String>,
) -> Result<Vec<u8>, StatusCode> {
    // Parsing the key also rules out path traversal.
    let key: Key = raw_key.parse().map_err(|_| StatusCode::BAD_REQUEST)?;

    match tokio::fs::read(root.join(key.to_string())).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            log::error!("unable to read blob {key}: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Turn a filesystem path into a file:// URL, normalising Windows drive
/// letters to the /C:/... form browsers and ffmpeg expect.
fn file_url(path: &Path) -> Result<Url, StorageError> {
    let absolute = std::path::absolute(path)?;
    let mut slashed = absolute.to_string_lossy().replace('\\', "/");

    if slashed.as_bytes().get(1) == Some(&b':') {
        let drive = slashed[..1].to_ascii_uppercase();
        slashed = format!("/{}{}", drive, &slashed[1..]);
    }

    Url::parse(&format!("file://{slashed}"))
        .map_err(|e| StorageError::Server(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_and_read_back_through_a_file_link() {
        let root = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(root.path());

        let key = storage.store(b"Hello, World").await.unwrap();
        let link = storage
            .link(key, Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(link.scheme(), "file");
        let body = std::fs::read(link.to_file_path().unwrap()).unwrap();
        assert_eq!(body, b"Hello, World");
    }

    #[tokio::test]
    async fn store_and_read_back_through_the_server() {
        let root = tempfile::tempdir().unwrap();
        let storage = DiskStorage::serve(root.path()).await.unwrap();

        let key = storage.store(b"Hello, World").await.unwrap();
        let link = storage
            .link(key, Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(link.scheme(), "http");
        let body = reqwest::get(link).await.unwrap().bytes().await.unwrap();
        assert_eq!(&body[..], b"Hello, World");

        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn storing_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(root.path());

        let first = storage.store(b"same bytes").await.unwrap();
        let second = storage.store(b"same bytes").await.unwrap();

        assert_eq!(first, second);
        let files: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn linking_a_missing_blob_fails() {
        let root = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(root.path());

        let key = Key::for_bytes(b"never stored");
        let err = storage
            .link(key, Duration::from_secs(60))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::NotFound));
    }

    #[tokio::test]
    async fn closing_twice_is_fine() {
        let root = tempfile::tempdir().unwrap();
        let storage = DiskStorage::serve(root.path()).await.unwrap();

        storage.close().await.unwrap();
        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn the_server_rejects_bogus_keys() {
        let root = tempfile::tempdir().unwrap();
        let storage = DiskStorage::serve(root.path()).await.unwrap();
        let addr = storage.server_addr().unwrap();

        let response = reqwest::get(format!("http://{addr}/not-a-key"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let missing = Key::for_bytes(b"missing");
        let response = reqwest::get(format!("http://{addr}/{missing}"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        storage.close().await.unwrap();
    }
}
