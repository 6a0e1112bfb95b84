use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::UpdateError;
use crate::util::{cancel_requested, transfer_fraction};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const TRANSFER_BUFFER_SIZE: usize = 64 * 1024;

/// HTTP client with the launcher's connect/read timeouts and user agent.
pub fn build_client(user_agent: &str) -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .user_agent(user_agent)
        .build()
        .unwrap_or_else(|err| {
            warn!("network client: falling back to default HTTP client configuration ({err})");
            Client::new()
        })
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransferProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub bytes_per_sec: f32,
}

impl TransferProgress {
    /// `None` while the server has not declared a size.
    #[must_use]
    pub fn fraction(&self) -> Option<f32> {
        transfer_fraction(self.downloaded, self.total)
    }
}

/// Streams a remote artifact to a local file.
#[derive(Clone)]
pub struct ArtifactFetcher {
    client: Client,
}

impl ArtifactFetcher {
    pub fn new(user_agent: &str) -> Self {
        Self {
            client: build_client(user_agent),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Download `url` to `dest`, calling `progress` after every chunk.
    ///
    /// Any existing file at `dest` is removed first. On error or cancellation the partial
    /// file is deleted. Returns the number of bytes written.
    pub async fn fetch<F>(
        &self,
        url: &str,
        dest: &Path,
        cancel: Option<Arc<AtomicBool>>,
        mut progress: F,
    ) -> Result<u64, UpdateError>
    where
        F: FnMut(TransferProgress),
    {
        if cancel_requested(&cancel) {
            return Err(UpdateError::Cancelled);
        }

        match fs::remove_file(dest).await {
            Ok(()) => debug!("fetch: removed stale {}", dest.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(UpdateError::network("remove stale download", err)),
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| UpdateError::network("create download dir", e))?;
        }

        info!("fetch: downloading {url} to {}", dest.display());
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::network("artifact request", e))?
            .error_for_status()
            .map_err(|e| UpdateError::network("artifact status", e))?;

        let total = response.content_length();
        let file = File::create(dest)
            .await
            .map_err(|e| UpdateError::network("create download file", e))?;
        let mut writer = BufWriter::with_capacity(TRANSFER_BUFFER_SIZE, file);

        let result = stream_body(response, &mut writer, total, &cancel, &mut progress).await;
        let result = match result {
            Ok(written) => writer
                .flush()
                .await
                .map(|()| written)
                .map_err(|e| UpdateError::network("flush download", e)),
            Err(err) => Err(err),
        };
        drop(writer);

        match result {
            Ok(written) => {
                info!("fetch: completed {} ({written} bytes)", dest.display());
                Ok(written)
            }
            Err(err) => {
                if let Err(remove_err) = fs::remove_file(dest).await {
                    warn!(
                        "fetch: could not remove partial download {}: {remove_err}",
                        dest.display()
                    );
                }
                Err(err)
            }
        }
    }
}

async fn stream_body<F>(
    response: reqwest::Response,
    writer: &mut BufWriter<File>,
    total: Option<u64>,
    cancel: &Option<Arc<AtomicBool>>,
    progress: &mut F,
) -> Result<u64, UpdateError>
where
    F: FnMut(TransferProgress),
{
    let started = Instant::now();
    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;

    progress(TransferProgress {
        downloaded,
        total,
        bytes_per_sec: 0.0,
    });

    while let Some(chunk) = stream.next().await {
        if cancel_requested(cancel) {
            warn!("fetch: cancelled after {downloaded} bytes");
            return Err(UpdateError::Cancelled);
        }
        let chunk = chunk.map_err(|e| UpdateError::network("artifact stream", e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| UpdateError::network("write download", e))?;
        downloaded += chunk.len() as u64;

        let elapsed = started.elapsed().as_secs_f32();
        progress(TransferProgress {
            downloaded,
            total,
            bytes_per_sec: if elapsed > 0.0 {
                downloaded as f32 / elapsed
            } else {
                0.0
            },
        });
    }

    if cancel_requested(cancel) {
        return Err(UpdateError::Cancelled);
    }
    if let Some(total) = total
        && downloaded < total
    {
        return Err(UpdateError::network(
            "artifact stream",
            format!("download incomplete: received {downloaded} of {total} bytes"),
        ));
    }
    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve_chunked;
    use std::sync::atomic::Ordering;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve_bytes(server: &MockServer, route: &str, status: u16, body: Vec<u8>) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_bytes(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn downloads_and_reports_monotonic_progress() {
        let server = MockServer::start().await;
        let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        serve_bytes(&server, "/build/a.zip", 200, body.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("a.zip");
        let fetcher = ArtifactFetcher::new("test-agent");
        let mut seen = Vec::new();
        let written = fetcher
            .fetch(
                &format!("{}/build/a.zip", server.uri()),
                &dest,
                None,
                |p| seen.push(p),
            )
            .await
            .unwrap();

        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(seen.windows(2).all(|w| w[0].downloaded <= w[1].downloaded));
        let last = seen.last().unwrap();
        assert_eq!(last.downloaded, body.len() as u64);
        assert_eq!(last.fraction(), Some(1.0));
    }

    #[tokio::test]
    async fn replaces_existing_destination() {
        let server = MockServer::start().await;
        serve_bytes(&server, "/a", 200, b"new".to_vec()).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a");
        std::fs::write(&dest, b"an older and longer file").unwrap();

        ArtifactFetcher::new("test-agent")
            .fetch(&format!("{}/a", server.uri()), &dest, None, |_| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
    }

    #[tokio::test]
    async fn http_error_is_network_error_and_leaves_no_file() {
        let server = MockServer::start().await;
        serve_bytes(&server, "/missing", 404, Vec::new()).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing.zip");
        let err = ArtifactFetcher::new("test-agent")
            .fetch(&format!("{}/missing", server.uri()), &dest, None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Network { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn unknown_length_reports_no_fraction() {
        let body: Vec<u8> = (0..50_000u32).map(|i| (i % 13) as u8).collect();
        let base = serve_chunked(body.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("chunked.zip");
        let mut seen = Vec::new();
        let written = ArtifactFetcher::new("test-agent")
            .fetch(&format!("{base}/build/chunked"), &dest, None, |p| seen.push(p))
            .await
            .unwrap();

        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|p| p.total.is_none() && p.fraction().is_none()));
        assert_eq!(seen.last().unwrap().downloaded, body.len() as u64);
    }

    #[tokio::test]
    async fn cancelled_transfer_removes_partial_file() {
        let server = MockServer::start().await;
        serve_bytes(&server, "/big", 200, vec![7u8; 512 * 1024]).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big.zip");
        let flag = Arc::new(AtomicBool::new(false));
        let trigger = flag.clone();
        let err = ArtifactFetcher::new("test-agent")
            .fetch(
                &format!("{}/big", server.uri()),
                &dest,
                Some(flag),
                move |_| trigger.store(true, Ordering::SeqCst),
            )
            .await
            .unwrap_err();
        assert_eq!(err, UpdateError::Cancelled);
        assert!(!dest.exists());
    }
}
