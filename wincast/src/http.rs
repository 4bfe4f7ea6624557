use anyhow::Result;
use axum::{Router, extract::MatchedPath, http::Request};
use std::{net::IpAddr, path::Path};
use tempfile::TempDir;
use tokio::{
    io::AsyncRead,
    sync::oneshot,
    task::JoinHandle,
};
use tower_http::{services::ServeFile, trace::TraceLayer};
use tracing::{debug, debug_span, info, warn};

/// Minimal HTTP server for serving files to virtual machines. It stops when
/// dropped or shut down.
pub struct HttpServer {
    pub port: u16,
    directory: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HttpServer {
    pub fn new() -> Result<HttpServerBuilder> {
        Ok(HttpServerBuilder {
            router: Router::new(),
            directory: tempfile::tempdir()?,
        })
    }

    /// Where served files are staged.
    pub fn directory(&self) -> &Path {
        self.directory.path()
    }

    /// Stop accepting connections and wait for in-flight responses.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(port = self.port, "Stopped HTTP server");
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub struct HttpServerBuilder {
    router: Router,
    directory: TempDir,
}

impl HttpServerBuilder {
    /// Stage the contents of `input` and serve them at `/path`.
    pub async fn file(
        mut self,
        path: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Self> {
        let path = path.trim_start_matches('/');
        let tmp_path = self.directory.path().join(Path::new(path));
        if let Some(parent) = tmp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let bytes = tokio::io::copy(input, &mut file).await?;
        file.sync_all().await?;

        let route = format!("/{path}");
        debug!(route = %route, tmp_path = ?tmp_path, bytes, "Registered HTTP route");
        self.router = self.router.route_service(&route, ServeFile::new(tmp_path));
        Ok(self)
    }

    /// Serve a copy of the local file at `source` at `/path`.
    pub async fn file_from_path(self, path: &str, source: &Path) -> Result<Self> {
        let mut input = tokio::fs::File::open(source).await?;
        self.file(path, &mut input).await
    }

    /// Bind a port in `[lower, upper)` and start serving in the background.
    pub async fn serve(self, ip: IpAddr, lower: u16, upper: u16) -> Result<HttpServer> {
        let listener = crate::bind_open_port(ip, lower, upper).await?;
        let port = listener.local_addr()?.port();
        info!(port, "Starting HTTP server");

        let router = self.router.layer(TraceLayer::new_for_http().make_span_with(
            |request: &Request<_>| {
                let matched_path = request
                    .extensions()
                    .get::<MatchedPath>()
                    .map(MatchedPath::as_str);

                debug_span!(
                    "http_request",
                    method = ?request.method(),
                    matched_path,
                )
            },
        ));

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await;
            if let Err(error) = result {
                warn!(error = %error, "HTTP server failed");
            }
        });

        Ok(HttpServer {
            port,
            directory: self.directory,
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    async fn get(port: u16, path: &str) -> String {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        stream
            .write_all(
                format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test_log::test(tokio::test)]
    async fn test_serve_file() {
        let mut input: &[u8] = b"Write-Host hello";
        let server = HttpServer::new()
            .unwrap()
            .file("script.ps1", &mut input)
            .await
            .unwrap()
            .serve(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000, 9000)
            .await
            .unwrap();

        assert!((8000..9000).contains(&server.port));
        assert!(server.directory().join("script.ps1").exists());

        let response = get(server.port, "/script.ps1").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("Write-Host hello"));

        let response = get(server.port, "/missing").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");

        let port = server.port;
        server.shutdown().await;
        assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_file_from_path() {
        let source = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(source.path(), "payload").unwrap();

        let server = HttpServer::new()
            .unwrap()
            .file_from_path("nested/payload.bin", source.path())
            .await
            .unwrap()
            .serve(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000, 9000)
            .await
            .unwrap();

        let response = get(server.port, "/nested/payload.bin").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("payload"));
    }
}
