//! Static file serving with SPA fallback
//!
//! Requests resolve against the bundle root; anything that does not map to a
//! file gets the fallback entry document so client-side routing can take
//! over. A missing fallback document is a deployment error and surfaces as
//! a 500.

use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, warn};

use crate::config::StaticConfig;
use crate::error::{empty_body, full_body, status_response, ResponseBody};
use crate::mime::content_type_for;

#[derive(Debug, thiserror::Error)]
pub enum StaticError {
    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A file loaded from the bundle
#[derive(Debug)]
pub struct StaticFile {
    pub path: PathBuf,
    pub content: Vec<u8>,
    pub content_type: String,
}

impl StaticFile {
    async fn load(path: PathBuf) -> Result<Self, StaticError> {
        let content = fs::read(&path).await.map_err(|source| StaticError::Read {
            path: path.clone(),
            source,
        })?;
        let content_type = content_type_for(&path);
        Ok(Self {
            path,
            content,
            content_type,
        })
    }

    fn into_response(self, head_only: bool) -> Response<ResponseBody> {
        let len = self.content.len();
        let body = if head_only {
            empty_body()
        } else {
            full_body(self.content)
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, self.content_type)
            .header(CONTENT_LENGTH, len)
            .body(body)
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Serves the bundle directory
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    fallback: PathBuf,
    index_files: Vec<String>,
}

impl StaticFiles {
    pub fn from_config(config: &StaticConfig) -> Self {
        let root = PathBuf::from(&config.root);
        Self {
            fallback: root.join(&config.fallback),
            root,
            index_files: config.index_files.clone(),
        }
    }

    pub fn fallback(&self) -> &Path {
        &self.fallback
    }

    /// Map a request path to an existing file inside the root
    pub async fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let decoded = urlencoding::decode(request_path).ok()?;
        let relative = Path::new(decoded.trim_start_matches('/'));

        // Only plain segments; `..` and absolute components never resolve
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            warn!(path = request_path, "Rejected path outside static root");
            return None;
        }

        // Dotfiles are ignored and fall through to the fallback
        if relative.components().any(|c| match c {
            Component::Normal(name) => name.to_string_lossy().starts_with('.'),
            _ => false,
        }) {
            debug!(path = request_path, "Ignoring dotfile request");
            return None;
        }

        let mut candidate = self.root.join(relative);

        if fs::metadata(&candidate).await.ok()?.is_dir() {
            let mut found = None;
            for index in &self.index_files {
                let index_path = candidate.join(index);
                if is_file(&index_path).await {
                    found = Some(index_path);
                    break;
                }
            }
            candidate = found?;
        } else if !is_file(&candidate).await {
            return None;
        }

        // Symlinks may point anywhere; the target must stay under the root
        let root = fs::canonicalize(&self.root).await.ok()?;
        let canonical = fs::canonicalize(&candidate).await.ok()?;
        if !canonical.starts_with(&root) {
            warn!(
                path = request_path,
                resolved = %canonical.display(),
                "Rejected path outside static root"
            );
            return None;
        }

        Some(candidate)
    }

    /// Answer a request not claimed by the forwarder
    pub async fn serve(&self, method: &Method, path: &str) -> Response<ResponseBody> {
        let head_only = match *method {
            Method::GET => false,
            Method::HEAD => true,
            _ => return status_response(StatusCode::NOT_FOUND),
        };

        if let Some(file_path) = self.resolve(path).await {
            match StaticFile::load(file_path).await {
                Ok(file) => {
                    debug!(path, file = %file.path.display(), "Serving static file");
                    return file.into_response(head_only);
                }
                Err(e) => {
                    warn!(path, error = %e, "Static file vanished, serving fallback");
                }
            }
        }

        match StaticFile::load(self.fallback.clone()).await {
            Ok(file) => {
                debug!(path, "Serving SPA fallback");
                file.into_response(head_only)
            }
            Err(e) => {
                error!(path, error = %e, "Fallback document unavailable");
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tempfile::TempDir;

    fn bundle() -> (TempDir, StaticFiles) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>app</html>").unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1);").unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/logo.svg"), "<svg/>").unwrap();
        std::fs::write(dir.path().join("assets/my file.txt"), "spaced").unwrap();

        let config = StaticConfig {
            root: dir.path().to_string_lossy().into_owned(),
            ..StaticConfig::default()
        };
        (dir, StaticFiles::from_config(&config))
    }

    async fn body_of(response: Response<ResponseBody>) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn test_resolve_existing_file() {
        let (dir, files) = bundle();
        assert_eq!(
            files.resolve("/app.js").await,
            Some(dir.path().join("app.js"))
        );
        assert_eq!(
            files.resolve("/assets/logo.svg").await,
            Some(dir.path().join("assets/logo.svg"))
        );
    }

    #[tokio::test]
    async fn test_resolve_percent_encoded() {
        let (dir, files) = bundle();
        assert_eq!(
            files.resolve("/assets/my%20file.txt").await,
            Some(dir.path().join("assets/my file.txt"))
        );
    }

    #[tokio::test]
    async fn test_resolve_directory_uses_index() {
        let (dir, files) = bundle();
        assert_eq!(
            files.resolve("/").await,
            Some(dir.path().join("index.html"))
        );
        assert_eq!(files.resolve("/assets").await, None);
    }

    #[tokio::test]
    async fn test_resolve_rejects_traversal() {
        let (_dir, files) = bundle();
        assert_eq!(files.resolve("/../etc/passwd").await, None);
        assert_eq!(files.resolve("/assets/%2e%2e/%2e%2e/etc/passwd").await, None);
    }

    #[tokio::test]
    async fn test_serve_file() {
        let (_dir, files) = bundle();
        let response = files.serve(&Method::GET, "/app.js").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            content_type_for(Path::new("app.js")).as_str()
        );
        assert_eq!(body_of(response).await, b"console.log(1);");
    }

    #[tokio::test]
    async fn test_serve_fallback_for_unknown_route() {
        let (_dir, files) = bundle();
        let response = files.serve(&Method::GET, "/dashboard/settings").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(body_of(response).await, b"<html>app</html>");
    }

    #[tokio::test]
    async fn test_serve_head_has_no_body() {
        let (_dir, files) = bundle();
        let response = files.serve(&Method::HEAD, "/app.js").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "15");
        assert!(body_of(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_serve_rejects_other_methods() {
        let (_dir, files) = bundle();
        let response = files.serve(&Method::POST, "/app.js").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_fallback_is_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = StaticConfig {
            root: dir.path().to_string_lossy().into_owned(),
            ..StaticConfig::default()
        };
        let files = StaticFiles::from_config(&config);

        let response = files.serve(&Method::GET, "/dashboard").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_dotfiles_fall_back() {
        let (dir, files) = bundle();
        std::fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "[core]").unwrap();

        assert_eq!(files.resolve("/.env").await, None);
        assert_eq!(files.resolve("/.git/config").await, None);
        assert_eq!(files.resolve("/%2eenv").await, None);

        let response = files.serve(&Method::GET, "/.env").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, b"<html>app</html>");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_outside_root_falls_back() {
        let (dir, files) = bundle();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, "outside").unwrap();
        std::os::unix::fs::symlink(&secret, dir.path().join("leak.txt")).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("linked")).unwrap();

        assert_eq!(files.resolve("/leak.txt").await, None);
        assert_eq!(files.resolve("/linked/secret.txt").await, None);

        let response = files.serve(&Method::GET, "/leak.txt").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, b"<html>app</html>");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_inside_root_is_served() {
        let (dir, files) = bundle();
        std::os::unix::fs::symlink(dir.path().join("app.js"), dir.path().join("alias.js"))
            .unwrap();

        assert_eq!(
            files.resolve("/alias.js").await,
            Some(dir.path().join("alias.js"))
        );
    }

    #[tokio::test]
    async fn test_binary_file_is_byte_identical() {
        let (dir, files) = bundle();
        let bytes: Vec<u8> = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0xff, 0x00, 0xfe, 0x80];
        std::fs::write(dir.path().join("assets/icon.png"), &bytes).unwrap();

        let response = files.serve(&Method::GET, "/assets/icon.png").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "image/png");
        assert_eq!(body_of(response).await, bytes);
    }
}
