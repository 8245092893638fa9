//! Dropbox HTTP API v2 backend.

use super::{ByteStream, Remote, RemoteSettings};
use crate::error::SnapshotError;
use crate::types::{DeletedEntry, FileEntry, FolderEntry, ListPage, RemoteEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Registry identifier of this backend.
pub const BACKEND_ID: &str = "dropbox";

pub const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
pub const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";

/// Registry factory.
pub fn factory(settings: &RemoteSettings) -> Result<Box<dyn Remote>, SnapshotError> {
    Ok(Box::new(DropboxRemote::new(settings)?))
}

#[derive(Deserialize, Debug)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct FileMetadata {
    id: String,
    path_display: Option<String>,
    path_lower: Option<String>,
    size: u64,
    server_modified: DateTime<Utc>,
    content_hash: Option<String>,
}

#[derive(Deserialize, Debug)]
struct FolderMetadata {
    id: String,
    path_display: Option<String>,
    path_lower: Option<String>,
}

#[derive(Deserialize, Debug)]
struct DeletedMetadata {
    path_display: Option<String>,
    path_lower: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ListFolderResult {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Deserialize, Debug)]
struct SpaceUsage {
    used: u64,
}

#[derive(Deserialize, Debug)]
struct Account {
    name: AccountName,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize, Debug)]
struct AccountName {
    display_name: String,
}

#[derive(Serialize)]
struct ListFolderArg<'a> {
    path: &'a str,
    recursive: bool,
    include_deleted: bool,
}

fn display_path(display: Option<String>, lower: Option<String>) -> String {
    display.or(lower).unwrap_or_default()
}

impl From<Metadata> for RemoteEntry {
    fn from(metadata: Metadata) -> Self {
        match metadata {
            Metadata::File(f) => RemoteEntry::File(FileEntry {
                path: display_path(f.path_display, f.path_lower),
                id: f.id,
                size: f.size,
                modified: f.server_modified,
                content_hash: f.content_hash,
            }),
            Metadata::Folder(f) => RemoteEntry::Folder(FolderEntry {
                path: display_path(f.path_display, f.path_lower),
                id: f.id,
            }),
            Metadata::Deleted(d) => RemoteEntry::Deleted(DeletedEntry {
                path: display_path(d.path_display, d.path_lower),
            }),
            Metadata::Other => RemoteEntry::Unknown,
        }
    }
}

impl From<ListFolderResult> for ListPage {
    fn from(result: ListFolderResult) -> Self {
        ListPage {
            entries: result.entries.into_iter().map(RemoteEntry::from).collect(),
            cursor: result.cursor,
            has_more: result.has_more,
        }
    }
}

/// The API addresses the whole account as `""`, not `"/"`.
pub fn normalize_root(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Dropbox backend authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct DropboxRemote {
    client: reqwest::Client,
    token: String,
    api_url: String,
    content_url: String,
}

impl DropboxRemote {
    pub fn new(settings: &RemoteSettings) -> Result<Self, SnapshotError> {
        if settings.token.trim().is_empty() {
            return Err(SnapshotError::Config(
                "no access token configured for dropbox".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("dsnapshot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            token: settings.token.trim().to_string(),
            api_url: settings
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            content_url: settings
                .content_url
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// Sends an RPC request and returns the successful response.
    async fn rpc(
        &self,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, SnapshotError> {
        let url = format!("{}/2/{}", self.api_url, endpoint);
        debug!("POST {}", url);
        let request = self.client.post(&url).bearer_auth(&self.token);
        let request = match body {
            Some(body) => request.json(&body),
            None => request.header(CONTENT_TYPE, "application/json").body("null"),
        };
        check_status(request.send().await?).await
    }
}

/// Turns anything but `200 OK` into `SnapshotError::Api`.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SnapshotError> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SnapshotError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Reads and parses a response body. A body that arrives but does not parse
/// is a JSON error, not a transport failure.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, SnapshotError> {
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

#[async_trait]
impl Remote for DropboxRemote {
    fn name(&self) -> &str {
        BACKEND_ID
    }

    async fn list_root(&self, path_prefix: &str) -> Result<ListPage, SnapshotError> {
        let root = normalize_root(path_prefix);
        let arg = ListFolderArg {
            path: &root,
            recursive: true,
            include_deleted: false,
        };
        let response = self
            .rpc("files/list_folder", Some(serde_json::to_value(&arg)?))
            .await?;
        Ok(decode::<ListFolderResult>(response).await?.into())
    }

    async fn list_continue(&self, cursor: &str) -> Result<ListPage, SnapshotError> {
        let response = self
            .rpc("files/list_folder/continue", Some(json!({ "cursor": cursor })))
            .await?;
        Ok(decode::<ListFolderResult>(response).await?.into())
    }

    async fn total_remote_bytes_used(&self) -> Result<u64, SnapshotError> {
        let response = self.rpc("users/get_space_usage", None).await?;
        Ok(decode::<SpaceUsage>(response).await?.used)
    }

    async fn download_file(&self, entry_id: &str) -> Result<ByteStream, SnapshotError> {
        let url = format!("{}/2/files/download", self.content_url);
        let arg = serde_json::to_string(&json!({ "path": entry_id }))?;
        debug!("POST {} ({})", url, entry_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("Dropbox-API-Arg", arg)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response
            .bytes_stream()
            .map(|piece| piece.map_err(SnapshotError::Transport))
            .boxed())
    }

    async fn current_account_label(&self) -> Result<String, SnapshotError> {
        let response = self.rpc("users/get_current_account", None).await?;
        let account: Account = decode(response).await?;
        Ok(match account.email {
            Some(email) => format!("{} <{}>", account.name.display_name, email),
            None => account.name.display_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response and hands back the raw request.
    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (url, handle)
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    fn remote_at(url: &str) -> DropboxRemote {
        DropboxRemote::new(&RemoteSettings {
            token: "secret-token".to_string(),
            api_url: Some(url.to_string()),
            content_url: Some(url.to_string()),
        })
        .unwrap()
    }

    const LIST_RESPONSE: &str = r#"{
        "entries": [
            {".tag": "folder", "name": "Docs", "path_lower": "/docs", "path_display": "/Docs", "id": "id:f1"},
            {".tag": "file", "name": "a.txt", "path_lower": "/docs/a.txt", "path_display": "/Docs/a.txt",
             "id": "id:a1", "client_modified": "2019-05-01T09:00:00Z", "server_modified": "2019-05-01T10:00:00Z",
             "rev": "015", "size": 5120, "content_hash": "e3b0"},
            {".tag": "deleted", "name": "old.txt", "path_lower": "/docs/old.txt", "path_display": "/Docs/old.txt"}
        ],
        "cursor": "AAE-cursor",
        "has_more": true
    }"#;

    #[test]
    fn test_parse_list_folder_result() {
        let result: ListFolderResult = serde_json::from_str(LIST_RESPONSE).unwrap();
        let page = ListPage::from(result);
        assert_eq!(page.cursor, "AAE-cursor");
        assert!(page.has_more);
        assert_eq!(page.entries.len(), 3);
        match &page.entries[1] {
            RemoteEntry::File(f) => {
                assert_eq!(f.path, "/Docs/a.txt");
                assert_eq!(f.id, "id:a1");
                assert_eq!(f.size, 5120);
                assert_eq!(f.content_hash.as_deref(), Some("e3b0"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(page.entries[2], RemoteEntry::Deleted(_)));
    }

    #[test]
    fn test_normalize_root() {
        assert_eq!(normalize_root(""), "");
        assert_eq!(normalize_root("/"), "");
        assert_eq!(normalize_root("Photos/"), "/Photos");
        assert_eq!(normalize_root("/Photos"), "/Photos");
    }

    #[test]
    fn test_factory_requires_token() {
        assert!(matches!(
            factory(&RemoteSettings::default()),
            Err(SnapshotError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_list_root_sends_bearer_and_path() {
        let (url, server) = serve_once(http_response("200 OK", LIST_RESPONSE)).await;
        let page = remote_at(&url).list_root("/Docs/").await.unwrap();
        assert_eq!(page.entries.len(), 3);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /2/files/list_folder "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret-token"));
        assert!(request.contains(r#""path":"/Docs""#));
        assert!(request.contains(r#""recursive":true"#));
    }

    #[tokio::test]
    async fn test_api_error_is_distinct() {
        let body = r#"{"error_summary":"path/not_found/"}"#;
        let (url, _server) = serve_once(http_response("409 Conflict", body)).await;
        match remote_at(&url).download_file("id:missing").await {
            Err(SnapshotError::Api { status, body }) => {
                assert_eq!(status, 409);
                assert!(body.contains("not_found"));
            }
            Err(e) => panic!("expected api error, got {}", e),
            Ok(_) => panic!("expected api error, got a stream"),
        }
    }

    #[tokio::test]
    async fn test_transport_error_is_distinct() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        match remote_at(&url).total_remote_bytes_used().await {
            Err(e @ SnapshotError::Transport(_)) => assert!(e.is_transient()),
            other => panic!("expected transport error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_not_transient() {
        let (url, _server) = serve_once(http_response("200 OK", r#"{"entries": ["#)).await;
        match remote_at(&url).list_continue("AAE-cursor").await {
            Err(e @ SnapshotError::SerdeJsonError(_)) => assert!(!e.is_transient()),
            other => panic!("expected json error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_only_200_is_success() {
        let (url, _server) = serve_once(http_response("202 Accepted", "{}")).await;
        match remote_at(&url).download_file("id:a1").await {
            Err(SnapshotError::Api { status, .. }) => assert_eq!(status, 202),
            Err(e) => panic!("expected api error, got {}", e),
            Ok(_) => panic!("expected api error, got a stream"),
        }
    }

    #[tokio::test]
    async fn test_download_streams_body() {
        let (url, server) = serve_once(http_response("200 OK", "file-bytes")).await;
        let mut stream = remote_at(&url).download_file("id:a1").await.unwrap();
        let mut body = Vec::new();
        while let Some(piece) = stream.next().await {
            body.extend_from_slice(&piece.unwrap());
        }
        assert_eq!(body, b"file-bytes");

        let request = server.await.unwrap();
        assert!(request.contains(r#"{"path":"id:a1"}"#));
    }
}
