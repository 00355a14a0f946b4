//! Direct download from configured file hosters

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH};
use reqwest::{Client, redirect};
use tracing::{debug, error, info, warn};

use super::task::{DirectDownloadTask, TaskRegistry};
use super::{DownloadMethod, DownloadMethodError, new_token};
use crate::config::{DirectDownloadSettings, FileHosterInfo, LibraryPaths};
use crate::db::{DownloadItem, DownloadType};
use crate::services::events::EventBus;
use crate::services::file_utils::{dir_size, sanitize_for_filename};

const USER_AGENT: &str = concat!("mediaflow/", env!("CARGO_PKG_VERSION"));

/// HTTP client for file hosters; `jar` keeps a login session
fn http_client(jar: Option<Arc<Jar>>) -> reqwest::Result<Client> {
    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .redirect(redirect::Policy::limited(10))
        .connect_timeout(Duration::from_secs(30));
    if let Some(jar) = jar {
        builder = builder.cookie_provider(jar);
    }
    builder.build()
}

pub struct DirectDownloadMethod {
    client: Client,
    settings: DirectDownloadSettings,
    paths: LibraryPaths,
    registry: TaskRegistry,
    events: EventBus,
}

impl DirectDownloadMethod {
    pub fn new(
        settings: DirectDownloadSettings,
        paths: LibraryPaths,
        registry: TaskRegistry,
        events: EventBus,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(None)?,
            settings,
            paths,
            registry,
            events,
        })
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    fn hoster_for(&self, url: &str) -> Option<&FileHosterInfo> {
        self.settings.filehosters.iter().find(|h| h.can_handle(url))
    }

    /// Log in on `hoster` and return a client carrying the session cookies
    pub async fn authenticate(&self, hoster: &FileHosterInfo) -> Result<Client, DownloadMethodError> {
        let login_url = hoster.login_url.as_deref().unwrap_or_default();
        let failure = || format!("An error occurred while authenticating on provider: {}", hoster.name);

        let session = http_client(Some(Arc::new(Jar::default()))).map_err(|e| {
            error!(hoster = %hoster.name, error = %e, "Failed to build session client");
            DownloadMethodError::StartFailed(failure())
        })?;

        let response = session
            .post(login_url)
            .form(&hoster.credentials)
            .send()
            .await
            .map_err(|e| {
                error!(hoster = %hoster.name, error = %e, "Authentication request failed");
                DownloadMethodError::StartFailed(failure())
            })?;

        if !response.status().is_success() {
            error!(hoster = %hoster.name, status = %response.status(), "Authentication rejected");
            return Err(DownloadMethodError::StartFailed(failure()));
        }

        let cookies = response.cookies().count();
        if cookies == 0 {
            error!(hoster = %hoster.name, "No cookies retrieved while authenticating");
            return Err(DownloadMethodError::StartFailed(format!(
                "No cookies retrieved while authenticating on: {}",
                hoster.name
            )));
        }

        debug!(hoster = %hoster.name, cookies, "Authenticated");
        Ok(session)
    }

    /// Probe the file behind `item.url`, filling in its name and size.
    /// Downloadable only with a non-empty name and a positive size.
    /// `session` is the authenticated client of the hoster, if it needs one.
    pub async fn check_downloadability(&self, item: &mut DownloadItem, session: Option<&Client>) -> bool {
        let client = session.unwrap_or(&self.client);
        let response = match client.head(&item.url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %item.url, error = %e, "Downloadability check failed");
                return false;
            }
        };

        if !response.status().is_success() {
            warn!(url = %item.url, status = %response.status(), "Downloadability check refused");
            return false;
        }

        let headers = response.headers();
        item.total_size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0);

        let file_name = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(content_disposition_filename)
            .or_else(|| {
                response
                    .url()
                    .path_segments()
                    .and_then(|mut segments| segments.next_back())
                    .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).unwrap_or_else(|_| s.to_string()))
            })
            .unwrap_or_default();
        item.name = sanitize_for_filename(&file_name);

        debug!(url = %item.url, name = %item.name, total_size = item.total_size, "Probed file");
        !item.name.is_empty() && item.total_size > 0
    }
}

#[async_trait]
impl DownloadMethod for DirectDownloadMethod {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn can_handle_url(&self, url: &str) -> bool {
        self.hoster_for(url).is_some()
    }

    fn can_handle_type(&self, download_type: DownloadType) -> bool {
        download_type == DownloadType::Direct
    }

    async fn start(&self, item: &mut DownloadItem) -> Result<(), DownloadMethodError> {
        let hoster = self.hoster_for(&item.url).ok_or_else(|| {
            DownloadMethodError::NotDownloadable(format!("No file hoster handles {}", item.url))
        })?;

        let session = if hoster.requires_authentication() {
            Some(self.authenticate(hoster).await?)
        } else {
            None
        };

        if !self.check_downloadability(item, session.as_ref()).await {
            warn!(url = %item.url, "No file found");
            return Err(DownloadMethodError::NotDownloadable(format!(
                "No file found at url {}",
                item.url
            )));
        }

        item.download_type = DownloadType::Direct;
        item.token = new_token("ddl");

        let staging = self.paths.staging_dir(&item.token);
        tokio::fs::create_dir_all(&staging).await.map_err(|e| {
            error!(staging = %staging.display(), error = %e, "Failed to create staging directory");
            DownloadMethodError::StartFailed(format!("Unexpected error occurred for: {}", item.url))
        })?;

        let task = DirectDownloadTask::new(
            item.id,
            item.token.clone(),
            item.url.clone(),
            staging.join(&item.name),
        );
        let client = session.unwrap_or_else(|| self.client.clone());
        task.spawn(client, self.registry.clone(), self.events.clone());

        info!(token = %item.token, hoster = %hoster.name, name = %item.name, "Direct download launched");
        Ok(())
    }

    async fn cancel(&self, item: &DownloadItem) -> bool {
        self.registry.cancel(&item.token)
    }

    async fn archive(&self, _item: &DownloadItem) -> bool {
        true
    }

    async fn downloaded_size(&self, item: &DownloadItem) -> u64 {
        dir_size(&self.paths.staging_dir(&item.token))
    }
}

/// File name of a `Content-Disposition` header, preferring the RFC 5987
/// `filename*` form
fn content_disposition_filename(value: &str) -> Option<String> {
    let mut plain = None;
    for param in value.split(';').map(str::trim) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let raw = raw.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let encoded = raw.rsplit("''").next().unwrap_or(raw);
                if let Ok(decoded) = urlencoding::decode(encoded) {
                    return Some(decoded.into_owned());
                }
            }
            "filename" if !raw.is_empty() => plain = Some(raw.to_string()),
            _ => {}
        }
    }
    plain
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn hoster(server: &MockServer, login: bool) -> FileHosterInfo {
        FileHosterInfo {
            name: "testhoster".to_string(),
            url_pattern: format!("^{}/", regex::escape(&server.uri())),
            login_url: login.then(|| format!("{}/login", server.uri())),
            credentials: HashMap::from([("user".to_string(), "me".to_string())]),
        }
    }

    fn method_for(hosters: Vec<FileHosterInfo>, downloads: &std::path::Path) -> DirectDownloadMethod {
        DirectDownloadMethod::new(
            DirectDownloadSettings { filehosters: hosters },
            LibraryPaths::new(downloads, downloads.join("media")),
            TaskRegistry::new(),
            EventBus::default(),
        )
        .unwrap()
    }

    async fn mount_file(server: &MockServer, route: &str, size: usize) {
        Mock::given(method("HEAD"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", size.to_string().as_str())
                    .set_body_bytes(vec![0u8; size]),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; size]))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_name_from_last_segment_and_size_from_length() {
        let server = MockServer::start().await;
        mount_file(&server, "/files/1024.rnd", 1_048_576).await;
        let dir = tempfile::tempdir().unwrap();
        let method = method_for(vec![hoster(&server, false)], dir.path());

        let mut item = DownloadItem::new(format!("{}/files/1024.rnd", server.uri()), None);
        assert!(method.check_downloadability(&mut item, None).await);
        assert_eq!(item.total_size, 1_048_576);
        assert_eq!(item.name, "1024.rnd");
    }

    #[tokio::test]
    async fn test_content_disposition_wins() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-disposition", "attachment; filename=\"My Movie.mkv\"")
                    .insert_header("content-length", "10")
                    .set_body_bytes(vec![0u8; 10]),
            )
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let method = method_for(vec![hoster(&server, false)], dir.path());

        let mut item = DownloadItem::new(format!("{}/dl?id=42", server.uri()), None);
        assert!(method.check_downloadability(&mut item, None).await);
        assert_eq!(item.name, "My Movie.mkv");
    }

    #[tokio::test]
    async fn test_not_downloadable() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let method = method_for(vec![hoster(&server, false)], dir.path());

        for route in ["/lalala", "/empty", "/"] {
            let mut item = DownloadItem::new(format!("{}{}", server.uri(), route), None);
            assert!(!method.check_downloadability(&mut item, None).await, "{}", route);
            assert_matches!(
                method.start(&mut item).await,
                Err(DownloadMethodError::NotDownloadable(_))
            );
        }
    }

    #[tokio::test]
    async fn test_unmatched_url_is_not_handled() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let method = method_for(vec![hoster(&server, false)], dir.path());

        assert!(method.can_handle_url(&format!("{}/a.bin", server.uri())));
        assert!(!method.can_handle_url("http://elsewhere.example/a.bin"));
        assert!(method.can_handle_type(DownloadType::Direct));
        assert!(!method.can_handle_type(DownloadType::PeerToPeer));

        let mut item = DownloadItem::new("http://elsewhere.example/a.bin", None);
        assert_matches!(
            method.start(&mut item).await,
            Err(DownloadMethodError::NotDownloadable(_))
        );
    }

    #[tokio::test]
    async fn test_authentication_requires_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .and(body_string_contains("user=me"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let method = method_for(vec![hoster(&server, true)], dir.path());

        let mut item = DownloadItem::new(format!("{}/file.bin", server.uri()), None);
        assert_matches!(
            method.start(&mut item).await,
            Err(DownloadMethodError::StartFailed(msg)) if msg.contains("No cookies")
        );
    }

    #[tokio::test]
    async fn test_authentication_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(403).insert_header("set-cookie", "sid=1"))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let method = method_for(vec![hoster(&server, true)], dir.path());

        let mut item = DownloadItem::new(format!("{}/file.bin", server.uri()), None);
        assert_matches!(method.start(&mut item).await, Err(DownloadMethodError::StartFailed(_)));
    }

    #[tokio::test]
    async fn test_start_downloads_into_staging() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).append_header("set-cookie", "sid=abc; Path=/; HttpOnly"))
            .mount(&server)
            .await;
        // the file is only served to the logged-in session
        Mock::given(method("HEAD"))
            .and(path("/file.bin"))
            .and(header("cookie", "sid=abc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "4096")
                    .set_body_bytes(vec![0u8; 4096]),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("cookie", "sid=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let method = method_for(vec![hoster(&server, true)], dir.path());
        let mut events = method.events.receiver();

        let mut item = DownloadItem::new(format!("{}/file.bin", server.uri()), None);
        method.start(&mut item).await.unwrap();

        assert_eq!(item.download_type, DownloadType::Direct);
        assert!(item.token.starts_with("_ddl"));
        assert_eq!(item.total_size, 4096);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_matches!(event, crate::services::events::DownloadEvent::ItemDownloaded(id) if id == item.id);
        assert_eq!(method.downloaded_size(&item).await, 4096);
        assert!(!method.cancel(&item).await);
        assert!(method.archive(&item).await);
    }

    #[tokio::test]
    async fn test_downloaded_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let method = method_for(Vec::new(), dir.path());

        let mut item = DownloadItem::new("http://host/x", None);
        item.token = "_ddlnested".to_string();
        let mut current = dir.path().join(&item.token);
        for i in 1..=3 {
            std::fs::create_dir_all(&current).unwrap();
            std::fs::write(current.join(format!("Video {}.mkv", i)), i.to_string()).unwrap();
            current = current.join("sub");
        }

        assert_eq!(method.downloaded_size(&item).await, 3);

        item.token = "_ddlmissing".to_string();
        assert_eq!(method.downloaded_size(&item).await, 0);
    }

    #[test]
    fn test_content_disposition_filename() {
        assert_eq!(
            content_disposition_filename("attachment; filename*=UTF-8''caf%C3%A9.mkv; filename=\"cafe.mkv\""),
            Some("café.mkv".to_string())
        );
        assert_eq!(content_disposition_filename("inline"), None);
    }
}
