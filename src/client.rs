//! HTTP client for the Google Photos Library API.
//!
//! [`PhotosApi`] is the seam the rest of the crate talks through; the
//! orchestrator and album manager never see reqwest. The trait is
//! implemented here for the real service and by `testing::FakePhotosApi`
//! for tests.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SyncError};
use crate::models::{CloudAlbum, MediaItem};

/// Maximum number of media item ids per `batchAddMediaItems` request.
pub const ADD_BATCH_LIMIT: usize = 50;

const DEFAULT_BASE_URL: &str = "https://photoslibrary.googleapis.com/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Bounded asynchronous operations against the remote photos service.
///
/// Every method may fail with an error classified by
/// [`SyncError::class`](crate::error::SyncError::class); callers decide
/// retry behaviour from the class, never from message text.
#[async_trait]
pub trait PhotosApi: Send + Sync {
    /// Lists all albums (paginating internally).
    async fn list_albums(&self) -> Result<Vec<CloudAlbum>>;

    /// Creates a new, empty album with the given title.
    async fn create_album(&self, title: &str) -> Result<CloudAlbum>;

    /// Uploads a file's bytes and returns the raw upload token.
    async fn upload_media_data(&self, path: &Path) -> Result<String>;

    /// Exchanges an upload token for a media item, optionally placing it
    /// into an album.
    async fn create_media_item(
        &self,
        album_id: Option<&str>,
        upload_token: &str,
        file_name: &str,
    ) -> Result<MediaItem>;

    /// Adds up to [`ADD_BATCH_LIMIT`] existing media items to an album.
    async fn batch_add_to_album(&self, album_id: &str, media_item_ids: &[String]) -> Result<()>;

    /// Lists the media items of an album (paginating internally).
    async fn get_album_items(&self, album_id: &str) -> Result<Vec<MediaItem>>;
}

/// Client for the Google Photos Library API v1.
///
/// Authenticates with a pre-obtained OAuth access token; acquiring and
/// refreshing tokens is the caller's concern.
#[derive(Debug, Clone)]
pub struct GooglePhotosClient {
    client: reqwest::Client,
    base_url: Url,
}

impl GooglePhotosClient {
    /// Creates a client for the production endpoint.
    pub fn new(access_token: &str) -> Result<Self> {
        Self::with_base_url(access_token, DEFAULT_BASE_URL)
    }

    /// Creates a client against a custom endpoint (used by tests).
    pub fn with_base_url(access_token: &str, base_url: &str) -> Result<Self> {
        if access_token.is_empty() {
            return Err(SyncError::InvalidAccessToken);
        }

        let base_url = Url::parse(base_url)?;

        let mut headers = HeaderMap::new();
        let header_value = HeaderValue::from_str(&format!("Bearer {access_token}"))
            .map_err(|_| SyncError::InvalidAccessToken)?;
        headers.insert(AUTHORIZATION, header_value);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { client, base_url })
    }

    /// Handles an HTTP response, parsing success responses or extracting
    /// error details from the standard Google error envelope.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            Err(api_error(status.as_u16(), response.text().await.unwrap_or_default()))
        }
    }
}

fn api_error(status: u16, body: String) -> SyncError {
    #[derive(Deserialize)]
    struct ErrorEnvelope {
        error: ErrorBody,
    }
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        code: Option<u16>,
        #[serde(default)]
        message: Option<String>,
    }

    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => SyncError::Api {
            status: envelope.error.code.unwrap_or(status),
            message: envelope.error.message.unwrap_or(body),
        },
        Err(_) => SyncError::Api {
            status,
            message: body,
        },
    }
}

/// Maps a gRPC status code from a per-item result to the equivalent
/// HTTP status, so per-item failures classify like whole-request ones.
fn grpc_to_http(code: i32) -> u16 {
    match code {
        3 => 400,  // INVALID_ARGUMENT
        7 => 403,  // PERMISSION_DENIED
        4 => 504,  // DEADLINE_EXCEEDED
        8 => 429,  // RESOURCE_EXHAUSTED
        14 => 503, // UNAVAILABLE
        _ => 500,
    }
}

fn mime_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("heic") | Some("heif") => "image/heic",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListAlbumsResponse {
    #[serde(default)]
    albums: Vec<CloudAlbum>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateAlbumRequest<'a> {
    album: NewAlbum<'a>,
}

#[derive(Debug, Serialize)]
struct NewAlbum<'a> {
    title: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchCreateRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    album_id: Option<&'a str>,
    new_media_items: Vec<NewMediaItem<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewMediaItem<'a> {
    simple_media_item: SimpleMediaItem<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimpleMediaItem<'a> {
    upload_token: &'a str,
    file_name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchCreateResponse {
    #[serde(default)]
    new_media_item_results: Vec<NewMediaItemResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewMediaItemResult {
    #[serde(default)]
    status: Option<ItemStatus>,
    #[serde(default)]
    media_item: Option<MediaItem>,
}

#[derive(Debug, Deserialize)]
struct ItemStatus {
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchAddRequest<'a> {
    media_item_ids: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    album_id: &'a str,
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    media_items: Vec<MediaItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[async_trait]
impl PhotosApi for GooglePhotosClient {
    async fn list_albums(&self) -> Result<Vec<CloudAlbum>> {
        let url = self.base_url.join("v1/albums")?;
        let mut albums = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.client.get(url.clone()).query(&[("pageSize", "50")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let response = request.send().await?;
            let page: ListAlbumsResponse = Self::handle_response(response).await?;

            albums.extend(page.albums);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(albums),
            }
        }
    }

    async fn create_album(&self, title: &str) -> Result<CloudAlbum> {
        let url = self.base_url.join("v1/albums")?;
        let body = CreateAlbumRequest {
            album: NewAlbum { title },
        };
        let response = self.client.post(url).json(&body).send().await?;
        Self::handle_response(response).await
    }

    async fn upload_media_data(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let url = self.base_url.join("v1/uploads")?;

        let response = self
            .client
            .post(url)
            .timeout(UPLOAD_TIMEOUT)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("X-Goog-Upload-Content-Type", mime_type_for(path))
            .header("X-Goog-Upload-Protocol", "raw")
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(body)
        } else {
            Err(api_error(status.as_u16(), body))
        }
    }

    async fn create_media_item(
        &self,
        album_id: Option<&str>,
        upload_token: &str,
        file_name: &str,
    ) -> Result<MediaItem> {
        let url = self.base_url.join("v1/mediaItems:batchCreate")?;
        let body = BatchCreateRequest {
            album_id,
            new_media_items: vec![NewMediaItem {
                simple_media_item: SimpleMediaItem {
                    upload_token,
                    file_name,
                },
            }],
        };
        let response = self.client.post(url).json(&body).send().await?;
        let mut parsed: BatchCreateResponse = Self::handle_response(response).await?;

        let result = parsed
            .new_media_item_results
            .pop()
            .ok_or_else(|| SyncError::Api {
                status: 500,
                message: "batchCreate returned no results".into(),
            })?;

        match result.media_item {
            Some(item) => Ok(item),
            None => {
                let status = result.status.unwrap_or(ItemStatus {
                    code: None,
                    message: None,
                });
                Err(SyncError::Api {
                    status: status.code.map(grpc_to_http).unwrap_or(500),
                    message: status
                        .message
                        .unwrap_or_else(|| "media item creation failed".into()),
                })
            }
        }
    }

    async fn batch_add_to_album(&self, album_id: &str, media_item_ids: &[String]) -> Result<()> {
        if media_item_ids.len() > ADD_BATCH_LIMIT {
            return Err(SyncError::invalid_argument(format!(
                "batchAddMediaItems accepts at most {ADD_BATCH_LIMIT} items, got {}",
                media_item_ids.len()
            )));
        }

        let url = self
            .base_url
            .join(&format!("v1/albums/{album_id}:batchAddMediaItems"))?;
        let body = BatchAddRequest {
            media_item_ids,
        };
        let response = self.client.post(url).json(&body).send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(api_error(
                status.as_u16(),
                response.text().await.unwrap_or_default(),
            ))
        }
    }

    async fn get_album_items(&self, album_id: &str) -> Result<Vec<MediaItem>> {
        let url = self.base_url.join("v1/mediaItems:search")?;
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let body = SearchRequest {
                album_id,
                page_size: 100,
                page_token: page_token.as_deref(),
            };
            let response = self.client.post(url.clone()).json(&body).send().await?;
            let page: SearchResponse = Self::handle_response(response).await?;

            items.extend(page.media_items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(items),
            }
        }
    }
}
