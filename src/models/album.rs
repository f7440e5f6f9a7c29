//! Album and media item wire types.

use serde::{Deserialize, Deserializer, Serialize};

/// A remote album as reported by the albums listing.
///
/// Titles are not unique across the cloud; the album manager reconciles
/// same-titled albums into a single target per local directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudAlbum {
    /// Unique album identifier
    pub id: String,

    /// Album title (may be empty for untitled albums)
    #[serde(default)]
    pub title: String,

    /// Number of media items in the album. The API reports this as a
    /// decimal string.
    #[serde(default, deserialize_with = "count_from_string")]
    pub media_items_count: u64,

    /// Web URL of the album
    #[serde(default)]
    pub product_url: Option<String>,
}

impl CloudAlbum {
    /// The key used when reporting this album on a progress stream:
    /// its web URL, falling back to the raw id.
    pub fn display_url(&self) -> &str {
        self.product_url.as_deref().unwrap_or(&self.id)
    }
}

/// A remote media item.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    /// Unique media item identifier
    pub id: String,

    /// Web URL of the item
    #[serde(default)]
    pub product_url: Option<String>,

    /// Filename as stored remotely
    #[serde(default)]
    pub filename: Option<String>,
}

/// The API serialises item counts as strings ("17"); accept both string
/// and number forms.
fn count_from_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Number(u64),
        Text(String),
    }

    match Option::<Count>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Count::Number(n)) => Ok(n),
        Some(Count::Text(s)) => s.parse().map_err(serde::de::Error::custom),
    }
}
