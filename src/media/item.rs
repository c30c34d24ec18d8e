// Sunkfin Core - offline downloads for the Sunkfin media client
// Copyright (C) 2025 Sunkfin contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Media item DTO persisted as the download sidecar

use crate::server::{Credential, ServerEndpoint};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// Server ticks are 100ns units
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Kind of library item
///
/// Unknown kinds are preserved verbatim so a sidecar written by a newer
/// server round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemKind {
    Movie,
    Episode,
    Series,
    Season,
    BoxSet,
    Video,
    Folder,
    CollectionFolder,
    Other(String),
}

impl ItemKind {
    pub fn as_str(&self) -> &str {
        match self {
            ItemKind::Movie => "Movie",
            ItemKind::Episode => "Episode",
            ItemKind::Series => "Series",
            ItemKind::Season => "Season",
            ItemKind::BoxSet => "BoxSet",
            ItemKind::Video => "Video",
            ItemKind::Folder => "Folder",
            ItemKind::CollectionFolder => "CollectionFolder",
            ItemKind::Other(s) => s,
        }
    }

    /// Whether the item has a playable payload of its own
    pub fn is_playable(&self) -> bool {
        matches!(self, ItemKind::Movie | ItemKind::Episode | ItemKind::Video)
    }
}

impl From<String> for ItemKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Movie" => ItemKind::Movie,
            "Episode" => ItemKind::Episode,
            "Series" => ItemKind::Series,
            "Season" => ItemKind::Season,
            "BoxSet" => ItemKind::BoxSet,
            "Video" => ItemKind::Video,
            "Folder" => ItemKind::Folder,
            "CollectionFolder" => ItemKind::CollectionFolder,
            _ => ItemKind::Other(s),
        }
    }
}

impl From<ItemKind> for String {
    fn from(kind: ItemKind) -> Self {
        match kind {
            ItemKind::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user watch state attached to an item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserItemData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_position_ticks: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub played_percentage: Option<f64>,

    #[serde(default)]
    pub played: bool,

    #[serde(default)]
    pub is_favorite: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Media item metadata as returned by the server catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MediaItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ItemKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season_name: Option<String>,

    /// Episode number within its season
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_number: Option<i32>,

    /// Season number for episodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_index_number: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_time_ticks: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_year: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<UserItemData>,

    /// Fields not modelled here, kept for lossless round-trips
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MediaItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            id: Some(id.into()),
            name: Some(name.into()),
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Name to show in lists
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown Media")
    }

    /// Runtime in whole seconds
    pub fn runtime_seconds(&self) -> Option<i64> {
        self.run_time_ticks.map(|ticks| ticks / TICKS_PER_SECOND)
    }

    /// Runtime as "1h 5m" or "42m"
    pub fn format_runtime(&self) -> Option<String> {
        self.runtime_seconds().map(format_runtime)
    }

    /// Case-insensitive name match; an empty query matches everything
    pub fn matches_query(&self, query: &str) -> bool {
        let query = query.trim();
        if query.is_empty() {
            return true;
        }
        match &self.name {
            Some(name) => name.to_lowercase().contains(&query.to_lowercase()),
            None => false,
        }
    }

    /// Primary artwork URL for this item
    pub fn primary_image_url(
        &self,
        server: &ServerEndpoint,
        credential: Option<&Credential>,
    ) -> Result<Option<url::Url>> {
        let Some(id) = self.id.as_deref() else {
            return Ok(None);
        };
        server
            .item_resource_url(id, &["Images", "Primary"], credential)
            .map(Some)
    }

    /// Ordering used for episode lists: season, then episode, then name
    pub fn episode_order(&self, other: &Self) -> Ordering {
        let key = |item: &Self| {
            (
                item.parent_index_number.unwrap_or(i32::MAX),
                item.index_number.unwrap_or(i32::MAX),
            )
        };
        key(self)
            .cmp(&key(other))
            .then_with(|| self.display_name().cmp(other.display_name()))
    }
}

/// Format a duration in seconds the way list rows show it
pub fn format_runtime(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}
