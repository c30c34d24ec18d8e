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


//! Server endpoint and access credential
//!
//! The media server protocol itself lives in the app shell; the core only
//! needs to address an item's byte resource and artwork.

use crate::error::{Result, SunkfinError};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Base URL of a media server, e.g. `https://media.example.com/jellyfin`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerEndpoint {
    base: Url,
}

impl ServerEndpoint {
    /// Parse a server URL; only http and https are accepted
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let mut base = Url::parse(trimmed)?;

        if !matches!(base.scheme(), "http" | "https") {
            return Err(SunkfinError::invalid_input(format!(
                "Unsupported server scheme '{}'",
                base.scheme()
            )));
        }
        if base.cannot_be_a_base() {
            return Err(SunkfinError::invalid_input(format!(
                "Server URL cannot be used as a base: {}",
                trimmed
            )));
        }

        base.set_query(None);
        base.set_fragment(None);

        Ok(Self { base })
    }

    pub fn as_url(&self) -> &Url {
        &self.base
    }

    /// `{server}/Items/{id}/Download?api_key={token}`
    pub fn download_url(&self, item_id: &str, credential: &Credential) -> Result<Url> {
        self.item_resource_url(item_id, &["Download"], Some(credential))
    }

    /// `{server}/Items/{id}/{segments...}` with an optional `api_key` query
    pub fn item_resource_url(
        &self,
        item_id: &str,
        segments: &[&str],
        credential: Option<&Credential>,
    ) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SunkfinError::internal("server URL lost its base"))?;
            path.pop_if_empty();
            path.push("Items");
            path.push(item_id);
            path.extend(segments);
        }
        if let Some(credential) = credential {
            url.query_pairs_mut()
                .append_pair("api_key", credential.expose());
        }
        Ok(url)
    }
}

impl TryFrom<String> for ServerEndpoint {
    type Error = SunkfinError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ServerEndpoint> for String {
    fn from(endpoint: ServerEndpoint) -> Self {
        endpoint.base.to_string()
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)
    }
}

/// Access token sent with every byte request
///
/// `Debug` and `Display` never print the token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}
