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


//! Media item metadata
//!
//! Models the subset of the media server's item DTO that the offline
//! library needs. The same type is used in memory while a transfer runs and
//! as the on-disk sidecar format, so fields this crate doesn't model are kept
//! in `extra` and written back untouched.

pub mod item;

pub use item::{ItemKind, MediaItem, UserItemData};
