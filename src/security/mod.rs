// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Guard rails shared by the registry and the storage layer.
//!
//! - [`locks`]: poison-tolerant access to the download registry's lock
//! - [`paths`]: confinement of client-supplied file names to the storage root

pub mod locks;
pub mod paths;

pub use locks::{resilient_read, resilient_write};
pub use paths::{confine, is_plain_file_name};
