// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software Updates
//!
//! Surface for announcing pending server updates to clients and accepting
//! a remote install request.

use thiserror::Error;

/// Update error types.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("no pending update with id {0}")]
    UnknownUpdate(i32),
    #[error("remote installation is disabled for this update")]
    RemoteInstallDisabled,
    #[error("install failed: {0}")]
    InstallFailed(String),
}

/// A downloadable server update, not yet applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    /// Identifier the client echoes back in an install request.
    pub id: i32,
    pub version: String,
    pub notes: String,
    /// Whether clients may trigger the install remotely.
    pub remote_installable: bool,
}

/// Source of pending updates.
pub trait UpdateProvider: Send + Sync {
    /// The currently pending update, if any.
    fn pending(&self) -> Option<PendingUpdate>;

    /// Installs the update with the given id.
    fn install(&self, id: i32) -> Result<(), UpdateError>;
}

/// Provider for builds with no update channel.
#[derive(Debug, Default)]
pub struct NoUpdates;

impl UpdateProvider for NoUpdates {
    fn pending(&self) -> Option<PendingUpdate> {
        None
    }

    fn install(&self, id: i32) -> Result<(), UpdateError> {
        Err(UpdateError::UnknownUpdate(id))
    }
}
