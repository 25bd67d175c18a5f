//! Mapping release records onto HelmRelease status

use helmfast_core::{Release, ReleaseStatus};

use crate::crd::{HelmReleaseStatus, ReleaseState};

/// Snapshot of a release record as the controller reports it
#[derive(Debug, Clone)]
pub struct ReleaseView {
    pub version: i64,
    pub description: String,
    pub notes: String,
    pub status: ReleaseStatus,
}

impl From<&Release> for ReleaseView {
    fn from(release: &Release) -> Self {
        Self {
            version: release.version,
            description: release.description.clone(),
            notes: release.notes.clone(),
            status: release.status,
        }
    }
}

impl ReleaseView {
    /// Only deployed releases have their object set enforced
    pub fn locked(&self) -> bool {
        self.status.is_deployed()
    }

    /// Canonical mapping of a Helm status onto the CR state
    pub fn state(&self) -> ReleaseState {
        match self.status {
            ReleaseStatus::Deployed => ReleaseState::Deployed,
            ReleaseStatus::Failed => ReleaseState::Failed,
            ReleaseStatus::Uninstalled => ReleaseState::Uninstalled,
            status if status.is_transitioning() => ReleaseState::Transitioning,
            _ => ReleaseState::Unknown,
        }
    }

    /// Write this view into a CR status
    pub fn apply_to(&self, status: &mut HelmReleaseStatus) {
        status.state = self.state();
        status.version = Some(self.version);
        status.description = if self.description.is_empty() {
            None
        } else {
            Some(self.description.clone())
        };
        status.notes = if self.notes.is_empty() {
            None
        } else {
            Some(self.notes.clone())
        };
    }
}
