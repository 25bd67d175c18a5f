//! Helm release records and payload decoding
//!
//! Helm v3 stores each release revision in a cluster secret of type
//! `helm.sh/release.v1`. The secret's `release` data key holds the release
//! record as base64(gzip(json)); some historical tooling wrapped the payload
//! in base64 twice. The decoder here accepts either form, as well as bare
//! gzip or JSON payloads, by sniffing rather than guessing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;

use crate::error::{CoreError, Result};

/// Secret type distinguishing Helm v3 release secrets
pub const HELM_SECRET_TYPE: &str = "helm.sh/release.v1";

/// Secret label carrying the release name
pub const SECRET_NAME_LABEL: &str = "name";

/// Secret label carrying the release revision number
pub const SECRET_VERSION_LABEL: &str = "version";

/// Secret data key holding the encoded release record
pub const SECRET_DATA_KEY: &str = "release";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Helm release status, as recorded in the release record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    Uninstalled,
    Uninstalling,
    Superseded,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    #[serde(other)]
    #[default]
    Unknown,
}

impl ReleaseStatus {
    /// Only deployed releases are enforced against drift
    pub fn is_deployed(self) -> bool {
        matches!(self, Self::Deployed)
    }

    /// Statuses describing an operation in flight
    pub fn is_transitioning(self) -> bool {
        matches!(
            self,
            Self::Uninstalling | Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback
        )
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deployed => "deployed",
            Self::Failed => "failed",
            Self::Uninstalled => "uninstalled",
            Self::Uninstalling => "uninstalling",
            Self::Superseded => "superseded",
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A single revision of a Helm release, flattened from Helm's record format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub version: i64,
    pub status: ReleaseStatus,
    pub manifest: String,
    pub notes: String,
    pub description: String,
}

/// Wire shape of Helm's release JSON
#[derive(Deserialize)]
struct RawRelease {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    version: i64,
    #[serde(default)]
    manifest: String,
    #[serde(default)]
    info: RawInfo,
}

#[derive(Deserialize, Default)]
struct RawInfo {
    #[serde(default)]
    status: ReleaseStatus,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    description: String,
}

/// Decode a release record from the raw bytes of the secret's `release` key.
///
/// The Kubernetes client has already removed the secret-level base64 layer;
/// what remains is base64(gzip(json)), the historical double-base64 variant,
/// or bare gzip or JSON.
pub fn decode_release(data: &[u8]) -> Result<Release> {
    let mut payload = data.to_vec();

    // At most: base64, base64 again, then gzip. Anything deeper is garbage.
    for _ in 0..3 {
        if payload.starts_with(&GZIP_MAGIC) {
            payload = gunzip(&payload)?;
            break;
        }
        if payload.first() == Some(&b'{') {
            break;
        }
        let text = std::str::from_utf8(&payload)
            .map_err(|e| CoreError::UnrecognisedPayload(e.to_string()))?;
        payload = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            text.trim_end(),
        )?;
    }

    if payload.first() != Some(&b'{') {
        return Err(CoreError::UnrecognisedPayload(
            "payload is neither gzip nor JSON after unwrapping".to_string(),
        ));
    }

    let raw: RawRelease = serde_json::from_slice(&payload)?;
    Ok(Release {
        name: raw.name,
        namespace: raw.namespace,
        version: raw.version,
        status: raw.info.status,
        manifest: raw.manifest,
        notes: raw.info.notes,
        description: raw.info.description,
    })
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(CoreError::Gzip)?;
    Ok(out)
}
