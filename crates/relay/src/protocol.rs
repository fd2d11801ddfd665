// Protocol version negotiation.
//
// Clients name the protocol they speak when creating a session. The relay
// accepts the current version and the one before it, and answers anything
// else with UPGRADE_REQUIRED.

use labsync_common::protocol::ws::{CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
use serde_json::json;

use crate::error::{ErrorCode, RelayError};

pub const CURRENT_VERSION: &str = CURRENT_PROTOCOL_VERSION;

pub fn is_supported(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// Supported versions, newest first.
pub fn supported_versions() -> &'static [&'static str] {
    SUPPORTED_PROTOCOL_VERSIONS
}

/// `Ok(())` for a supported version, otherwise an `UPGRADE_REQUIRED` error
/// listing what the relay accepts.
pub fn require_supported(version: &str) -> Result<(), RelayError> {
    if is_supported(version) {
        Ok(())
    } else {
        Err(RelayError::new(
            ErrorCode::UpgradeRequired,
            format!("unsupported protocol version: {version}"),
        )
        .with_details(json!({
            "requested_version": version,
            "supported_versions": SUPPORTED_PROTOCOL_VERSIONS,
            "current_version": CURRENT_VERSION,
        })))
    }
}
