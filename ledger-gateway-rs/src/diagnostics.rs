// ledger-gateway-rs/src/diagnostics.rs
//
// Pre-connection diagnostics and bounded self-repair.
//
// Before a session opens we verify the connection profile parses, identity
// material is present in the wallet, and at least one peer/orderer endpoint
// answers a TCP probe. A missing or corrupt profile is repaired once from
// the configured fallback path; anything else surfaces as a prerequisite
// error.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::{LedgerConfig, LedgerError};

const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Run the full preflight. Endpoint unreachability is fatal only when no
/// endpoint answers at all.
pub async fn preflight(config: &LedgerConfig) -> Result<(), LedgerError> {
    let profile = load_profile_with_repair(config).await?;
    check_identity(config)?;

    let endpoints = collect_endpoints(&profile);
    if endpoints.is_empty() {
        warn!("connection profile lists no peer/orderer endpoints; skipping reachability probe");
        return Ok(());
    }
    let mut reachable = 0usize;
    for endpoint in &endpoints {
        if probe_tcp(endpoint).await {
            reachable += 1;
        } else {
            warn!(endpoint = %endpoint, "ledger endpoint unreachable");
        }
    }
    if reachable == 0 {
        return Err(LedgerError::ChannelUnavailable(format!(
            "none of {} configured endpoints reachable",
            endpoints.len()
        )));
    }
    info!(reachable, total = endpoints.len(), "ledger preflight passed");
    Ok(())
}

async fn load_profile_with_repair(config: &LedgerConfig) -> Result<Value, LedgerError> {
    match read_profile(&config.profile_path) {
        Ok(profile) => Ok(profile),
        Err(primary_err) => {
            let Some(fallback) = &config.profile_fallback else {
                return Err(primary_err);
            };
            warn!(
                profile = %config.profile_path.display(),
                fallback = %fallback.display(),
                "connection profile unusable; repairing from fallback"
            );
            let profile = read_profile(fallback)?;
            if let Some(parent) = config.profile_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(fallback, &config.profile_path).await?;
            Ok(profile)
        }
    }
}

fn read_profile(path: &Path) -> Result<Value, LedgerError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| LedgerError::ProfileInvalid(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| LedgerError::ProfileInvalid(format!("{}: {e}", path.display())))
}

fn check_identity(config: &LedgerConfig) -> Result<(), LedgerError> {
    let identity = config.wallet_path.join(format!("{}.id", config.user_id));
    if !identity.is_file() {
        return Err(LedgerError::IdentityMissing(format!(
            "no identity for {} at {}",
            config.user_id,
            identity.display()
        )));
    }
    Ok(())
}

/// Pull host:port pairs out of the profile's peers/orderers sections.
fn collect_endpoints(profile: &Value) -> Vec<String> {
    let mut out = Vec::new();
    for section in ["peers", "orderers"] {
        if let Some(map) = profile.get(section).and_then(Value::as_object) {
            for node in map.values() {
                if let Some(url) = node.get("url").and_then(Value::as_str) {
                    if let Some(endpoint) = host_port(url) {
                        out.push(endpoint);
                    }
                }
            }
        }
    }
    out
}

fn host_port(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let rest = rest.split('/').next()?;
    if rest.contains(':') {
        Some(rest.to_string())
    } else {
        None
    }
}

async fn probe_tcp(endpoint: &str) -> bool {
    matches!(
        tokio::time::timeout(TCP_PROBE_TIMEOUT, TcpStream::connect(endpoint)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_in(dir: &Path) -> LedgerConfig {
        let mut config = LedgerConfig::for_tests();
        config.profile_path = dir.join("profile.json");
        config.wallet_path = dir.join("wallet");
        config
    }

    fn write_identity(config: &LedgerConfig) {
        std::fs::create_dir_all(&config.wallet_path).unwrap();
        std::fs::write(
            config.wallet_path.join(format!("{}.id", config.user_id)),
            b"{}",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn missing_identity_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(&config.profile_path, json!({"peers": {}}).to_string()).unwrap();
        let err = preflight(&config).await.unwrap_err();
        assert!(matches!(err, LedgerError::IdentityMissing(_)));
    }

    #[tokio::test]
    async fn corrupt_profile_repairs_from_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        write_identity(&config);
        std::fs::write(&config.profile_path, b"{corrupt").unwrap();
        let fallback = dir.path().join("fallback.json");
        std::fs::write(&fallback, json!({"peers": {}}).to_string()).unwrap();
        config.profile_fallback = Some(fallback);

        preflight(&config).await.unwrap();
        // The repaired profile replaced the corrupt one.
        let repaired: Value =
            serde_json::from_str(&std::fs::read_to_string(&config.profile_path).unwrap()).unwrap();
        assert!(repaired.get("peers").is_some());
    }

    #[tokio::test]
    async fn corrupt_profile_without_fallback_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(&config.profile_path, b"{corrupt").unwrap();
        let err = preflight(&config).await.unwrap_err();
        assert!(matches!(err, LedgerError::ProfileInvalid(_)));
    }

    #[test]
    fn endpoint_extraction_handles_scheme_and_path() {
        let profile = json!({
            "peers": {
                "peer0": {"url": "grpcs://peer0.org1:7051"},
                "bare": {"url": "peer1.org1:8051"}
            },
            "orderers": {
                "orderer0": {"url": "grpcs://orderer:7050/some/path"}
            }
        });
        let endpoints = collect_endpoints(&profile);
        assert_eq!(
            endpoints,
            vec!["peer0.org1:7051", "peer1.org1:8051", "orderer:7050"]
        );
    }
}
