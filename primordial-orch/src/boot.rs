//! Proxy boot: the one moment real secrets cross into the VM.
//!
//! The binary goes up first, mode 0700, owned by the privileged user. The
//! configuration — session token, route table, real keys — is written to
//! the spawned process's standard input and nowhere else: not argv, not
//! environment, not disk. The host zeroizes its copies as soon as the
//! write is handed off. The boot is not done until the proxy has printed
//! its readiness marker *and* the first route port accepts a TCP
//! connection; both waits share one bounded deadline.

use crate::OrchConfig;
use primordial_core::error::{SandboxError, VaultError};
use primordial_core::manifest::Manifest;
use primordial_core::vm::{SpawnRequest, Vm, VmProcess, VmUser};
use primordial_proxy::{ProxyConfig, READY_PREFIX, RouteConfig};
use primordial_vault::Secret;
use std::collections::BTreeMap;
use zeroize::{Zeroize, Zeroizing};

/// A booted proxy: the session token, the per-provider port map, and the
/// running process.
pub struct ProxyBoot {
    /// The per-session placeholder token (`sess-` + 128 bits hex).
    pub token: String,
    /// provider name → loopback port.
    pub ports: BTreeMap<String, u16>,
    /// The proxy process. Held for the session's lifetime.
    pub process: Box<dyn VmProcess>,
}

/// Generate the per-session placeholder token: 128 bits, hex, prefixed so
/// a leaked value is recognizable as a placeholder rather than a real key.
pub fn generate_session_token() -> Result<String, SandboxError> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes)
        .map_err(|_| SandboxError::ProxyStart("entropy source failed".into()))?;
    Ok(format!("sess-{}", hex::encode(bytes)))
}

/// Upload, configure, and start the proxy; wait for readiness.
pub async fn start(
    vm: &dyn Vm,
    manifest: &Manifest,
    mut secrets: BTreeMap<String, Secret>,
    config: &OrchConfig,
) -> Result<ProxyBoot, SandboxError> {
    let binary = tokio::fs::read(&config.proxy_binary)
        .await
        .map_err(|e| SandboxError::ProxyStart(format!("proxy binary unreadable: {e}")))?;
    crate::bounded("proxy upload", config.timeouts.upload, async {
        vm.upload(&config.proxy_guest_path, &binary, 0o700, VmUser::Privileged)
            .await
    })
    .await?;

    let token = generate_session_token()?;

    let mut ports = BTreeMap::new();
    let mut routes = Vec::with_capacity(manifest.providers.len());
    for (i, provider) in manifest.providers.iter().enumerate() {
        let port = config
            .base_port
            .checked_add(i as u16)
            .ok_or_else(|| SandboxError::ProxyStart("port range exhausted".into()))?;
        let secret = secrets
            .remove(&provider.name)
            .ok_or_else(|| VaultError::MissingKey {
                provider: provider.name.clone(),
                key_id: primordial_vault::DEFAULT_KEY_ID.to_string(),
            })?;
        let secret_text = secret
            .with_bytes(|b| String::from_utf8(b.to_vec()))
            .map_err(|_| SandboxError::ProxyStart("secret is not valid utf-8".into()))?;
        ports.insert(provider.name.clone(), port);
        routes.push(RouteConfig {
            provider: provider.name.clone(),
            listen_port: port,
            upstream_host: provider.domain.clone(),
            upstream_port: 443,
            auth_header: provider.auth_style.to_string(),
            secret: secret_text,
            upstream_tls: true,
        });
    }

    let mut proxy_config = ProxyConfig {
        session_token: token.clone(),
        routes,
        socket_timeout_secs: (config.timeouts.proxy_socket.as_millis() / 1000).max(1),
    };
    let payload = Zeroizing::new(
        serde_json::to_vec(&proxy_config)
            .map_err(|e| SandboxError::ProxyStart(format!("config serialization: {e}")))?,
    );

    let spawn = SpawnRequest {
        argv: vec![config.proxy_guest_path.clone()],
        user: VmUser::Privileged,
        env: BTreeMap::new(),
        stdin_payload: Some(payload.to_vec()),
    };
    let spawn_result = vm.spawn(spawn).await;

    // The write is handed off; drop the host's copies now. The proxy
    // process owns the only in-VM copy for the rest of the session.
    for route in &mut proxy_config.routes {
        route.secret.zeroize();
    }
    drop(payload);

    let mut process = spawn_result.map_err(|e| SandboxError::ProxyStart(e.to_string()))?;

    let first_port = ports
        .values()
        .next()
        .copied()
        .ok_or_else(|| SandboxError::ProxyStart("no providers, no proxy".into()))?;
    crate::bounded("proxy readiness", config.timeouts.proxy_ready, async {
        loop {
            match process.next_stderr_line().await? {
                Some(line) if line.starts_with(READY_PREFIX) => break,
                Some(_) => continue,
                None => {
                    return Err(SandboxError::ProxyStart(
                        "proxy exited before readiness".into(),
                    ));
                }
            }
        }
        // The marker says every listener is bound; confirm the first one
        // answers before anything else runs in the VM.
        while !vm.probe_tcp(first_port).await? {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        Ok(())
    })
    .await?;

    tracing::debug!(ports = ?ports.values().collect::<Vec<_>>(), "proxy ready");
    Ok(ProxyBoot {
        token,
        ports,
        process,
    })
}
