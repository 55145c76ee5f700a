use std::{
    collections::HashMap,
    path::Path,
    sync::{Mutex, OnceLock},
};

use crate::config::{HealthPolicy, ServiceDescriptor, Tier};

/// Global lock for environment variable modifications in tests.
/// Tests that read or modify process-wide variables (`WARDEN_ENV`, `<ID>_HOST`, config
/// expansion inputs) should hold this lock to avoid racing parallel tests.
pub static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Builds a descriptor without going through YAML.
pub fn descriptor(id: &str, port: u16, command: &str, cwd: &Path) -> ServiceDescriptor {
    ServiceDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        port,
        command: command.to_string(),
        cwd: cwd.to_path_buf(),
        health: None,
        tier: Tier::Standard,
        depends_on: Vec::new(),
        conflict_patterns: Vec::new(),
        error_markers: Vec::new(),
        env: HashMap::new(),
    }
}

/// Same as [`descriptor`] with an HTTP health policy on `url`.
pub fn descriptor_with_health(
    id: &str,
    port: u16,
    command: &str,
    cwd: &Path,
    url: &str,
    policy: (std::time::Duration, u32),
) -> ServiceDescriptor {
    let mut descriptor = descriptor(id, port, command, cwd);
    descriptor.health = Some(HealthPolicy {
        url: url.to_string(),
        timeout: policy.0,
        max_attempts: policy.1,
        warmup: std::time::Duration::ZERO,
        lenient_html: false,
    });
    descriptor
}

/// Picks a loopback port that is free at the time of the call.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(0)
}

/// Canned HTTP/1.1 response with an empty body.
pub fn http_response(status: &str, content_type: Option<&str>) -> String {
    let content_type = content_type
        .map(|value| format!("content-type: {value}\r\n"))
        .unwrap_or_default();
    format!("HTTP/1.1 {status}\r\n{content_type}content-length: 0\r\nconnection: close\r\n\r\n")
}

/// Serves `responses` in order on a loopback port, repeating the last one forever.
///
/// Returns the port and a counter of accepted requests.
pub async fn spawn_http_stub(
    responses: Vec<String>,
) -> (u16, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind loopback listener");
    let port = listener.local_addr().expect("listener address").port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let served = counter.fetch_add(1, Ordering::SeqCst);
            let Some(response) = responses.get(served).or_else(|| responses.last()).cloned()
            else {
                break;
            };
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (port, hits)
}
