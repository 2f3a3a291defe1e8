//! Blocking HTTP client for a backend subprocess
//! =============================================
//!
//! Thin wrapper around [`ureq`]: one agent (one connection pool) per loaded
//! backend, bound to `http://127.0.0.1:<port>`. Used for readiness probes
//! and small control-plane requests; inference bodies are proxied by the
//! gateway's async fetcher instead.

use std::{
    io::Read,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener},
    time::Duration,
};

use ureq::Agent;

use crate::error::{RouterError, RouterResult};

/// Probe + control-plane requests stay short; model loads are observed via
/// repeated probes, not one long request.
const TIMEOUT: Duration = Duration::from_secs(10);

/// What `GET /health` told us.
#[derive(Debug, PartialEq)]
pub enum HealthProbe {
    /// HTTP 200 – ready for inference.
    Ready,
    /// HTTP 503 – the server is up but still mapping weights.
    Loading,
    /// Unreachable or an unexpected status.
    Offline(String),
}

#[derive(Debug)]
pub struct BackendHttp {
    agent: Agent,
    base_url: String,
    port: u16,
}

impl BackendHttp {
    /// Bind to an ephemeral port to find a free one, release it, and hand
    /// the port to the backend we are about to spawn.
    pub fn on_free_port() -> RouterResult<Self> {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .map_err(|e| RouterError::InvalidConfig {
                field: "backend_port",
                reason: format!("failed to obtain an ephemeral port: {e}"),
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| RouterError::InvalidConfig {
                field: "backend_port",
                reason: format!("could not read local address: {e}"),
            })?
            .port();
        drop(listener);
        Ok(Self::for_port(port))
    }

    pub fn for_port(port: u16) -> Self {
        let agent = Agent::new_with_config(
            Agent::config_builder()
                .timeout_global(Some(TIMEOUT))
                .build(),
        );
        Self {
            agent,
            base_url: format!("http://127.0.0.1:{port}"),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn health(&self) -> HealthProbe {
        let url = format!("{}/health", self.base_url);
        match self.agent.get(&url).call() {
            Ok(resp) if resp.status().as_u16() == 200 => HealthProbe::Ready,
            Ok(resp) => HealthProbe::Offline(format!("HTTP {}", resp.status())),
            Err(ureq::Error::StatusCode(503)) => HealthProbe::Loading,
            Err(ureq::Error::StatusCode(code)) => HealthProbe::Offline(format!("HTTP {code}")),
            Err(e) => HealthProbe::Offline(e.to_string()),
        }
    }

    pub fn get_json(&self, path: &str) -> RouterResult<serde_json::Value> {
        debug_assert!(path.starts_with('/'));
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| RouterError::BackendFailed(format!("GET {path}: {e}")))?;
        let mut body = Vec::new();
        resp.into_body()
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| RouterError::BackendFailed(format!("GET {path}: {e}")))?;
        serde_json::from_slice(&body)
            .map_err(|e| RouterError::BackendFailed(format!("GET {path}: invalid JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One-shot HTTP server answering a canned status on /health.
    fn spawn_health_server(status_line: &'static str) -> (u16, std::thread::JoinHandle<()>) {
        use std::io::Write;

        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind test socket");
        let port = listener.local_addr().unwrap().port();

        let handle = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 512];
                let _ = Read::read(&mut stream, &mut buf);
                let reply = format!(
                    "{status_line}\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}"
                );
                let _ = stream.write_all(reply.as_bytes());
            }
        });
        (port, handle)
    }

    #[test]
    fn health_maps_statuses() {
        let (port, h) = spawn_health_server("HTTP/1.1 200 OK");
        assert_eq!(BackendHttp::for_port(port).health(), HealthProbe::Ready);
        h.join().unwrap();

        let (port, h) = spawn_health_server("HTTP/1.1 503 Service Unavailable");
        assert_eq!(BackendHttp::for_port(port).health(), HealthProbe::Loading);
        h.join().unwrap();

        // nothing listening
        let client = BackendHttp::on_free_port().unwrap();
        assert!(matches!(client.health(), HealthProbe::Offline(_)));
    }

    #[test]
    fn free_ports_are_distinct_enough_to_bind() {
        let client = BackendHttp::on_free_port().unwrap();
        // The port was released; we can bind it ourselves like a backend
        // would.
        let rebind = TcpListener::bind(("127.0.0.1", client.port()));
        assert!(rebind.is_ok());
    }
}
