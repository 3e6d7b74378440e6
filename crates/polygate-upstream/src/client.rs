use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::error::AdapterError;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_SOCKETS_PER_HOST: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    proxy: Option<String>,
}

static CLIENT_CACHE: OnceLock<Mutex<HashMap<ClientKey, wreq::Client>>> = OnceLock::new();

/// Process-wide upstream client cache, keyed by outbound proxy. Keep-alive
/// stays on and the per-host pool is bounded.
pub fn shared_client(proxy: Option<&str>) -> Result<wreq::Client, AdapterError> {
    let key = ClientKey {
        proxy: proxy
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
    };

    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache
        .lock()
        .map_err(|_| AdapterError::network("http client cache lock failed"))?;
    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }

    let client = build_client(key.proxy.as_deref())?;
    guard.insert(key, client.clone());
    Ok(client)
}

fn build_client(proxy: Option<&str>) -> Result<wreq::Client, AdapterError> {
    let mut builder = wreq::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(MAX_SOCKETS_PER_HOST)
        .tcp_keepalive(Duration::from_secs(60));
    if let Some(proxy_url) = proxy {
        builder = builder.proxy(
            wreq::Proxy::all(proxy_url).map_err(|err| AdapterError::network(err.to_string()))?,
        );
    }
    builder
        .build()
        .map_err(|err| AdapterError::network(err.to_string()))
}
