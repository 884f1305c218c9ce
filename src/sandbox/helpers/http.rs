//! Outbound HTTP helpers.
//!
//! Every request is checked before it leaves: only http/https, no
//! loopback, private, link-local, CGNAT or unique-local destinations (also
//! when wrapped in an IPv6 address), and the connection is pinned to the address that passed the check so a
//! second DNS answer cannot redirect it. Redirects are not followed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use url::{Host, Url};

use super::Args;

pub(super) const NAMES: &[&str] = &["http_get", "http_post", "validate_url"];

/// Default cap on response bodies (1 MB).
const DEFAULT_MAX_RESPONSE_BYTES: usize = 1024 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect timeout; never longer than the request timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const USER_AGENT: &str = concat!("taskweave/", env!("CARGO_PKG_VERSION"));

pub struct HttpHelper {
    enabled: bool,
    timeout: Duration,
    max_response_bytes: usize,
}

impl HttpHelper {
    pub fn new(enabled: bool, timeout: Duration, max_response_bytes: usize) -> Self {
        Self {
            enabled,
            timeout,
            max_response_bytes,
        }
    }

    /// A helper that refuses every request. `validate_url` still works.
    pub fn disabled() -> Self {
        Self::new(false, DEFAULT_TIMEOUT, DEFAULT_MAX_RESPONSE_BYTES)
    }

    pub(super) async fn call(&self, name: &str, args: &Args<'_>) -> Result<Value, String> {
        match name {
            "validate_url" => {
                args.arity(1, 1)?;
                Ok(Value::Bool(check_url(args.str(0)?).is_ok()))
            }
            "http_get" => {
                args.arity(1, 2)?;
                self.request(reqwest::Method::GET, args.str(0)?, None, args.opt_object(1)?)
                    .await
            }
            "http_post" => {
                args.arity(2, 3)?;
                self.request(
                    reqwest::Method::POST,
                    args.str(0)?,
                    Some(args.value(1)?),
                    args.opt_object(2)?,
                )
                .await
            }
            other => Err(format!("unknown helper `{other}`")),
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        raw: &str,
        body: Option<&Value>,
        headers: Option<&Map<String, Value>>,
    ) -> Result<Value, String> {
        if !self.enabled {
            return Err("http helpers are disabled".into());
        }
        let url = check_url(raw)?;
        let addr = resolve_public(&url).await?;
        let host = url.host_str().unwrap_or_default().to_string();

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout.min(CONNECT_TIMEOUT))
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .resolve(&host, addr)
            .build()
            .map_err(|e| format!("http client error: {e}"))?;

        let mut request = client.request(method.clone(), url.clone());
        if let Some(headers) = headers {
            for (name, value) in headers {
                if name.eq_ignore_ascii_case("host") {
                    continue;
                }
                let value = value
                    .as_str()
                    .ok_or_else(|| format!("header {name} must be a string"))?;
                request = request.header(name.as_str(), value);
            }
        }
        request = match body {
            Some(Value::String(text)) => request.body(text.clone()),
            Some(value) => request.json(value),
            None => request,
        };

        debug!("{method} {url} via {addr}");

        let mut response = request.send().await.map_err(|e| {
            warn!("HTTP request to {url} failed: {e}");
            format!("http request failed: {e}")
        })?;

        let status = response.status();
        if let Some(len) = response.content_length() {
            if len as usize > self.max_response_bytes {
                return Err(format!(
                    "response too large ({len} bytes, limit is {} bytes)",
                    self.max_response_bytes
                ));
            }
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| format!("reading response failed: {e}"))?
        {
            if bytes.len() + chunk.len() > self.max_response_bytes {
                return Err(format!(
                    "response exceeds {} bytes",
                    self.max_response_bytes
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let text = String::from_utf8_lossy(&bytes).into_owned();
        let parsed = serde_json::from_str::<Value>(&text).unwrap_or(Value::Null);
        Ok(json!({
            "status": status.as_u16(),
            "ok": status.is_success(),
            "body": text,
            "json": parsed,
        }))
    }
}

impl Default for HttpHelper {
    fn default() -> Self {
        Self::new(true, DEFAULT_TIMEOUT, DEFAULT_MAX_RESPONSE_BYTES)
    }
}

/// Checks scheme and host of `raw` without touching the network.
pub fn check_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid URL `{raw}`: {e}"))?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(format!("unsupported scheme `{scheme}` (only http/https)")),
    }
    match url.host() {
        None => return Err(format!("URL `{raw}` has no host")),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err(format!("host `{domain}` is not reachable from the sandbox"));
            }
        }
        Some(Host::Ipv4(ip)) => reject_blocked(IpAddr::V4(ip))?,
        Some(Host::Ipv6(ip)) => reject_blocked(IpAddr::V6(ip))?,
    }
    Ok(url)
}

fn reject_blocked(ip: IpAddr) -> Result<(), String> {
    if is_blocked_ip(ip) {
        return Err(format!("address {ip} is not reachable from the sandbox"));
    }
    Ok(())
}

/// Resolves the host and returns the address to connect to. Fails if any
/// resolved address is blocked.
async fn resolve_public(url: &Url) -> Result<SocketAddr, String> {
    let port = url.port_or_known_default().unwrap_or(80);
    let domain = match url.host() {
        Some(Host::Ipv4(ip)) => return Ok(SocketAddr::new(IpAddr::V4(ip), port)),
        Some(Host::Ipv6(ip)) => return Ok(SocketAddr::new(IpAddr::V6(ip), port)),
        Some(Host::Domain(domain)) => domain.to_string(),
        None => return Err("URL has no host".into()),
    };

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((domain.as_str(), port))
        .await
        .map_err(|e| format!("cannot resolve {domain}: {e}"))?
        .collect();
    if addrs.is_empty() {
        return Err(format!("{domain} did not resolve"));
    }
    if let Some(blocked) = addrs.iter().find(|a| is_blocked_ip(a.ip())) {
        return Err(format!(
            "{domain} resolves to {}, which is not reachable from the sandbox",
            blocked.ip()
        ));
    }
    Ok(addrs[0])
}

/// True for loopback, private, link-local, CGNAT, unique-local and other
/// non-public addresses. IPv6 addresses that carry an IPv4 address are
/// judged by the IPv4 address.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => blocked_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = embedded_v4(v6) {
                return blocked_v4(v4);
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (first & 0xfe00) == 0xfc00 // fc00::/7
                || (first & 0xffc0) == 0xfe80 // fe80::/10
                || (first & 0xffc0) == 0xfec0 // fec0::/10, deprecated site-local
        }
    }
}

/// The IPv4 address inside a mapped (`::ffff:a.b.c.d`), compatible
/// (`::a.b.c.d`), NAT64 (`64:ff9b::/96`) or 6to4 (`2002::/16`) address.
fn embedded_v4(v6: Ipv6Addr) -> Option<Ipv4Addr> {
    let join = |hi: u16, lo: u16| Ipv4Addr::from((u32::from(hi) << 16) | u32::from(lo));
    match v6.segments() {
        [0, 0, 0, 0, 0, 0xffff, hi, lo]
        | [0, 0, 0, 0, 0, 0, hi, lo]
        | [0x64, 0xff9b, 0, 0, 0, 0, hi, lo] => Some(join(hi, lo)),
        [0x2002, hi, lo, ..] => Some(join(hi, lo)),
        _ => None,
    }
}

fn blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        || a == 0
        || (a == 100 && (b & 0xc0) == 64) // 100.64.0.0/10
}
