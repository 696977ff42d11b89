//! Safe probe variant for user-supplied URLs.
//!
//! Regular monitoring follows redirects because the targets come from the
//! operator's own configuration. Self-test probes take URLs from API users,
//! so this variant disables redirects entirely and refuses targets that
//! resolve to internal address space.

use std::net::IpAddr;

use anyhow::{Context, bail};
use reqwest::{Client, redirect};
use tokio::net::lookup_host;
use tracing::debug;
use url::{Host, Url};

use crate::config::MonitorDef;

use super::engine::{ProbeEngine, ProbeOutcome};

/// True when the address belongs to the SSRF denylist: RFC1918, loopback,
/// link-local, unspecified, ULA (fc00::/7) and v6 link-local (fe80::/10).
/// V4-mapped v6 addresses are judged by their embedded v4 address.
pub fn is_denied_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_denied_address(IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link-local
        }
    }
}

/// Parse and vet a user-supplied target. Hostnames are resolved and every
/// resolved address must pass the denylist, otherwise a DNS answer pointing
/// at internal space would slip through.
pub async fn validate_target(raw: &str) -> anyhow::Result<Url> {
    let parsed = Url::parse(raw).with_context(|| format!("invalid url: {raw}"))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("unsupported scheme: {}", parsed.scheme());
    }

    let port = parsed
        .port_or_known_default()
        .context("url has no usable port")?;

    match parsed.host() {
        None => bail!("url has no host"),
        Some(Host::Ipv4(v4)) => {
            if is_denied_address(IpAddr::V4(v4)) {
                bail!("target address {v4} is not allowed");
            }
        }
        Some(Host::Ipv6(v6)) => {
            if is_denied_address(IpAddr::V6(v6)) {
                bail!("target address {v6} is not allowed");
            }
        }
        Some(Host::Domain(name)) => {
            let addrs: Vec<_> = lookup_host((name, port))
                .await
                .with_context(|| format!("failed to resolve {name}"))?
                .collect();
            if addrs.is_empty() {
                bail!("{name} resolved to no addresses");
            }
            for addr in addrs {
                if is_denied_address(addr.ip()) {
                    bail!("{name} resolves to disallowed address {}", addr.ip());
                }
            }
        }
    }

    Ok(parsed)
}

/// Probe engine for untrusted targets: no redirects, denylist-vetted URLs.
pub struct SelfTestEngine {
    engine: ProbeEngine,
}

impl SelfTestEngine {
    pub fn new(max_response_bytes: usize) -> anyhow::Result<Self> {
        let client = Client::builder().redirect(redirect::Policy::none()).build()?;
        Ok(Self {
            engine: ProbeEngine::with_client(client, max_response_bytes),
        })
    }

    /// Validate the target, then run a single probe. URL rejection is an
    /// error (the caller reports it to the user); probe failures are still
    /// classified outcomes.
    pub async fn probe(&self, monitor: &MonitorDef) -> anyhow::Result<ProbeOutcome> {
        let target = validate_target(&monitor.url).await?;
        debug!("self-test probe of {target}");
        Ok(self.engine.probe(monitor).await)
    }
}
