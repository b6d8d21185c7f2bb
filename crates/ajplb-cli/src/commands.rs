use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ajplb_balancer::config::AJP13_DEF_PORT;
use ajplb_balancer::{AjpWorker, Connector, Outcome, WorkerConfig};
use ajplb_common::{AjpError, ForwardRequest, ForwardResponse, RuntimeRegistry};
use anyhow::{anyhow, Context, Result};

/// Splits `host[:port]`, defaulting to the AJP port.
pub fn parse_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|e| anyhow!("Invalid port in '{}': {}", target, e))?;
            (host, port)
        }
        None => (target, AJP13_DEF_PORT),
    };
    if host.is_empty() {
        return Err(anyhow!("Missing host in '{}'", target));
    }
    Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

/// Parses a `name:value` header argument.
pub fn parse_header(header: &str) -> Result<(String, String)> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid header '{}': expected name:value", header))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("Invalid header '{}': empty name", header));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// A one-off worker for a single container, outside any balancer.
pub fn standalone_worker(target: &str, timeout: Duration) -> Result<AjpWorker> {
    let (host, port) = parse_target(target)?;
    let mut config = WorkerConfig::new("cli", host, port);
    config.ping_timeout_ms = timeout.as_millis() as u64;
    config.socket_connect_timeout_ms = timeout.as_millis() as u64;
    config.retries = 1;
    Ok(AjpWorker::new(config, Arc::new(RuntimeRegistry::in_memory()))?)
}

/// Connects and measures one CPING/CPONG round trip.
pub async fn ping(target: &str, timeout: Duration) -> Result<Duration> {
    let worker = standalone_worker(target, timeout)?;
    let start = Instant::now();
    worker
        .probe()
        .await
        .with_context(|| format!("CPING to {} failed", target))?;
    Ok(start.elapsed())
}

/// Sends one request to a single container.
pub async fn forward(target: &str, request: &ForwardRequest, timeout: Duration) -> Result<ForwardResponse> {
    let worker = standalone_worker(target, timeout)?;
    let served = worker
        .service(request)
        .await
        .map_err(|failure| failure.error)
        .with_context(|| format!("Request to {} failed", target))?;
    Ok(served.response)
}

/// Status line, headers, a blank line and the body.
pub fn format_response(response: &ForwardResponse) -> String {
    let mut out = format!("{} {}\n", response.status, response.reason);
    for (name, value) in &response.headers {
        out.push_str(&format!("{}: {}\n", name, value));
    }
    out.push('\n');
    out.push_str(&String::from_utf8_lossy(&response.body));
    out
}

/// Runs `count` selections on `balancer` without contacting any backend.
///
/// Every selection is recorded as a success, so the counts show how load
/// would spread across healthy members. Returns selections per member.
pub fn route_distribution(
    connector: &Connector,
    balancer: &str,
    request: &ForwardRequest,
    count: usize,
) -> Result<BTreeMap<String, usize>> {
    let lb = connector
        .balancer(balancer)
        .ok_or_else(|| AjpError::UnknownWorker(balancer.to_string()))?;
    let mut counts = BTreeMap::new();
    for _ in 0..count {
        let selection = lb
            .try_select(request, &[])?
            .ok_or_else(|| anyhow!("No usable member in balancer '{}'", balancer))?;
        *counts.entry(selection.name().to_string()).or_insert(0) += 1;
        lb.record_outcome(&selection, &Outcome::Success { bytes: 0 });
    }
    Ok(counts)
}

/// One line per member: name, selections and share.
pub fn format_distribution(counts: &BTreeMap<String, usize>) -> String {
    let total: usize = counts.values().sum();
    counts
        .iter()
        .map(|(name, n)| {
            let share = if total == 0 { 0.0 } else { *n as f64 * 100.0 / total as f64 };
            format!("{:<20} {:>8} {:>6.1}%\n", name, n, share)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("127.0.0.1:8010").unwrap(), ("127.0.0.1".to_string(), 8010));
        assert_eq!(parse_target("backend").unwrap(), ("backend".to_string(), 8009));
        assert_eq!(parse_target("[::1]:8009").unwrap(), ("::1".to_string(), 8009));
        assert!(parse_target("host:http").is_err());
        assert!(parse_target(":8009").is_err());
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Accept: text/html").unwrap(),
            ("Accept".to_string(), "text/html".to_string())
        );
        assert_eq!(
            parse_header("X-Empty:").unwrap(),
            ("X-Empty".to_string(), String::new())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_format_response() {
        let response = ForwardResponse {
            status: 404,
            reason: "Not Found".to_string(),
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: b"gone".to_vec(),
            reuse: true,
        };
        assert_eq!(
            format_response(&response),
            "404 Not Found\nContent-Type: text/plain\n\ngone"
        );
    }

    #[test]
    fn test_format_distribution() {
        let counts = BTreeMap::from([("a".to_string(), 3), ("b".to_string(), 1)]);
        let text = format_distribution(&counts);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("a "));
        assert!(lines[0].ends_with("75.0%"));
        assert!(lines[1].ends_with("25.0%"));
    }
}
