//! # ajplb CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # CPING a container
//! ajplb ping 127.0.0.1:8009
//!
//! # Forward one request
//! ajplb forward 127.0.0.1:8009 /app/index.jsp --header Host:example.com
//!
//! # See how a balancer would spread 1000 requests
//! ajplb route --config ajplb.toml --balancer lb -n 1000
//!
//! # Show a balancer as properties
//! ajplb status --config ajplb.toml 'cmd=show&w=lb&mime=prop'
//! ```
//!
//! Logs go to stderr so command output can be piped.

use std::path::PathBuf;
use std::time::Duration;

use ajplb_balancer::{Connector, ConnectorConfig};
use ajplb_cli::commands;
use ajplb_common::ForwardRequest;
use ajplb_status::StatusService;
use anyhow::Result;
use argh::FromArgs;

#[derive(FromArgs)]
/// ajplb - AJP13 connector and load balancer tools
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Ping(PingArgs),
    Forward(ForwardArgs),
    Route(RouteArgs),
    Status(StatusArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "ping")]
/// CPING a container and report the round trip time
struct PingArgs {
    /// container address as host:port
    #[argh(positional)]
    target: String,

    /// connect and reply timeout in milliseconds
    #[argh(option, short = 't', long = "timeout-ms", default = "10000")]
    timeout_ms: u64,
}

/// Arguments for a single forwarded request.
///
/// # Example
///
/// ```bash
/// ajplb forward 127.0.0.1:8009 '/search?q=ajp' -m POST -H Content-Type:text/plain --body hello
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "forward")]
/// send one request over AJP13 and print the reply
struct ForwardArgs {
    /// container address as host:port
    #[argh(positional)]
    target: String,

    /// request URI, with an optional query string
    #[argh(positional)]
    uri: String,

    /// request method
    #[argh(option, short = 'm', long = "method", default = "\"GET\".into()")]
    method: String,

    /// request header as name:value, repeatable
    #[argh(option, short = 'H', long = "header")]
    headers: Vec<String>,

    /// request body
    #[argh(option, long = "body")]
    body: Option<String>,

    /// connect and reply timeout in milliseconds
    #[argh(option, short = 't', long = "timeout-ms", default = "10000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "route")]
/// dry-run balancer selections and print the member distribution
struct RouteArgs {
    /// connector configuration file
    #[argh(option, short = 'c', long = "config")]
    config: PathBuf,

    /// balancer name
    #[argh(option, short = 'b', long = "balancer")]
    balancer: String,

    /// cookie header sent with every request
    #[argh(option, long = "cookie")]
    cookie: Option<String>,

    /// request URI
    #[argh(option, short = 'u', long = "uri", default = "\"/\".into()")]
    uri: String,

    /// number of selections
    #[argh(option, short = 'n', default = "10")]
    count: usize,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "status")]
/// run a status command against a connector built from a configuration
struct StatusArgs {
    /// connector configuration file
    #[argh(option, short = 'c', long = "config")]
    config: PathBuf,

    /// status query such as 'cmd=show&w=lb', a full listing when omitted
    #[argh(positional)]
    query: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Ping(args) => {
            let rtt = commands::ping(&args.target, Duration::from_millis(args.timeout_ms)).await?;
            println!("CPONG from {} in {:.3}ms", args.target, rtt.as_secs_f64() * 1000.0);
            Ok(())
        }
        Commands::Forward(args) => run_forward(args).await,
        Commands::Route(args) => {
            let connector = Connector::open(ConnectorConfig::load(&args.config)?)?;
            let mut request = ForwardRequest::new("GET", args.uri);
            if let Some(cookie) = args.cookie {
                request = request.with_header("Cookie", cookie);
            }
            let counts = commands::route_distribution(&connector, &args.balancer, &request, args.count)?;
            print!("{}", commands::format_distribution(&counts));
            Ok(())
        }
        Commands::Status(args) => {
            let connector = Connector::open(ConnectorConfig::load(&args.config)?)?;
            let body = StatusService::new(&connector).handle_query(args.query.as_deref().unwrap_or(""))?;
            println!("{}", body.trim_end());
            if connector.persist()? {
                tracing::debug!("runtime image updated");
            }
            Ok(())
        }
    }
}

async fn run_forward(args: ForwardArgs) -> Result<()> {
    let mut request = ForwardRequest::new(args.method, args.uri);
    for header in &args.headers {
        let (name, value) = commands::parse_header(header)?;
        request = request.with_header(name, value);
    }
    if let Some(body) = args.body {
        request = request.with_body(body);
    }

    let response =
        commands::forward(&args.target, &request, Duration::from_millis(args.timeout_ms)).await?;
    print!("{}", commands::format_response(&response));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_ping() {
        let args: Cli = Cli::from_args(&["ajplb"], &["ping", "127.0.0.1:8009"]).unwrap();
        match args.command {
            Commands::Ping(PingArgs { target, timeout_ms }) => {
                assert_eq!(target, "127.0.0.1:8009");
                assert_eq!(timeout_ms, 10000); // default
            }
            _ => panic!("Expected Ping command"),
        }
    }

    #[test]
    fn test_cli_parse_forward() {
        let args: Cli = Cli::from_args(&["ajplb"], &[
            "forward",
            "127.0.0.1:8009",
            "/app?x=1",
            "-m", "POST",
            "-H", "Host:example.com",
            "--header", "Accept: */*",
            "--body", "hello",
        ]).unwrap();
        match args.command {
            Commands::Forward(ForwardArgs { target, uri, method, headers, body, .. }) => {
                assert_eq!(target, "127.0.0.1:8009");
                assert_eq!(uri, "/app?x=1");
                assert_eq!(method, "POST");
                assert_eq!(headers, vec!["Host:example.com", "Accept: */*"]);
                assert_eq!(body.as_deref(), Some("hello"));
            }
            _ => panic!("Expected Forward command"),
        }
    }

    #[test]
    fn test_cli_parse_forward_defaults() {
        let args: Cli = Cli::from_args(&["ajplb"], &["forward", "backend", "/"]).unwrap();
        match args.command {
            Commands::Forward(ForwardArgs { method, headers, body, .. }) => {
                assert_eq!(method, "GET");
                assert!(headers.is_empty());
                assert!(body.is_none());
            }
            _ => panic!("Expected Forward command"),
        }
    }

    #[test]
    fn test_cli_parse_route() {
        let args: Cli = Cli::from_args(&["ajplb"], &[
            "route",
            "--config", "ajplb.toml",
            "--balancer", "lb",
            "--cookie", "JSESSIONID=1.node1",
            "-n", "100",
        ]).unwrap();
        match args.command {
            Commands::Route(RouteArgs { config, balancer, cookie, uri, count }) => {
                assert_eq!(config, PathBuf::from("ajplb.toml"));
                assert_eq!(balancer, "lb");
                assert_eq!(cookie.as_deref(), Some("JSESSIONID=1.node1"));
                assert_eq!(uri, "/"); // default
                assert_eq!(count, 100);
            }
            _ => panic!("Expected Route command"),
        }
    }

    #[test]
    fn test_cli_parse_status() {
        let args: Cli = Cli::from_args(&["ajplb"], &["status", "-c", "ajplb.toml", "cmd=version"]).unwrap();
        match args.command {
            Commands::Status(StatusArgs { config, query }) => {
                assert_eq!(config, PathBuf::from("ajplb.toml"));
                assert_eq!(query.as_deref(), Some("cmd=version"));
            }
            _ => panic!("Expected Status command"),
        }
    }

    #[test]
    fn test_cli_parse_status_default_query() {
        let args: Cli = Cli::from_args(&["ajplb"], &["status", "-c", "ajplb.toml"]).unwrap();
        match args.command {
            Commands::Status(StatusArgs { query, .. }) => assert!(query.is_none()),
            _ => panic!("Expected Status command"),
        }
    }

    #[test]
    fn test_cli_route_requires_balancer() {
        assert!(Cli::from_args(&["ajplb"], &["route", "--config", "ajplb.toml"]).is_err());
    }
}
