//! Administrative commands parsed from URL query strings.
//!
//! A request looks like `cmd=update&w=lb&sw=node1&vwf=3&vwa=DIS`. `w` names
//! a balancer or plain worker, `sw` a member of the balancer, and each
//! `vl*`, `vw*` or `va*` parameter is one balancer, member or AJP worker
//! field to change.

use std::fmt;
use std::str::FromStr;

use ajplb_balancer::{BalancerUpdate, MemberUpdate, PingMode, WorkerUpdate};
use ajplb_common::protocol::error::{AjpError, Result};
use ajplb_common::{Activation, LbMethod, LockMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    #[default]
    List,
    Show,
    Update,
    Reset,
    Recover,
    Version,
    Dump,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::List => "list",
            Command::Show => "show",
            Command::Update => "update",
            Command::Reset => "reset",
            Command::Recover => "recover",
            Command::Version => "version",
            Command::Dump => "dump",
        }
    }

    /// Whether the command changes runtime state.
    pub fn is_mutating(self) -> bool {
        matches!(self, Command::Update | Command::Reset | Command::Recover)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = AjpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "list" => Ok(Command::List),
            "show" => Ok(Command::Show),
            "update" => Ok(Command::Update),
            "reset" => Ok(Command::Reset),
            "recover" => Ok(Command::Recover),
            "version" => Ok(Command::Version),
            "dump" => Ok(Command::Dump),
            other => Err(AjpError::Config(format!("unknown command '{}'", other))),
        }
    }
}

/// Output format of a status reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mime {
    #[default]
    Json,
    /// `key=value` lines
    Prop,
}

impl FromStr for Mime {
    type Err = AjpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Mime::Json),
            "prop" | "properties" => Ok(Mime::Prop),
            other => Err(AjpError::Config(format!("unknown mime '{}'", other))),
        }
    }
}

/// One parsed status request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusRequest {
    pub command: Command,
    pub mime: Mime,
    /// Balancer or plain worker name
    pub worker: Option<String>,
    /// Member name within the balancer
    pub sub_worker: Option<String>,
    /// Raw update fields in query order
    pub fields: Vec<(String, String)>,
}

impl StatusRequest {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }

    /// Parses a query string, with or without its leading `?`.
    ///
    /// Parameters other than `cmd`, `mime`, `w`, `sw` and update fields
    /// are ignored. A missing `cmd` means `list`.
    ///
    /// # Errors
    ///
    /// `Config` for an unknown command or mime type.
    ///
    /// # Example
    ///
    /// ```
    /// use ajplb_status::{Command, StatusRequest};
    ///
    /// let request = StatusRequest::parse("cmd=update&w=lb&sw=node1&vwf=3").unwrap();
    /// assert_eq!(request.command, Command::Update);
    /// assert_eq!(request.sub_worker.as_deref(), Some("node1"));
    /// assert_eq!(request.fields, vec![("vwf".to_string(), "3".to_string())]);
    /// ```
    pub fn parse(query: &str) -> Result<Self> {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut request = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim();
            match key.as_ref() {
                "cmd" => request.command = value.parse()?,
                "mime" => request.mime = value.parse()?,
                "w" => request.worker = non_empty(value),
                "sw" => request.sub_worker = non_empty(value),
                k if is_field(k) => request.fields.push((k.to_string(), value.to_string())),
                _ => {}
            }
        }
        Ok(request)
    }

    pub fn with_worker(mut self, name: impl Into<String>) -> Self {
        self.worker = Some(name.into());
        self
    }

    pub fn with_sub_worker(mut self, name: impl Into<String>) -> Self {
        self.sub_worker = Some(name.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn with_mime(mut self, mime: Mime) -> Self {
        self.mime = mime;
        self
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn is_field(key: &str) -> bool {
    key.len() > 2 && (key.starts_with("vl") || key.starts_with("vw") || key.starts_with("va"))
}

/// A typed update field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate {
    Balancer(BalancerUpdate),
    Member(MemberUpdate),
    Worker(WorkerUpdate),
}

/// Parses one `vl*`, `vw*` or `va*` field.
///
/// # Errors
///
/// `Config` for an unknown key or a value that does not parse.
pub fn parse_field(key: &str, value: &str) -> Result<FieldUpdate> {
    use FieldUpdate::{Balancer, Member, Worker};

    let update = match key {
        "vlr" => Balancer(BalancerUpdate::Retries(number(key, value)?)),
        "vlri" => Balancer(BalancerUpdate::RetryIntervalMs(number(key, value)?)),
        "vlt" => Balancer(BalancerUpdate::RecoverWaitTimeSecs(number(key, value)?)),
        "vlee" => Balancer(BalancerUpdate::ErrorEscalationTimeSecs(number(key, value)?)),
        "vlx" => Balancer(BalancerUpdate::MaxReplyTimeouts(number(key, value)?)),
        "vls" => Balancer(BalancerUpdate::StickySession(flag(key, value)?)),
        "vlf" => Balancer(BalancerUpdate::StickySessionForce(flag(key, value)?)),
        "vlm" => Balancer(BalancerUpdate::Method(value.parse::<LbMethod>()?)),
        "vll" => Balancer(BalancerUpdate::Lock(value.parse::<LockMode>()?)),

        "vwa" => Member(MemberUpdate::Activation(value.parse::<Activation>()?)),
        "vwf" => Member(MemberUpdate::Factor(number(key, value)?)),
        "vwn" => Member(MemberUpdate::Route(value.to_string())),
        "vwr" => Member(MemberUpdate::Redirect(value.to_string())),
        "vwc" => Member(MemberUpdate::Domain(value.to_string())),
        "vwd" => Member(MemberUpdate::Distance(number(key, value)?)),

        "vahst" => Worker(WorkerUpdate::Host(value.to_string())),
        "vaprt" => Worker(WorkerUpdate::Port(number(key, value)?)),
        "vacpt" => Worker(WorkerUpdate::CacheTimeoutSecs(number(key, value)?)),
        "vapng" => Worker(WorkerUpdate::PingMode(value.parse::<PingMode>()?)),
        "vact" => Worker(WorkerUpdate::ConnectTimeoutMs(number(key, value)?)),
        "vapt" => Worker(WorkerUpdate::PrepostTimeoutMs(number(key, value)?)),
        "vart" => Worker(WorkerUpdate::ReplyTimeoutMs(number(key, value)?)),
        "var" => Worker(WorkerUpdate::Retries(number(key, value)?)),
        "vari" => Worker(WorkerUpdate::RetryIntervalMs(number(key, value)?)),
        "varo" => Worker(WorkerUpdate::RecoveryOptions(number(key, value)?)),
        "vamps" => Worker(WorkerUpdate::MaxPacketSize(number(key, value)?)),

        _ => return Err(AjpError::Config(format!("unknown field '{}'", key))),
    };
    Ok(update)
}

fn number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| AjpError::Config(format!("invalid value '{}' for '{}'", value, key)))
}

fn flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(AjpError::Config(format!("invalid value '{}' for '{}'", value, key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_to_list_json() {
        let request = StatusRequest::parse("").unwrap();
        assert_eq!(request.command, Command::List);
        assert_eq!(request.mime, Mime::Json);
        assert!(request.worker.is_none());
    }

    #[test]
    fn test_parse_full_query() {
        let request =
            StatusRequest::parse("?cmd=show&mime=prop&w=lb&sw=node%201&vwa=DIS&x=ignored").unwrap();
        assert_eq!(request.command, Command::Show);
        assert_eq!(request.mime, Mime::Prop);
        assert_eq!(request.worker.as_deref(), Some("lb"));
        assert_eq!(request.sub_worker.as_deref(), Some("node 1"));
        assert_eq!(request.fields, vec![("vwa".to_string(), "DIS".to_string())]);
    }

    #[test]
    fn test_empty_worker_is_none() {
        let request = StatusRequest::parse("cmd=reset&w=&sw=").unwrap();
        assert!(request.worker.is_none());
        assert!(request.sub_worker.is_none());
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(matches!(
            StatusRequest::parse("cmd=explode"),
            Err(AjpError::Config(_))
        ));
        assert!(StatusRequest::parse("mime=xml").is_err());
    }

    #[test]
    fn test_parse_fields() {
        assert_eq!(
            parse_field("vlm", "b").unwrap(),
            FieldUpdate::Balancer(BalancerUpdate::Method(LbMethod::Busyness))
        );
        assert_eq!(
            parse_field("vls", "off").unwrap(),
            FieldUpdate::Balancer(BalancerUpdate::StickySession(false))
        );
        assert_eq!(
            parse_field("vwa", "s").unwrap(),
            FieldUpdate::Member(MemberUpdate::Activation(Activation::Stopped))
        );
        assert_eq!(
            parse_field("vapng", "CI").unwrap(),
            FieldUpdate::Worker(WorkerUpdate::PingMode(PingMode::CONNECT | PingMode::INTERVAL))
        );
        assert_eq!(
            parse_field("vaprt", "8010").unwrap(),
            FieldUpdate::Worker(WorkerUpdate::Port(8010))
        );
    }

    #[test]
    fn test_bad_field_values() {
        assert!(parse_field("vwf", "many").is_err());
        assert!(parse_field("vaprt", "70000").is_err());
        assert!(parse_field("vls", "maybe").is_err());
        assert!(parse_field("vlzz", "1").is_err());
    }

    #[test]
    fn test_mutating_commands() {
        assert!(Command::Update.is_mutating());
        assert!(Command::Recover.is_mutating());
        assert!(!Command::Dump.is_mutating());
        assert_eq!("RESET".parse::<Command>().unwrap(), Command::Reset);
    }
}
