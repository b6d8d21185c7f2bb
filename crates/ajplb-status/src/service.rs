use std::fmt;
use std::sync::Arc;

use ajplb_balancer::{AjpWorker, Balancer, Connector};
use ajplb_common::protocol::error::{AjpError, Result};
use ajplb_common::runtime::Record;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::command::{parse_field, Command, FieldUpdate, StatusRequest};
use crate::render::render;
use crate::snapshot::{BalancerSnapshot, MemberSnapshot, StatusSnapshot, WorkerSnapshot};

/// A field an `update` could not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedField {
    pub field: String,
    pub message: String,
}

/// Outcome of an `update`, field by field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub target: String,
    pub applied: Vec<String>,
    pub rejected: Vec<RejectedField>,
}

impl UpdateReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Result of one status command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusReply {
    List(StatusSnapshot),
    Balancer(BalancerSnapshot),
    Member(MemberSnapshot),
    Worker(WorkerSnapshot),
    Update(UpdateReport),
    Done { message: String },
    Version { version: String },
    Dump { records: Vec<Record> },
}

enum Target<'a> {
    Balancer(&'a Arc<Balancer>),
    Member(&'a Arc<Balancer>, usize, String),
    Worker(&'a Arc<AjpWorker>),
}

impl fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Balancer(b) => write!(f, "balancer '{}'", b.name()),
            Target::Member(b, _, name) => write!(f, "member '{}/{}'", b.name(), name),
            Target::Worker(w) => write!(f, "worker '{}'", w.name()),
        }
    }
}

/// Runs status commands against a [`Connector`].
///
/// # Example
///
/// ```no_run
/// use ajplb_balancer::{Connector, ConnectorConfig};
/// use ajplb_status::StatusService;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let connector = Connector::open(ConnectorConfig::load("ajplb.toml")?)?;
/// let body = StatusService::new(&connector).handle_query("cmd=show&w=lb&mime=prop")?;
/// println!("{}", body);
/// # Ok(())
/// # }
/// ```
pub struct StatusService<'a> {
    connector: &'a Connector,
}

impl<'a> StatusService<'a> {
    pub fn new(connector: &'a Connector) -> Self {
        Self { connector }
    }

    /// Parses, executes and renders a query string.
    pub fn handle_query(&self, query: &str) -> Result<String> {
        let request = StatusRequest::parse(query)?;
        let reply = self.execute(&request)?;
        render(&reply, request.mime)
    }

    /// Executes one request.
    ///
    /// # Errors
    ///
    /// - `ReadOnly` for `update`, `reset` or `recover` on a read-only connector
    /// - `Config` for a missing `w`, or a `recover` that does not name a
    ///   quarantined member
    /// - `UnknownWorker` when `w` or `sw` names nothing
    pub fn execute(&self, request: &StatusRequest) -> Result<StatusReply> {
        if request.command.is_mutating() && self.connector.read_only() {
            warn!(command = %request.command, "rejected on read-only status interface");
            return Err(AjpError::ReadOnly);
        }

        match request.command {
            Command::List => Ok(StatusReply::List(StatusSnapshot::capture(self.connector))),
            Command::Show => {
                if request.worker.is_none() {
                    return Ok(StatusReply::List(StatusSnapshot::capture(self.connector)));
                }
                Ok(match self.target(request)? {
                    Target::Balancer(b) => StatusReply::Balancer(BalancerSnapshot::capture(b)),
                    Target::Member(b, index, name) => {
                        let member = b
                            .member_snapshot()
                            .into_iter()
                            .nth(index)
                            .ok_or_else(|| AjpError::UnknownWorker(name))?;
                        StatusReply::Member(MemberSnapshot::capture(&member))
                    }
                    Target::Worker(w) => StatusReply::Worker(WorkerSnapshot::capture(w)),
                })
            }
            Command::Update => {
                let target = self.target(request)?;
                Ok(StatusReply::Update(self.update(&target, &request.fields)))
            }
            Command::Reset => {
                let target = self.target(request)?;
                match &target {
                    Target::Balancer(b) => b.reset(),
                    Target::Member(b, index, _) => b.reset_member(*index)?,
                    Target::Worker(w) => w.reset(),
                }
                info!(target = %target, "status reset");
                Ok(StatusReply::Done {
                    message: format!("reset {}", target),
                })
            }
            Command::Recover => {
                let target = self.target(request)?;
                let Target::Member(b, index, _) = &target else {
                    return Err(AjpError::Config(format!(
                        "recover needs a balancer member, not {}",
                        target
                    )));
                };
                b.recover_member(*index)?;
                Ok(StatusReply::Done {
                    message: format!("recovered {}", target),
                })
            }
            Command::Version => Ok(StatusReply::Version {
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
            Command::Dump => Ok(StatusReply::Dump {
                records: self.connector.registry().store().records(),
            }),
        }
    }

    fn target(&self, request: &StatusRequest) -> Result<Target<'a>> {
        let name = request
            .worker
            .as_deref()
            .ok_or_else(|| AjpError::Config("missing parameter 'w'".into()))?;

        if let Some(balancer) = self.connector.balancer(name) {
            return match request.sub_worker.as_deref() {
                Some(member) => {
                    let index = balancer
                        .member_index(member)
                        .ok_or_else(|| AjpError::UnknownWorker(format!("{}/{}", name, member)))?;
                    Ok(Target::Member(balancer, index, member.to_string()))
                }
                None => Ok(Target::Balancer(balancer)),
            };
        }

        let worker = self
            .connector
            .worker(name)
            .ok_or_else(|| AjpError::UnknownWorker(name.to_string()))?;
        if request.sub_worker.is_some() {
            return Err(AjpError::Config(format!("worker '{}' has no members", name)));
        }
        Ok(Target::Worker(worker))
    }

    /// Applies each field on its own; a bad field never blocks the others.
    fn update(&self, target: &Target<'_>, fields: &[(String, String)]) -> UpdateReport {
        let mut report = UpdateReport {
            target: target.to_string(),
            ..UpdateReport::default()
        };
        for (key, value) in fields {
            match parse_field(key, value).and_then(|update| apply(target, update)) {
                Ok(()) => report.applied.push(key.clone()),
                Err(e) => {
                    warn!(target = %target, field = %key, %value, error = %e, "update field rejected");
                    report.rejected.push(RejectedField {
                        field: key.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        info!(
            target = %target,
            applied = report.applied.len(),
            rejected = report.rejected.len(),
            "status update"
        );
        report
    }
}

fn apply(target: &Target<'_>, update: FieldUpdate) -> Result<()> {
    match (target, update) {
        (Target::Balancer(b), FieldUpdate::Balancer(u)) => b.apply_update(u),
        (Target::Member(b, index, _), FieldUpdate::Member(u)) => b.apply_member_update(*index, u),
        (Target::Member(b, index, name), FieldUpdate::Worker(u)) => b
            .workers()
            .get(*index)
            .ok_or_else(|| AjpError::UnknownWorker(name.clone()))?
            .apply_update(u),
        (Target::Worker(w), FieldUpdate::Worker(u)) => w.apply_update(u),
        (target, _) => Err(AjpError::Config(format!("field does not apply to {}", target))),
    }
}
