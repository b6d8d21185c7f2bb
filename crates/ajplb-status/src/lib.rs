//! ajplb Status Interface
//!
//! Read and change the runtime state of a [`Connector`](ajplb_balancer::Connector)
//! through query-string commands, the way a web server status page
//! drives it.
//!
//! - [`StatusRequest`]: `cmd`, `mime`, `w`, `sw` and update fields parsed
//!   from a query string
//! - [`StatusService`]: executes `list`, `show`, `update`, `reset`,
//!   `recover`, `version` and `dump`
//! - [`StatusSnapshot`] and friends: serializable views of balancers,
//!   members and workers
//! - [`render`]: JSON or `key=value` properties output
//!
//! # Example
//!
//! ```no_run
//! use ajplb_balancer::{Connector, ConnectorConfig};
//! use ajplb_status::StatusService;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = Connector::open(ConnectorConfig::load("ajplb.toml")?)?;
//! let status = StatusService::new(&connector);
//!
//! // Take node1 out of rotation without dropping its sessions.
//! println!("{}", status.handle_query("cmd=update&w=lb&sw=node1&vwa=DIS")?);
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod render;
pub mod service;
pub mod snapshot;

pub use command::{parse_field, Command, FieldUpdate, Mime, StatusRequest};
pub use render::{properties, render};
pub use service::{RejectedField, StatusReply, StatusService, UpdateReport};
pub use snapshot::{BalancerSnapshot, MemberSnapshot, StatusSnapshot, WorkerSnapshot};
