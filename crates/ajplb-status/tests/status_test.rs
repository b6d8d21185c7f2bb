use std::sync::Arc;

use ajplb_balancer::{Connector, ConnectorConfig, Outcome};
use ajplb_common::runtime::Record;
use ajplb_common::{AjpError, Activation, ForwardRequest, LbMethod, MemberState, RuntimeRegistry};
use ajplb_status::{Command, StatusReply, StatusRequest, StatusService};

const CONFIG: &str = r#"
    [[worker]]
    name = "node1"
    host = "127.0.0.1"
    port = 1

    [[worker]]
    name = "node2"
    host = "127.0.0.1"
    port = 2

    [[worker]]
    name = "solo"
    host = "127.0.0.1"
    port = 3

    [[balancer]]
    name = "lb"
    [[balancer.member]]
    worker = "node1"
    [[balancer.member]]
    worker = "node2"
    lb_factor = 3
"#;

fn connector() -> Connector {
    let config = ConnectorConfig::from_toml_str(CONFIG).unwrap();
    Connector::from_config(config, Arc::new(RuntimeRegistry::in_memory())).unwrap()
}

fn read_only_connector() -> Connector {
    let mut config = ConnectorConfig::from_toml_str(CONFIG).unwrap();
    config.status.read_only = true;
    Connector::from_config(config, Arc::new(RuntimeRegistry::in_memory())).unwrap()
}

fn query(connector: &Connector, q: &str) -> Result<StatusReply, AjpError> {
    StatusService::new(connector).execute(&StatusRequest::parse(q).unwrap())
}

/// Sends one failing request's worth of outcome to the first member.
fn quarantine_first(connector: &Connector) {
    let lb = connector.balancer("lb").unwrap();
    let selection = lb
        .try_select(&ForwardRequest::new("GET", "/"), &[1])
        .unwrap()
        .unwrap();
    lb.record_outcome(&selection, &Outcome::Failure("connection refused".into()));
}

#[test]
fn test_list_snapshot() {
    let connector = connector();
    let StatusReply::List(snapshot) = query(&connector, "cmd=list").unwrap() else {
        panic!("expected a list reply");
    };
    assert_eq!(snapshot.version, env!("CARGO_PKG_VERSION"));
    assert_eq!(snapshot.balancers.len(), 1);
    assert_eq!(snapshot.workers.len(), 1);
    assert_eq!(snapshot.workers[0].name, "solo");

    let lb = &snapshot.balancers[0];
    assert_eq!(lb.members.len(), 2);
    assert_eq!(lb.members[1].lb_factor, 3);
    assert_eq!(lb.members[0].worker.port, 1);
    assert_eq!((lb.good, lb.degraded, lb.bad), (2, 0, 0));
}

#[test]
fn test_list_renders_json() {
    let connector = connector();
    let body = StatusService::new(&connector).handle_query("").unwrap();
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["balancers"][0]["name"], "lb");
    assert_eq!(value["balancers"][0]["members"][1]["lb_factor"], 3);
}

#[test]
fn test_show_member_as_properties() {
    let connector = connector();
    let body = StatusService::new(&connector)
        .handle_query("cmd=show&w=lb&sw=node1&mime=prop")
        .unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert!(lines.contains(&"ajplb.name=node1"));
    assert!(lines.contains(&"ajplb.activation=ACT"));
    assert!(lines.contains(&"ajplb.worker.host=127.0.0.1"));
}

#[test]
fn test_show_plain_worker() {
    let connector = connector();
    let reply = query(&connector, "cmd=show&w=solo").unwrap();
    assert!(matches!(reply, StatusReply::Worker(w) if w.name == "solo" && w.port == 3));
}

#[test]
fn test_unknown_targets() {
    let connector = connector();
    assert!(matches!(
        query(&connector, "cmd=show&w=nope"),
        Err(AjpError::UnknownWorker(_))
    ));
    assert!(matches!(
        query(&connector, "cmd=show&w=lb&sw=nope"),
        Err(AjpError::UnknownWorker(_))
    ));
    assert!(matches!(
        query(&connector, "cmd=reset"),
        Err(AjpError::Config(_))
    ));
    assert!(matches!(
        query(&connector, "cmd=show&w=solo&sw=x"),
        Err(AjpError::Config(_))
    ));
}

#[test]
fn test_update_member_applies_each_field() {
    let connector = connector();
    let reply = query(&connector, "cmd=update&w=lb&sw=node1&vwa=DIS&vwf=0&vwn=dc1.n1&vlm=b").unwrap();
    let StatusReply::Update(report) = reply else {
        panic!("expected an update report");
    };
    assert_eq!(report.target, "member 'lb/node1'");
    assert_eq!(report.applied, vec!["vwa", "vwn"]);
    let rejected: Vec<&str> = report.rejected.iter().map(|r| r.field.as_str()).collect();
    assert_eq!(rejected, vec!["vwf", "vlm"]);
    assert!(!report.is_clean());

    let lb = connector.balancer("lb").unwrap();
    let member = &lb.member_snapshot()[0];
    assert_eq!(member.activation, Activation::Disabled);
    assert_eq!(member.route, "dc1.n1");
    assert_eq!(member.lb_factor, 1);
    // The method belongs to the balancer, not the member.
    assert_eq!(lb.settings().method, LbMethod::Requests);
}

#[test]
fn test_route_change_derives_domain() {
    let connector = connector();
    query(&connector, "cmd=update&w=lb&sw=node2&vwn=dc2.node2").unwrap();
    let member = &connector.balancer("lb").unwrap().member_snapshot()[1];
    assert_eq!(member.domain, "dc2");
}

#[test]
fn test_update_member_worker_fields() {
    let connector = connector();
    query(&connector, "cmd=update&w=lb&sw=node2&vaprt=9009&vart=2500").unwrap();
    let config = connector.worker("node2").unwrap().config();
    assert_eq!(config.port, 9009);
    assert_eq!(config.reply_timeout_ms, 2500);
}

#[test]
fn test_update_balancer_settings() {
    let connector = connector();
    query(&connector, "cmd=update&w=lb&vlr=5&vls=0&vlm=busyness&vll=p").unwrap();
    let settings = connector.balancer("lb").unwrap().settings();
    assert_eq!(settings.retries, 5);
    assert!(!settings.sticky_session);
    assert_eq!(settings.method, LbMethod::Busyness);
    assert_eq!(settings.lock, ajplb_common::LockMode::Pessimistic);
}

#[test]
fn test_factor_update_recomputes_multipliers() {
    let connector = connector();
    query(&connector, "cmd=update&w=lb&sw=node1&vwf=3").unwrap();
    let members = connector.balancer("lb").unwrap().member_snapshot();
    assert_eq!(members[0].lb_mult, members[1].lb_mult);
}

#[test]
fn test_read_only_rejects_changes() {
    let connector = read_only_connector();
    for q in ["cmd=update&w=lb&vlr=1", "cmd=reset&w=lb", "cmd=recover&w=lb&sw=node1"] {
        assert!(matches!(query(&connector, q), Err(AjpError::ReadOnly)), "{}", q);
    }
    assert!(query(&connector, "cmd=show&w=lb").is_ok());
    assert!(query(&connector, "cmd=version").is_ok());
}

#[test]
fn test_recover_requires_quarantine() {
    let connector = connector();
    assert!(matches!(
        query(&connector, "cmd=recover&w=lb&sw=node1"),
        Err(AjpError::Config(_))
    ));
    assert!(matches!(
        query(&connector, "cmd=recover&w=lb"),
        Err(AjpError::Config(_))
    ));

    quarantine_first(&connector);
    let lb = connector.balancer("lb").unwrap();
    assert_eq!(lb.member_snapshot()[0].state, MemberState::Error);

    let reply = query(&connector, "cmd=recover&w=lb&sw=node1").unwrap();
    assert!(matches!(reply, StatusReply::Done { .. }));
    assert_eq!(lb.member_snapshot()[0].state, MemberState::Recover);
}

#[test]
fn test_reset_member_clears_error() {
    let connector = connector();
    quarantine_first(&connector);
    query(&connector, "cmd=reset&w=lb&sw=node1").unwrap();

    let member = &connector.balancer("lb").unwrap().member_snapshot()[0];
    assert_eq!(member.state, MemberState::Idle);
    assert_eq!(member.errors, 0);
}

#[test]
fn test_reset_balancer_counts_bad_members() {
    let connector = connector();
    quarantine_first(&connector);
    let StatusReply::Balancer(before) = query(&connector, "cmd=show&w=lb").unwrap() else {
        panic!("expected a balancer reply");
    };
    assert_eq!(before.bad, 1);

    query(&connector, "cmd=reset&w=lb").unwrap();
    let StatusReply::Balancer(after) = query(&connector, "cmd=show&w=lb").unwrap() else {
        panic!("expected a balancer reply");
    };
    assert_eq!(after.bad, 0);
    assert!(after.last_reset > 0);
}

#[test]
fn test_version_and_dump() {
    let connector = connector();
    let reply = query(&connector, "cmd=version").unwrap();
    assert_eq!(
        reply,
        StatusReply::Version {
            version: env!("CARGO_PKG_VERSION").to_string()
        }
    );

    let StatusReply::Dump { records } = query(&connector, "cmd=dump").unwrap() else {
        panic!("expected a dump reply");
    };
    let workers = records.iter().filter(|r| matches!(r, Record::Worker(_))).count();
    let members = records.iter().filter(|r| matches!(r, Record::Member(_))).count();
    let balancers = records.iter().filter(|r| matches!(r, Record::Balancer(_))).count();
    assert_eq!((workers, members, balancers), (3, 2, 1));
}

#[test]
fn test_request_builder() {
    let request = StatusRequest::new(Command::Update)
        .with_worker("lb")
        .with_sub_worker("node1")
        .with_field("vwd", "2");
    let reply = StatusService::new(&connector()).execute(&request).unwrap();
    assert!(matches!(reply, StatusReply::Update(r) if r.is_clean()));
}
