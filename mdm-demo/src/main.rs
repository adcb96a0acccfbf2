//! Demo harness for `mdm-core`: builds a fixture tree and drives six
//! concrete scenarios through a `Manager`, logging every dispatch. No network
//! listener — the core has none of its own, and wiring one is left to a real
//! embedder.

use anyhow::{bail, Context, Result};
use mdm_core::{
    Body, CallArgs, CompareOp, Expr, Filter, FolderBuilder, HandleOutcome, Manager, Message,
    MessageKind, Namespace, NodeRef, Operation, ParamTemplate, Step, Tree, Value, ValueKind,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn build_tree() -> Result<Tree> {
    let mut tree = Tree::new("root");

    {
        let mut root = FolderBuilder::root(&mut tree);
        root.attach_boolean("b", "scenario 1: simple read/write", false)?;
        root.attach_numeric("n", "scenario 2: bounded numeric", 5.0, Some((0.0, 10.0)))?;
        root.attach_numeric("deadband_n", "scenario 3: deadband subscription", 5.0, None)?;
        root.attach_object("obj", "scenario 5: object with a property")?;
        root.attach_numeric("heat_target", "scenario 4: composite wait target", 0.0, None)?;
        root.attach_composite(
            "heat_and_read",
            "scenario 4: write heat_target, wait for it, read b",
            Vec::new(),
            vec![ParamTemplate::new("out", ValueKind::Boolean)],
            vec![
                Step::Write {
                    target: NodeRef::path("root/heat_target"),
                    value: Expr::literal(Value::Numeric(18.0)),
                },
                Step::Wait {
                    source: NodeRef::path("root/heat_target"),
                    op: CompareOp::Eq,
                    rhs: Expr::literal(Value::Numeric(17.0)),
                },
                Step::Read {
                    source: NodeRef::path("root/b"),
                    store_as: "out".to_string(),
                },
            ],
        )?;
        root.attach_numeric("tmp", "scenario 6: dependency that gets removed", 0.0, None)?;
        root.attach_composite(
            "wait_on_tmp",
            "scenario 6: parks forever on tmp until it's removed",
            Vec::new(),
            Vec::new(),
            vec![Step::Wait {
                source: NodeRef::path("root/tmp"),
                op: CompareOp::Gt,
                rhs: Expr::literal(Value::Numeric(1000.0)),
            }],
        )?;
    }

    let obj = tree.resolve_path("root/obj")?;
    FolderBuilder::new(&mut tree, obj).attach_string("s", "scenario 5: property", "")?;

    Ok(tree)
}

fn expect_success(outcome: HandleOutcome, label: &str) -> Result<Message> {
    match outcome {
        HandleOutcome::Immediate(reply) if reply.kind == MessageKind::Success => Ok(reply),
        HandleOutcome::Immediate(reply) => bail!(
            "{label}: expected Success, got {:?} ({:?})",
            reply.kind,
            describe_body(&reply.body)
        ),
        HandleOutcome::Deferred { .. } => bail!("{label}: expected immediate reply, got Accepted"),
    }
}

fn expect_error(outcome: HandleOutcome, label: &str) -> Result<&'static str> {
    match outcome {
        HandleOutcome::Immediate(reply) => match reply.body {
            Body::Error { code, .. } => Ok(code),
            other => bail!("{label}: expected Error, got {:?}", describe_body(&other)),
        },
        HandleOutcome::Deferred { .. } => bail!("{label}: expected immediate reply, got Accepted"),
    }
}

fn describe_body(body: &Body) -> &'static str {
    match body {
        Body::Read { .. } => "Read",
        Body::Write { .. } => "Write",
        Body::Subscribe { .. } => "Subscribe",
        Body::Unsubscribe { .. } => "Unsubscribe",
        Body::Call { .. } => "Call",
        Body::Success { .. } => "Success",
        Body::Accepted { .. } => "Accepted",
        Body::Error { .. } => "Error",
        Body::Event { .. } => "Event",
    }
}

fn scenario_1_simple_read_write(manager: &mut Manager) -> Result<()> {
    tracing::info!("scenario 1: simple read/write");
    let write = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Write,
        Body::Write {
            node_ref: NodeRef::path("root/b"),
            value: Value::Boolean(true),
        },
    );
    expect_success(manager.handle(write), "write root/b")?;

    let read = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Read,
        Body::Read {
            node_ref: NodeRef::path("root/b"),
        },
    );
    let reply = expect_success(manager.handle(read), "read root/b")?;
    let Body::Success { value, .. } = reply.body else {
        unreachable!("checked by expect_success");
    };
    if value != Some(Value::Boolean(true)) {
        bail!("root/b did not read back true");
    }
    tracing::info!(value = ?value, "root/b read back");
    Ok(())
}

fn scenario_2_numeric_bounds(manager: &mut Manager) -> Result<()> {
    tracing::info!("scenario 2: numeric bounds");
    let write = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Write,
        Body::Write {
            node_ref: NodeRef::path("root/n"),
            value: Value::Numeric(11.0),
        },
    );
    let code = expect_error(manager.handle(write), "write root/n=11")?;
    if code != "OUT_OF_RANGE" {
        bail!("expected OUT_OF_RANGE, got {code}");
    }

    let read = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Read,
        Body::Read {
            node_ref: NodeRef::path("root/n"),
        },
    );
    let reply = expect_success(manager.handle(read), "read root/n")?;
    let Body::Success { value, .. } = reply.body else {
        unreachable!()
    };
    if value != Some(Value::Numeric(5.0)) {
        bail!("root/n should still read 5.0 after a rejected write");
    }
    tracing::info!("root/n rejected out-of-range write and held its value");
    Ok(())
}

fn scenario_3_deadband(manager: &mut Manager) -> Result<()> {
    tracing::info!("scenario 3: deadband subscription");
    let subscribe = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Subscribe,
        Body::Subscribe {
            node_ref: NodeRef::path("root/deadband_n"),
            subscriber_id: "dashboard".into(),
            filter: Filter::DataChange { deadband: 2.0 },
        },
    );
    expect_success(manager.handle(subscribe), "subscribe root/deadband_n")?;

    for v in [6.0, 5.0] {
        let write = Message::request(
            "gateway",
            "manager",
            Namespace::Variable,
            Operation::Write,
            Body::Write {
                node_ref: NodeRef::path("root/deadband_n"),
                value: Value::Numeric(v),
            },
        );
        expect_success(manager.handle(write), "write root/deadband_n")?;
    }
    let quiet: Vec<_> = manager.outbound().collect();
    if !quiet.is_empty() {
        bail!("expected zero notifications inside the deadband, got {}", quiet.len());
    }

    let write = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Write,
        Body::Write {
            node_ref: NodeRef::path("root/deadband_n"),
            value: Value::Numeric(8.0),
        },
    );
    expect_success(manager.handle(write), "write root/deadband_n=8")?;
    let events: Vec<_> = manager.outbound().collect();
    if events.len() != 1 {
        bail!("expected exactly one notification past the deadband, got {}", events.len());
    }
    tracing::info!(count = events.len(), "deadband crossed, notification delivered");
    Ok(())
}

fn scenario_4_composite_wait(manager: &mut Manager) -> Result<()> {
    tracing::info!("scenario 4: composite suspend/resume");
    let call = Message::request(
        "gateway",
        "manager",
        Namespace::Method,
        Operation::Call,
        Body::Call {
            node_ref: NodeRef::path("root/heat_and_read"),
            args: CallArgs::Positional(Vec::new()),
            deadline: None,
        },
    );
    let HandleOutcome::Deferred { accepted, scope_id } = manager.handle(call) else {
        bail!("expected the composite call to suspend and return Accepted");
    };
    tracing::info!(?scope_id, kind = ?accepted.kind, "call suspended on wait(heat_target == 17)");

    let write = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Write,
        Body::Write {
            node_ref: NodeRef::path("root/heat_target"),
            value: Value::Numeric(17.0),
        },
    );
    expect_success(manager.handle(write), "write root/heat_target=17")?;

    let completions: Vec<_> = manager
        .outbound()
        .filter(|m| m.kind == MessageKind::Success && m.namespace == Namespace::Method)
        .collect();
    if completions.len() != 1 {
        bail!("expected exactly one deferred completion, got {}", completions.len());
    }
    let Body::Success { returns, .. } = &completions[0].body else {
        bail!("deferred completion missing a Success body");
    };
    tracing::info!(returns = ?returns, "composite method resumed and completed");
    Ok(())
}

fn scenario_5_hierarchical_notify(manager: &mut Manager) -> Result<()> {
    tracing::info!("scenario 5: hierarchical propagation");
    let sub_prop = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Subscribe,
        Body::Subscribe {
            node_ref: NodeRef::path("root/obj/s"),
            subscriber_id: "s_prop".into(),
            filter: Filter::All,
        },
    );
    expect_success(manager.handle(sub_prop), "subscribe root/obj/s")?;
    let sub_obj = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Subscribe,
        Body::Subscribe {
            node_ref: NodeRef::path("root/obj"),
            subscriber_id: "s_obj".into(),
            filter: Filter::All,
        },
    );
    expect_success(manager.handle(sub_obj), "subscribe root/obj")?;

    let write = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Write,
        Body::Write {
            node_ref: NodeRef::path("root/obj/s"),
            value: Value::String("x".to_string()),
        },
    );
    expect_success(manager.handle(write), "write root/obj/s")?;
    let events: Vec<_> = manager.outbound().collect();
    if events.len() != 2 {
        bail!("expected property then object to fire, got {} events", events.len());
    }
    if events[0].target != "s_prop" || events[1].target != "s_obj" {
        bail!("property subscriber must fire before the object subscriber");
    }
    tracing::info!("root/obj/s fired before root/obj, as hierarchical propagation requires");
    Ok(())
}

fn scenario_6_dependency_lost(manager: &mut Manager) -> Result<()> {
    tracing::info!("scenario 6: cancellation on dependency loss");
    let call = Message::request(
        "gateway",
        "manager",
        Namespace::Method,
        Operation::Call,
        Body::Call {
            node_ref: NodeRef::path("root/wait_on_tmp"),
            args: CallArgs::Positional(Vec::new()),
            deadline: None,
        },
    );
    let HandleOutcome::Deferred { scope_id, .. } = manager.handle(call) else {
        bail!("expected wait_on_tmp to suspend immediately");
    };

    let tmp_id = manager
        .tree()
        .resolve_path("root/tmp")
        .context("resolving root/tmp before removal")?;
    manager.remove_node(tmp_id)?;

    let completions: Vec<_> = manager
        .outbound()
        .filter(|m| m.namespace == Namespace::Method)
        .collect();
    if completions.len() != 1 {
        bail!("expected exactly one deferred completion after removal, got {}", completions.len());
    }
    let Body::Error { code, .. } = &completions[0].body else {
        bail!("expected the deferred completion to be an Error");
    };
    if *code != "DEPENDENCY_LOST" {
        bail!("expected DEPENDENCY_LOST, got {code}");
    }

    // A subsequent explicit cancel of the same scope is a no-op: the scope
    // registry and pending-call table no longer know about it.
    manager.cancel(scope_id)?;
    let stray: Vec<_> = manager.outbound().collect();
    if !stray.is_empty() {
        bail!("cancelling an already-resolved scope should not emit anything");
    }
    tracing::info!("removed node cancelled its dependent scope with DEPENDENCY_LOST");
    Ok(())
}

fn main() -> Result<()> {
    let verbose = std::env::args().any(|a| a == "--verbose" || a == "-v");
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let run_id = Uuid::now_v7();
    tracing::info!(%run_id, "starting demo run");

    let tree = build_tree().context("building fixture tree")?;
    let mut manager = Manager::new(tree);

    scenario_1_simple_read_write(&mut manager)?;
    scenario_2_numeric_bounds(&mut manager)?;
    scenario_3_deadband(&mut manager)?;
    scenario_4_composite_wait(&mut manager)?;
    scenario_5_hierarchical_notify(&mut manager)?;
    scenario_6_dependency_lost(&mut manager)?;

    let summary = serde_json::json!({
        "run_id": run_id.to_string(),
        "scenarios": 6,
        "status": "passed",
    });
    tracing::info!(summary = %summary, "all scenarios passed");
    Ok(())
}
