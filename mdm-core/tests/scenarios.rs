//! Cross-module scenarios that don't belong to a single unit's
//! `#[cfg(test)]` block — these exercise the tree, subscription engine,
//! composite engine, and protocol manager together through the public API
//! only, the way an embedder would.

use mdm_core::{
    Body, CallArgs, CompareOp, Expr, Filter, FolderBuilder, HandleOutcome, Manager, Message,
    MessageKind, Namespace, NodeRef, Operation, ParamTemplate, RangeMode, Step, Tree,
    VariableHook, Value, ValueKind,
};

fn call(target: &str, args: CallArgs) -> Message {
    Message::request(
        "gateway",
        "manager",
        Namespace::Method,
        Operation::Call,
        Body::Call {
            node_ref: NodeRef::path(target),
            args,
            deadline: None,
        },
    )
}

fn write(target: &str, value: Value) -> Message {
    Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Write,
        Body::Write {
            node_ref: NodeRef::path(target),
            value,
        },
    )
}

fn read(target: &str) -> Message {
    Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Read,
        Body::Read {
            node_ref: NodeRef::path(target),
        },
    )
}

#[test]
fn addressing_roundtrip_then_not_found_after_removal() {
    let mut tree = Tree::new("root");
    let temp = FolderBuilder::root(&mut tree)
        .attach_numeric("temp", "", 20.0, None)
        .unwrap();

    assert_eq!(tree.resolve_path("root/temp").unwrap(), temp);
    assert_eq!(tree.resolve(&NodeRef::id(temp)).unwrap(), temp);
    assert_eq!(
        tree.resolve(&NodeRef::Both("root/temp".to_string(), temp)).unwrap(),
        temp
    );

    tree.remove(temp).unwrap();
    assert!(tree.resolve_path("root/temp").is_err());
    assert!(tree.resolve(&NodeRef::id(temp)).is_err());
}

#[test]
fn address_mismatch_when_path_and_id_disagree() {
    let mut tree = Tree::new("root");
    let mut builder = FolderBuilder::root(&mut tree);
    let a = builder.attach_numeric("a", "", 1.0, None).unwrap();
    builder.attach_numeric("b", "", 2.0, None).unwrap();

    let err = tree
        .resolve(&NodeRef::Both("root/b".to_string(), a))
        .unwrap_err();
    assert_eq!(err.code(), "ADDRESS_MISMATCH");
}

#[test]
fn hierarchical_propagation_fires_property_before_object() {
    let mut tree = Tree::new("root");
    let obj = FolderBuilder::root(&mut tree)
        .attach_object("station", "")
        .unwrap();
    FolderBuilder::new(&mut tree, obj)
        .attach_string("s", "", "")
        .unwrap();
    let mut manager = Manager::new(tree);

    let sub_prop = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Subscribe,
        Body::Subscribe {
            node_ref: NodeRef::path("root/station/s"),
            subscriber_id: "s_prop".into(),
            filter: Filter::All,
        },
    );
    manager.handle(sub_prop);
    let sub_obj = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Subscribe,
        Body::Subscribe {
            node_ref: NodeRef::path("root/station"),
            subscriber_id: "s_obj".into(),
            filter: Filter::All,
        },
    );
    manager.handle(sub_obj);

    manager.handle(write("root/station/s", Value::String("x".into())));
    let events: Vec<_> = manager.outbound().collect();
    assert_eq!(events.len(), 2, "property and object subscribers should both fire");
    assert_eq!(events[0].target, "s_prop");
    assert_eq!(events[1].target, "s_obj");
    let Body::Event { value, .. } = &events[1].body else {
        panic!("expected an Event body");
    };
    assert_eq!(
        value,
        &Value::Object(std::collections::BTreeMap::from([(
            "s".to_string(),
            Value::String("x".into())
        )]))
    );
}

#[test]
fn range_filter_fires_only_on_boundary_crossing() {
    let mut tree = Tree::new("root");
    FolderBuilder::root(&mut tree)
        .attach_numeric("pressure", "", 5.0, None)
        .unwrap();
    let mut manager = Manager::new(tree);

    manager.handle(Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Subscribe,
        Body::Subscribe {
            node_ref: NodeRef::path("root/pressure"),
            subscriber_id: "alarm".into(),
            filter: Filter::Range {
                low: 10.0,
                high: 20.0,
                mode: RangeMode::OnBoth,
            },
        },
    ));

    manager.handle(write("root/pressure", Value::Numeric(15.0))); // enters
    manager.handle(write("root/pressure", Value::Numeric(16.0))); // interior, no fire
    manager.handle(write("root/pressure", Value::Numeric(25.0))); // exits

    let events: Vec<_> = manager.outbound().collect();
    assert_eq!(events.len(), 2);
}

#[test]
fn composite_suspends_resumes_and_produces_declared_returns() {
    let mut tree = Tree::new("root");
    {
        let mut root = FolderBuilder::root(&mut tree);
        root.attach_boolean("b", "", true).unwrap();
        root.attach_numeric("n", "", 0.0, None).unwrap();
        root.attach_composite(
            "heat_and_read",
            "",
            Vec::new(),
            vec![ParamTemplate::new("out", ValueKind::Boolean)],
            vec![
                Step::Write {
                    target: NodeRef::path("root/n"),
                    value: Expr::literal(Value::Numeric(18.0)),
                },
                Step::Wait {
                    source: NodeRef::path("root/n"),
                    op: CompareOp::Eq,
                    rhs: Expr::literal(Value::Numeric(17.0)),
                },
                Step::Read {
                    source: NodeRef::path("root/b"),
                    store_as: "out".to_string(),
                },
            ],
        )
        .unwrap();
    }
    let mut manager = Manager::new(tree);

    let HandleOutcome::Deferred { accepted, scope_id } =
        manager.handle(call("root/heat_and_read", CallArgs::Positional(Vec::new())))
    else {
        panic!("expected the call to suspend");
    };
    assert_eq!(accepted.kind, MessageKind::Accepted);

    // A write that doesn't satisfy the wait predicate resumes nothing.
    manager.handle(write("root/n", Value::Numeric(3.0)));
    assert!(manager.outbound().next().is_none());

    manager.handle(write("root/n", Value::Numeric(17.0)));
    let completions: Vec<_> = manager.outbound().collect();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].id, accepted.id, "deferred reply must echo the original Call id");
    let Body::Success { returns, .. } = &completions[0].body else {
        panic!("expected Success body");
    };
    assert_eq!(returns, &Some(vec![Value::Boolean(true)]));
    let _ = scope_id;
}

#[test]
fn at_most_one_advance_per_write_defers_same_scope_rewrite() {
    // write(x, 1) then wait(x == 1): the write that starts the scope must not
    // let its own notification pass resume the same scope a second time
    // within the call to `invoke` — the wait is satisfied by re-entering on
    // a *later* write to x, not by looping inside the first.
    let mut tree = Tree::new("root");
    {
        let mut root = FolderBuilder::root(&mut tree);
        root.attach_numeric("x", "", 0.0, None).unwrap();
        root.attach_composite(
            "flip",
            "",
            Vec::new(),
            Vec::new(),
            vec![
                Step::Write {
                    target: NodeRef::path("root/x"),
                    value: Expr::literal(Value::Numeric(1.0)),
                },
                Step::Wait {
                    source: NodeRef::path("root/x"),
                    op: CompareOp::Eq,
                    rhs: Expr::literal(Value::Numeric(1.0)),
                },
            ],
        )
        .unwrap();
    }
    let mut manager = Manager::new(tree);

    let HandleOutcome::Deferred { .. } =
        manager.handle(call("root/flip", CallArgs::Positional(Vec::new())))
    else {
        panic!("the scope's own write(x,1) satisfies wait(x==1) on a *later* write, not its own — so invoke must still suspend");
    };

    // The scope is parked on x; a second write to x (even one already equal)
    // wakes it up properly instead of it having spun forever inside invoke.
    manager.handle(write("root/x", Value::Numeric(1.0)));
    let completions: Vec<_> = manager
        .outbound()
        .filter(|m| m.namespace == Namespace::Method)
        .collect();
    assert_eq!(completions.len(), 1);
}

#[test]
fn explicit_cancel_emits_cancelled_deferred_reply() {
    let mut tree = Tree::new("root");
    {
        let mut root = FolderBuilder::root(&mut tree);
        root.attach_numeric("never", "", 0.0, None).unwrap();
        root.attach_composite(
            "park_forever",
            "",
            Vec::new(),
            Vec::new(),
            vec![Step::Wait {
                source: NodeRef::path("root/never"),
                op: CompareOp::Gt,
                rhs: Expr::literal(Value::Numeric(1e9)),
            }],
        )
        .unwrap();
    }
    let mut manager = Manager::new(tree);

    let HandleOutcome::Deferred { scope_id, .. } =
        manager.handle(call("root/park_forever", CallArgs::Positional(Vec::new())))
    else {
        panic!("expected suspension");
    };
    manager.cancel(scope_id).unwrap();
    let completions: Vec<_> = manager.outbound().collect();
    assert_eq!(completions.len(), 1);
    let Body::Error { code, .. } = &completions[0].body else {
        panic!("expected an Error body");
    };
    assert_eq!(*code, "CANCELLED");

    // Cancelling again is a no-op: no pending caller, no second reply.
    manager.cancel(scope_id).unwrap();
    assert!(manager.outbound().next().is_none());
}

#[test]
fn dependency_loss_cancels_the_waiting_scope() {
    let mut tree = Tree::new("root");
    {
        let mut root = FolderBuilder::root(&mut tree);
        root.attach_numeric("tmp", "", 0.0, None).unwrap();
        root.attach_composite(
            "wait_on_tmp",
            "",
            Vec::new(),
            Vec::new(),
            vec![Step::Wait {
                source: NodeRef::path("root/tmp"),
                op: CompareOp::Gt,
                rhs: Expr::literal(Value::Numeric(1000.0)),
            }],
        )
        .unwrap();
    }
    let mut manager = Manager::new(tree);

    let HandleOutcome::Deferred { scope_id, .. } =
        manager.handle(call("root/wait_on_tmp", CallArgs::Positional(Vec::new())))
    else {
        panic!("expected suspension");
    };

    let tmp_id = manager.tree().resolve_path("root/tmp").unwrap();
    manager.remove_node(tmp_id).unwrap();

    let completions: Vec<_> = manager.outbound().collect();
    assert_eq!(completions.len(), 1);
    let Body::Error { code, .. } = &completions[0].body else {
        panic!("expected an Error body");
    };
    assert_eq!(*code, "DEPENDENCY_LOST");

    manager.cancel(scope_id).unwrap();
    assert!(manager.outbound().next().is_none());
}

#[test]
fn bound_pre_update_hook_vetoes_write_through_the_manager() {
    let mut tree = Tree::new("root");
    FolderBuilder::root(&mut tree)
        .attach_numeric("valve", "", 0.0, None)
        .unwrap();
    tree.bind_variable_hook(
        &NodeRef::path("root/valve"),
        VariableHook::PreUpdate(Box::new(|v: &Value| !matches!(v, Value::Numeric(n) if *n > 50.0))),
    )
    .unwrap();
    let mut manager = Manager::new(tree);

    let HandleOutcome::Immediate(reply) = manager.handle(write("root/valve", Value::Numeric(99.0)))
    else {
        panic!("write is always immediate");
    };
    let Body::Error { code, .. } = reply.body else {
        panic!("expected the pre_update hook to veto");
    };
    assert_eq!(code, "VETOED");

    let HandleOutcome::Immediate(reply) = manager.handle(read("root/valve")) else {
        panic!("read is always immediate");
    };
    let Body::Success { value, .. } = reply.body else {
        panic!("expected Success body");
    };
    assert_eq!(value, Some(Value::Numeric(0.0)), "vetoed write must not change the value");
}

#[test]
fn unbound_method_callback_fails_with_unbound_callback() {
    let mut tree = Tree::new("root");
    FolderBuilder::root(&mut tree)
        .attach_method("ping", "", Vec::new(), Vec::new())
        .unwrap();
    let mut manager = Manager::new(tree);

    let HandleOutcome::Immediate(reply) =
        manager.handle(call("root/ping", CallArgs::Positional(Vec::new())))
    else {
        panic!("direct method calls are always immediate");
    };
    let Body::Error { code, .. } = reply.body else {
        panic!("expected an Error body");
    };
    assert_eq!(code, "UNBOUND_CALLBACK");
}

#[test]
fn bound_method_callback_runs_and_fires_invoke_hooks() {
    let mut tree = Tree::new("root");
    FolderBuilder::root(&mut tree)
        .attach_method(
            "double",
            "",
            vec![ParamTemplate::new("x", ValueKind::Numeric)],
            vec![ParamTemplate::new("y", ValueKind::Numeric)],
        )
        .unwrap();
    tree.bind_method_callback(
        &NodeRef::path("root/double"),
        Box::new(|args: &[Value]| {
            let x = args[0].as_numeric().unwrap();
            Ok(vec![Value::Numeric(x * 2.0)])
        }),
    )
    .unwrap();

    let invoked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let invoked_clone = invoked.clone();
    tree.bind_method_pre_invoke(
        &NodeRef::path("root/double"),
        Box::new(move |_args: &[Value]| {
            invoked_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        }),
    )
    .unwrap();

    let mut manager = Manager::new(tree);
    let HandleOutcome::Immediate(reply) = manager.handle(call(
        "root/double",
        CallArgs::Positional(vec![Value::Numeric(21.0)]),
    )) else {
        panic!("direct method calls are always immediate");
    };
    let Body::Success { returns, .. } = reply.body else {
        panic!("expected Success body");
    };
    assert_eq!(returns, Some(vec![Value::Numeric(42.0)]));
    assert!(invoked.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn call_async_step_binds_its_acknowledgement_and_lets_the_graph_continue() {
    let mut tree = Tree::new("root");
    {
        let mut root = FolderBuilder::root(&mut tree);
        root.attach_async_method(
            "ack",
            "",
            Vec::new(),
            vec![ParamTemplate::new("handle", ValueKind::String)],
        )
        .unwrap();
        root.attach_composite(
            "kick_off",
            "",
            Vec::new(),
            vec![ParamTemplate::new("handle", ValueKind::String)],
            vec![Step::CallAsync {
                method: NodeRef::path("root/ack"),
                args: Vec::new(),
                store_returns_as: Some("handle".to_string()),
            }],
        )
        .unwrap();
    }
    tree.bind_method_callback(
        &NodeRef::path("root/ack"),
        Box::new(|_args: &[Value]| Ok(vec![Value::String("job-1".to_string())])),
    )
    .unwrap();
    let mut manager = Manager::new(tree);

    let HandleOutcome::Immediate(reply) =
        manager.handle(call("root/kick_off", CallArgs::Positional(Vec::new())))
    else {
        panic!("a composite with no Wait steps completes synchronously");
    };
    let Body::Success { returns, .. } = reply.body else {
        panic!("expected Success body");
    };
    assert_eq!(returns, Some(vec![Value::String("job-1".to_string())]));
}

#[test]
fn a_failing_resumed_scope_does_not_abort_the_triggering_write_or_its_siblings() {
    // Two scopes both park on x == 1. The first (`bad`) resumes into a Read
    // step that targets a node which doesn't exist, so its resume fails. The
    // second (`good`) resumes into a normal completion. Both are woken by the
    // same write; the failing one must surface as its own deferred Error, not
    // as the Write request's own reply, and must not stop `good` from
    // resuming and completing normally.
    let mut tree = Tree::new("root");
    {
        let mut root = FolderBuilder::root(&mut tree);
        root.attach_numeric("x", "", 0.0, None).unwrap();
        root.attach_boolean("b", "", true).unwrap();
        root.attach_composite(
            "bad",
            "",
            Vec::new(),
            Vec::new(),
            vec![
                Step::Wait {
                    source: NodeRef::path("root/x"),
                    op: CompareOp::Eq,
                    rhs: Expr::literal(Value::Numeric(1.0)),
                },
                Step::Read {
                    source: NodeRef::path("root/does_not_exist"),
                    store_as: "out".to_string(),
                },
            ],
        )
        .unwrap();
        root.attach_composite(
            "good",
            "",
            Vec::new(),
            vec![ParamTemplate::new("out", ValueKind::Boolean)],
            vec![
                Step::Wait {
                    source: NodeRef::path("root/x"),
                    op: CompareOp::Eq,
                    rhs: Expr::literal(Value::Numeric(1.0)),
                },
                Step::Read {
                    source: NodeRef::path("root/b"),
                    store_as: "out".to_string(),
                },
            ],
        )
        .unwrap();
    }
    let mut manager = Manager::new(tree);

    let HandleOutcome::Deferred { scope_id: bad_id, .. } =
        manager.handle(call("root/bad", CallArgs::Positional(Vec::new())))
    else {
        panic!("expected suspension");
    };
    let HandleOutcome::Deferred { scope_id: good_id, .. } =
        manager.handle(call("root/good", CallArgs::Positional(Vec::new())))
    else {
        panic!("expected suspension");
    };

    let HandleOutcome::Immediate(write_reply) = manager.handle(write("root/x", Value::Numeric(1.0)))
    else {
        panic!("Variable.Write is always immediate");
    };
    assert_eq!(
        write_reply.kind,
        MessageKind::Success,
        "the triggering write must succeed even though a woken scope fails"
    );

    let completions: Vec<_> = manager
        .outbound()
        .filter(|m| m.namespace == Namespace::Method)
        .collect();
    assert_eq!(completions.len(), 2, "both woken scopes get their own deferred reply");

    let bad_reply = completions
        .iter()
        .find(|m| matches!(m.body, Body::Error { .. }))
        .expect("the failing scope's resume must produce a deferred Error");
    let Body::Error { code, .. } = &bad_reply.body else {
        unreachable!()
    };
    assert_eq!(*code, "NOT_FOUND");

    let good_reply = completions
        .iter()
        .find(|m| matches!(m.body, Body::Success { .. }))
        .expect("the sibling scope must still complete normally");
    let Body::Success { returns, .. } = &good_reply.body else {
        unreachable!()
    };
    assert_eq!(returns, &Some(vec![Value::Boolean(true)]));

    // Cancelling the already-failed (and already-disposed) scope is a no-op.
    manager.cancel(bad_id).unwrap();
    manager.cancel(good_id).unwrap();
    assert!(manager.outbound().next().is_none());
}

#[test]
fn object_field_wise_write_is_partial_not_transactional() {
    let mut tree = Tree::new("root");
    let obj = FolderBuilder::root(&mut tree)
        .attach_object("station", "")
        .unwrap();
    {
        let mut station = FolderBuilder::new(&mut tree, obj);
        station.attach_numeric("pressure", "", 0.0, Some((0.0, 10.0))).unwrap();
        station.attach_string("label", "", "").unwrap();
    }
    let mut manager = Manager::new(tree);

    let write = Message::request(
        "gateway",
        "manager",
        Namespace::Variable,
        Operation::Write,
        Body::Write {
            node_ref: NodeRef::path("root/station"),
            value: Value::Object(std::collections::BTreeMap::from([
                ("pressure".to_string(), Value::Numeric(999.0)), // out of range, rejected
                ("label".to_string(), Value::String("ok".to_string())), // accepted
            ])),
        },
    );
    manager.handle(write);

    let HandleOutcome::Immediate(reply) = manager.handle(read("root/station/label")) else {
        panic!("read is always immediate");
    };
    let Body::Success { value, .. } = reply.body else {
        panic!("expected Success body");
    };
    assert_eq!(value, Some(Value::String("ok".to_string())));

    let HandleOutcome::Immediate(reply) = manager.handle(read("root/station/pressure")) else {
        panic!("read is always immediate");
    };
    let Body::Success { value, .. } = reply.body else {
        panic!("expected Success body");
    };
    assert_eq!(value, Some(Value::Numeric(0.0)), "out-of-range field must not have been applied");
}
