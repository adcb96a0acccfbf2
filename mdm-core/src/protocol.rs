//! The protocol manager: routes envelope `Message`s against the tree
//! and composite engine, and queues outbound notifications / deferred
//! completions for the embedder to drain.

use crate::addressing::NodeRef;
use crate::composite::{Engine, StepOutcome};
use crate::errors::{CoreError, CoreResult};
use crate::ids::{Identifier, ScopeId, SubscriberId, SubscriptionId};
use crate::steps::Frame;
use crate::subscription::Filter;
use crate::tree::{NodeKind, Tree};
use crate::value::Value;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Epoch-millisecond sample time, matching the control-flow engine's own
/// `now_ms()` helper (`SystemTime::now().duration_since(UNIX_EPOCH)`).
fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

pub type MessageId = Identifier;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MessageKind {
    Request,
    Success,
    Error,
    Accepted,
    Event,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Namespace {
    Variable,
    Method,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Operation {
    Read,
    Write,
    Subscribe,
    Unsubscribe,
    Call,
}

/// Request body shapes, one per dispatch-table row. `Serialize`-only,
/// not `Deserialize`: `Error::code` is `&'static str` tied to the fixed
/// error-code table, not a wire value a deserializer can reconstruct.
/// Embedders forward an outbound `Message` to a JSON-based transport or log
/// sink by serializing it; inbound requests go through the typed `Body`
/// constructors, not through JSON deserialization.
#[derive(Serialize)]
pub enum Body {
    Read {
        node_ref: NodeRef,
    },
    Write {
        node_ref: NodeRef,
        value: Value,
    },
    Subscribe {
        node_ref: NodeRef,
        subscriber_id: SubscriberId,
        filter: Filter,
    },
    Unsubscribe {
        node_ref: NodeRef,
        subscription_id: SubscriptionId,
    },
    Call {
        node_ref: NodeRef,
        args: CallArgs,
        deadline: Option<Duration>,
    },
    Success {
        value: Option<Value>,
        /// Epoch-millisecond sample time; populated for `Variable.Read`
        /// replies only, as the dispatch table specifies `Success{value,
        /// timestamp}` for that row and `Success{}` for the others.
        timestamp: Option<i64>,
        subscription_id: Option<SubscriptionId>,
        returns: Option<Vec<Value>>,
    },
    Accepted {
        scope_id: ScopeId,
    },
    Error {
        code: &'static str,
        detail: String,
    },
    Event {
        node_ref: NodeRef,
        value: Value,
        subscription_id: SubscriptionId,
    },
}

/// Positional or named call arguments — a `Call` supports either.
#[derive(Serialize)]
pub enum CallArgs {
    Positional(Vec<Value>),
    Named(BTreeMap<String, Value>),
}

#[derive(Serialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: String,
    pub target: String,
    pub kind: MessageKind,
    pub namespace: Namespace,
    pub name: Operation,
    pub body: Body,
}

impl Message {
    pub fn request(
        sender: impl Into<String>,
        target: impl Into<String>,
        namespace: Namespace,
        name: Operation,
        body: Body,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender: sender.into(),
            target: target.into(),
            kind: MessageKind::Request,
            namespace,
            name,
            body,
        }
    }

    fn reply(&self, kind: MessageKind, body: Body) -> Self {
        Self {
            id: self.id,
            sender: self.target.clone(),
            target: self.sender.clone(),
            kind,
            namespace: self.namespace,
            name: self.name,
            body,
        }
    }

    fn error(&self, err: &CoreError) -> Self {
        self.reply(
            MessageKind::Error,
            Body::Error {
                code: err.code(),
                detail: err.to_string(),
            },
        )
    }
}

/// What `handle` hands back for one dispatched request: the terminal reply
/// is either immediate, or (for a suspending composite call) an Accepted
/// message now and a deferred Success/Error later, reachable only through
/// `outbound()`.
pub enum HandleOutcome {
    Immediate(Message),
    Deferred { accepted: Message, scope_id: ScopeId },
}

/// Tracks which `(scope_id, original_call_id)` pairs owe a deferred reply, so
/// a later completion can echo the original Call's message id rather than
/// the Accepted's.
struct PendingCall {
    original_id: MessageId,
    sender: String,
    target: String,
}

pub struct Manager {
    tree: Tree,
    engine: Engine,
    outbound: Vec<Message>,
    pending_calls: std::collections::HashMap<ScopeId, PendingCall>,
}

impl Manager {
    pub fn new(tree: Tree) -> Self {
        Self {
            tree,
            engine: Engine::default(),
            outbound: Vec::new(),
            pending_calls: std::collections::HashMap::new(),
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    /// Convenience passthrough to `Tree::bind_method_callback` — required
    /// before a Method/AsyncMethod is invocable.
    pub fn bind_method_callback(
        &mut self,
        node_ref: &NodeRef,
        callback: crate::tree::MethodCallback,
    ) -> CoreResult<()> {
        self.tree.bind_method_callback(node_ref, callback)
    }

    /// Convenience passthrough to `Tree::bind_variable_hook`.
    pub fn bind_variable_hook(
        &mut self,
        node_ref: &NodeRef,
        hook: crate::hooks::VariableHook,
    ) -> CoreResult<()> {
        self.tree.bind_variable_hook(node_ref, hook)
    }

    /// Drain notification and deferred-completion messages queued since the
    /// last call.
    pub fn outbound(&mut self) -> std::vec::Drain<'_, Message> {
        self.outbound.drain(..)
    }

    /// Dispatch one request to quiescence: all synchronous effects and all
    /// inline scope resumes the request's writes trigger run before this
    /// returns.
    pub fn handle(&mut self, message: Message) -> HandleOutcome {
        let span = crate::request_span!(message.id, format!("{:?}.{:?}", message.namespace, message.name));
        let _enter = span.enter();
        match (&message.namespace, &message.name) {
            (Namespace::Variable, Operation::Read) => self.handle_read(message),
            (Namespace::Variable, Operation::Write) => self.handle_write(message),
            (Namespace::Variable, Operation::Subscribe) => self.handle_subscribe(message),
            (Namespace::Variable, Operation::Unsubscribe) => self.handle_unsubscribe(message),
            (Namespace::Method, Operation::Call) => self.handle_call(message),
            _ => HandleOutcome::Immediate(message.error(&CoreError::MalformedModel(
                "namespace/operation combination not supported".into(),
            ))),
        }
    }

    fn handle_read(&mut self, message: Message) -> HandleOutcome {
        let Body::Read { node_ref } = &message.body else {
            return HandleOutcome::Immediate(message.error(&CoreError::MalformedModel(
                "Read body mismatch".into(),
            )));
        };
        let result = self.tree.resolve(node_ref).and_then(|id| self.tree.read(id));
        match result {
            Ok(value) => HandleOutcome::Immediate(message.reply(
                MessageKind::Success,
                Body::Success {
                    value: Some(value),
                    timestamp: Some(now_ms()),
                    subscription_id: None,
                    returns: None,
                },
            )),
            Err(e) => HandleOutcome::Immediate(message.error(&e)),
        }
    }

    fn handle_write(&mut self, message: Message) -> HandleOutcome {
        let Body::Write { node_ref, value } = &message.body else {
            return HandleOutcome::Immediate(message.error(&CoreError::MalformedModel(
                "Write body mismatch".into(),
            )));
        };
        let id = match self.tree.resolve(node_ref) {
            Ok(id) => id,
            Err(e) => return HandleOutcome::Immediate(message.error(&e)),
        };
        let (outcome, resumed) = match self.engine.write_and_resume(&mut self.tree, id, value.clone()) {
            Ok(v) => v,
            Err(e) => return HandleOutcome::Immediate(message.error(&e)),
        };

        for (node_id, firing) in &outcome.firings {
            self.outbound.push(Message {
                id: MessageId::new(),
                sender: message.target.clone(),
                target: firing.subscriber_id.to_string(),
                kind: MessageKind::Event,
                namespace: Namespace::Variable,
                name: Operation::Read,
                body: Body::Event {
                    node_ref: NodeRef::id(*node_id),
                    value: self.tree.read(*node_id).unwrap_or(Value::Boolean(false)),
                    subscription_id: firing.subscription_id,
                },
            });
        }

        // Resume phase runs strictly after the subscription pass above
        // finishes — active waits are a separate structure from
        // SubscriptionList precisely so this ordering falls out naturally
        // rather than needing interleaving logic inside `notify`. This also
        // picks up any scope that one of the just-resumed scopes' own
        // `Write` steps went on to wake, via `write_and_resume`.
        for (scope_id, step_outcome) in resumed {
            self.complete_scope(scope_id, step_outcome);
        }

        HandleOutcome::Immediate(message.reply(
            MessageKind::Success,
            Body::Success {
                value: None,
                timestamp: None,
                subscription_id: None,
                returns: None,
            },
        ))
    }

    fn handle_subscribe(&mut self, message: Message) -> HandleOutcome {
        let Body::Subscribe {
            node_ref,
            subscriber_id,
            filter,
        } = &message.body
        else {
            return HandleOutcome::Immediate(message.error(&CoreError::MalformedModel(
                "Subscribe body mismatch".into(),
            )));
        };
        let result = self.tree.resolve(node_ref).and_then(|id| {
            self.tree
                .subscribe(id, subscriber_id.clone(), filter.clone())
        });
        match result {
            Ok(subscription_id) => HandleOutcome::Immediate(message.reply(
                MessageKind::Success,
                Body::Success {
                    value: None,
                    timestamp: None,
                    subscription_id: Some(subscription_id),
                    returns: None,
                },
            )),
            Err(e) => HandleOutcome::Immediate(message.error(&e)),
        }
    }

    fn handle_unsubscribe(&mut self, message: Message) -> HandleOutcome {
        let Body::Unsubscribe {
            node_ref,
            subscription_id,
        } = &message.body
        else {
            return HandleOutcome::Immediate(message.error(&CoreError::MalformedModel(
                "Unsubscribe body mismatch".into(),
            )));
        };
        let result = self
            .tree
            .resolve(node_ref)
            .and_then(|id| self.tree.unsubscribe(id, *subscription_id));
        match result {
            Ok(()) => HandleOutcome::Immediate(message.reply(
                MessageKind::Success,
                Body::Success {
                    value: None,
                    timestamp: None,
                    subscription_id: None,
                    returns: None,
                },
            )),
            Err(e) => HandleOutcome::Immediate(message.error(&e)),
        }
    }

    fn handle_call(&mut self, message: Message) -> HandleOutcome {
        let Body::Call {
            node_ref,
            args,
            deadline,
        } = &message.body
        else {
            return HandleOutcome::Immediate(message.error(&CoreError::MalformedModel(
                "Call body mismatch".into(),
            )));
        };
        let method_id = match self.tree.resolve(node_ref) {
            Ok(id) => id,
            Err(e) => return HandleOutcome::Immediate(message.error(&e)),
        };
        let kind_name = match self.tree.get(method_id) {
            Ok(record) => record.kind.name(),
            Err(e) => return HandleOutcome::Immediate(message.error(&e)),
        };

        match kind_name {
            "composite_method" => self.handle_composite_call(message, method_id, args, *deadline),
            "method" | "async_method" => self.handle_direct_call(message, method_id, args),
            other => HandleOutcome::Immediate(message.error(&CoreError::TypeMismatch {
                path: self.tree.path_of(method_id),
                expected: "method",
                got: other,
            })),
        }
    }

    fn handle_direct_call(
        &mut self,
        message: Message,
        method_id: Identifier,
        args: &CallArgs,
    ) -> HandleOutcome {
        let path = self.tree.path_of(method_id);
        let record = match self.tree.get_mut(method_id) {
            Ok(r) => r,
            Err(e) => return HandleOutcome::Immediate(message.error(&e)),
        };
        let (params, callback, hooks) = match &mut record.kind {
            NodeKind::Method(p) | NodeKind::AsyncMethod(p) => {
                (&p.params, &mut p.callback, &mut p.hooks)
            }
            other => {
                return HandleOutcome::Immediate(message.error(&CoreError::TypeMismatch {
                    path,
                    expected: "method",
                    got: other.name(),
                }))
            }
        };
        let arg_values = match resolve_args(args, params) {
            Ok(v) => v,
            Err(e) => return HandleOutcome::Immediate(message.error(&e)),
        };
        let Some(callback) = callback.as_mut() else {
            return HandleOutcome::Immediate(message.error(&CoreError::UnboundCallback(path)));
        };
        if let Err(e) = hooks.fire_pre_invoke(&path, &arg_values) {
            return HandleOutcome::Immediate(message.error(&e));
        }
        let result = match callback(&arg_values) {
            Ok(r) => r,
            Err(e) => return HandleOutcome::Immediate(message.error(&e)),
        };
        if let Err(e) = hooks.fire_post_invoke(&path, &result) {
            return HandleOutcome::Immediate(message.error(&e));
        }
        HandleOutcome::Immediate(message.reply(
            MessageKind::Success,
            Body::Success {
                value: None,
                timestamp: None,
                subscription_id: None,
                returns: Some(result),
            },
        ))
    }

    fn handle_composite_call(
        &mut self,
        message: Message,
        method_id: Identifier,
        args: &CallArgs,
        deadline: Option<Duration>,
    ) -> HandleOutcome {
        let path = self.tree.path_of(method_id);
        let params = match self.tree.get(method_id) {
            Ok(record) => match &record.kind {
                NodeKind::Composite(p) => p.params.clone(),
                other => {
                    return HandleOutcome::Immediate(message.error(&CoreError::TypeMismatch {
                        path,
                        expected: "composite_method",
                        got: other.name(),
                    }))
                }
            },
            Err(e) => return HandleOutcome::Immediate(message.error(&e)),
        };
        let arg_values = match resolve_args(args, &params) {
            Ok(v) => v,
            Err(e) => return HandleOutcome::Immediate(message.error(&e)),
        };
        let mut frame = Frame::new();
        for (param, value) in params.iter().zip(arg_values) {
            frame.insert(param.name.clone(), value);
        }

        let invoked = self.engine.invoke(&mut self.tree, method_id, frame, deadline);
        let (scope_id, outcome, resumed) = match invoked {
            Ok(v) => v,
            Err(e) => return HandleOutcome::Immediate(message.error(&e)),
        };
        for (other_scope, other_outcome) in resumed {
            self.complete_scope(other_scope, other_outcome);
        }

        match outcome {
            StepOutcome::Suspended => {
                self.pending_calls.insert(
                    scope_id,
                    PendingCall {
                        original_id: message.id,
                        sender: message.target.clone(),
                        target: message.sender.clone(),
                    },
                );
                let accepted = message.reply(MessageKind::Accepted, Body::Accepted { scope_id });
                HandleOutcome::Deferred { accepted, scope_id }
            }
            StepOutcome::Completed(returns) => HandleOutcome::Immediate(message.reply(
                MessageKind::Success,
                Body::Success {
                    value: None,
                    timestamp: None,
                    subscription_id: None,
                    returns: Some(returns),
                },
            )),
            StepOutcome::Failed(e) => HandleOutcome::Immediate(message.error(&e)),
        }
    }

    /// Turn a scope's advance-to-quiescence outcome into the deferred
    /// completion message, if this scope has a pending caller waiting on it.
    fn complete_scope(&mut self, scope_id: ScopeId, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Suspended => {
                debug!(%scope_id, "scope re-suspended on a later wait");
            }
            StepOutcome::Completed(returns) => {
                if let Some(pending) = self.pending_calls.remove(&scope_id) {
                    self.outbound.push(Message {
                        id: pending.original_id,
                        sender: pending.sender,
                        target: pending.target,
                        kind: MessageKind::Success,
                        namespace: Namespace::Method,
                        name: Operation::Call,
                        body: Body::Success {
                            value: None,
                            timestamp: None,
                            subscription_id: None,
                            returns: Some(returns),
                        },
                    });
                }
            }
            StepOutcome::Failed(e) => {
                if let Some(pending) = self.pending_calls.remove(&scope_id) {
                    self.outbound.push(Message {
                        id: pending.original_id,
                        sender: pending.sender,
                        target: pending.target,
                        kind: MessageKind::Error,
                        namespace: Namespace::Method,
                        name: Operation::Call,
                        body: Body::Error {
                            code: e.code(),
                            detail: e.to_string(),
                        },
                    });
                }
            }
        }
    }

    /// Explicit cancellation by scope id. A deferred-completion
    /// Error{CANCELLED} is emitted only if a pending caller is still waiting;
    /// cancelling a scope with no pending caller (already completed, or
    /// never registered) is a no-op rather than an error.
    pub fn cancel(&mut self, scope_id: ScopeId) -> CoreResult<()> {
        self.engine.cancel(&mut self.tree, scope_id)?;
        if let Some(pending) = self.pending_calls.remove(&scope_id) {
            let err = CoreError::Cancelled(scope_id);
            self.outbound.push(Message {
                id: pending.original_id,
                sender: pending.sender,
                target: pending.target,
                kind: MessageKind::Error,
                namespace: Namespace::Method,
                name: Operation::Call,
                body: Body::Error {
                    code: err.code(),
                    detail: err.to_string(),
                },
            });
        }
        Ok(())
    }

    /// Remove a node, cascading to its descendants, and emit
    /// DEPENDENCY_LOST deferred completions for every composite scope that
    /// was depending on something removed.
    pub fn remove_node(&mut self, id: Identifier) -> CoreResult<()> {
        let dependents = self.tree.remove(id)?;
        for (_method_id, scope_id) in dependents {
            self.engine.cancel(&mut self.tree, scope_id)?;
            if let Some(pending) = self.pending_calls.remove(&scope_id) {
                let err = CoreError::DependencyLost(scope_id);
                self.outbound.push(Message {
                    id: pending.original_id,
                    sender: pending.sender,
                    target: pending.target,
                    kind: MessageKind::Error,
                    namespace: Namespace::Method,
                    name: Operation::Call,
                    body: Body::Error {
                        code: err.code(),
                        detail: err.to_string(),
                    },
                });
            }
        }
        Ok(())
    }
}

/// Match call args against a method's parameter template, positionally or by
/// name. Missing arguments fall
/// back to the template's default, if any.
fn resolve_args(
    args: &CallArgs,
    params: &[crate::tree::ParamTemplate],
) -> CoreResult<Vec<Value>> {
    let provided: BTreeMap<String, Value> = match args {
        CallArgs::Positional(values) => params
            .iter()
            .zip(values.iter())
            .map(|(p, v)| (p.name.clone(), v.clone()))
            .collect(),
        CallArgs::Named(map) => map.clone(),
    };
    params
        .iter()
        .map(|p| {
            let value = provided
                .get(&p.name)
                .cloned()
                .or_else(|| p.default.clone())
                .ok_or_else(|| {
                    CoreError::TypeMismatch {
                        path: p.name.clone(),
                        expected: p.kind.name(),
                        got: "missing",
                    }
                })?;
            if value.kind() != p.kind {
                return Err(CoreError::TypeMismatch {
                    path: p.name.clone(),
                    expected: p.kind.name(),
                    got: value.kind().name(),
                });
            }
            Ok(value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{NumericPayload, ScalarPayload, Tree};

    fn fixture() -> (Manager, Identifier) {
        let mut tree = Tree::new("root");
        let root = tree.root();
        let b = tree
            .insert(root, "b", "", NodeKind::Boolean(ScalarPayload::new(Value::Boolean(false))))
            .unwrap();
        (Manager::new(tree), b)
    }

    #[test]
    fn simple_write_then_read() {
        let (mut manager, b) = fixture();
        let write = Message::request(
            "client",
            "manager",
            Namespace::Variable,
            Operation::Write,
            Body::Write {
                node_ref: NodeRef::id(b),
                value: Value::Boolean(true),
            },
        );
        let HandleOutcome::Immediate(reply) = manager.handle(write) else {
            panic!("write should be immediate");
        };
        assert_eq!(reply.kind, MessageKind::Success);

        let read = Message::request(
            "client",
            "manager",
            Namespace::Variable,
            Operation::Read,
            Body::Read {
                node_ref: NodeRef::id(b),
            },
        );
        let HandleOutcome::Immediate(reply) = manager.handle(read) else {
            panic!("read should be immediate");
        };
        let Body::Success { value, .. } = reply.body else {
            panic!("expected success body");
        };
        assert_eq!(value, Some(Value::Boolean(true)));
    }

    #[test]
    fn numeric_bounds_reject_out_of_range() {
        let mut tree = Tree::new("root");
        let root = tree.root();
        let mut payload = NumericPayload::new(5.0);
        payload.lower = Some(0.0);
        payload.upper = Some(10.0);
        let n = tree.insert(root, "n", "", NodeKind::Numeric(payload)).unwrap();
        let mut manager = Manager::new(tree);

        let write = Message::request(
            "client",
            "manager",
            Namespace::Variable,
            Operation::Write,
            Body::Write {
                node_ref: NodeRef::id(n),
                value: Value::Numeric(11.0),
            },
        );
        let HandleOutcome::Immediate(reply) = manager.handle(write) else {
            panic!("write should be immediate");
        };
        assert_eq!(reply.kind, MessageKind::Error);
        let Body::Error { code, .. } = reply.body else {
            panic!("expected error body");
        };
        assert_eq!(code, "OUT_OF_RANGE");
    }

    #[test]
    fn outbound_event_serializes_to_json() {
        let (mut manager, b) = fixture();
        manager
            .tree_mut()
            .subscribe(b, "dashboard".into(), Filter::All)
            .unwrap();
        let write = Message::request(
            "client",
            "manager",
            Namespace::Variable,
            Operation::Write,
            Body::Write {
                node_ref: NodeRef::id(b),
                value: Value::Boolean(true),
            },
        );
        manager.handle(write);
        let event = manager.outbound().next().expect("subscriber fires on write");
        let json = serde_json::to_string(&event).expect("Message must serialize");
        assert!(json.contains("\"Event\""));
        assert!(json.contains("dashboard"));
    }
}
