//! Composite method invocation: a suspendable interpreter over the
//! `Step` graph, one `Scope` per in-flight invocation.
//!
//! This plays the role the control-flow engine's VM/Fiber pair plays there —
//! a program counter plus a frame of local bindings, advanced one step at a
//! time and parked on a `WaitState` rather than blocking a thread. The
//! difference is deliberate: that engine's fibers are driven by an external
//! scheduler tick across many concurrent process instances; a composite
//! method scope is a single-threaded, reentrant-call model instead — it's
//! driven synchronously, either by the call that started it or by the write
//! that satisfies the wait it's parked on, never by a scheduler tick.

use crate::addressing::NodeRef;
use crate::errors::{CoreError, CoreResult};
use crate::ids::{Identifier, ScopeId};
use crate::steps::{Expr, Frame, Step};
use crate::tree::{ActiveWait, NodeKind, Tree};
use crate::value::Value;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Why a scope isn't currently runnable.
pub enum ParkReason {
    /// Parked on a `Wait` step; resumed by `Engine::notify_write`.
    Waiting { variable: Identifier },
}

/// One in-flight composite method invocation.
pub struct Scope {
    pub scope_id: ScopeId,
    pub method_id: Identifier,
    frame: Frame,
    pc: usize,
    park: Option<ParkReason>,
    started_at: Instant,
    deadline: Option<Duration>,
}

/// Outcome of advancing a scope as far as it can go in one call.
pub enum StepOutcome {
    /// Still running, parked on a wait.
    Suspended,
    /// Graph ran off the end (or hit an explicit return binding); holds the
    /// method's declared return values pulled from the final frame.
    Completed(Vec<Value>),
    /// A step (or return-template collection, or post_invoke) failed. The
    /// scope has already been torn down by the time this is returned — this
    /// is distinct from this module's `CoreResult::Err`, which is reserved
    /// for invariant violations (`CoreError::Corrupted`) rather than ordinary
    /// operational failures a single scope can hit. Per §7, a scope failure
    /// during resume must surface as that scope's own deferred completion,
    /// not abort the write that triggered the resume or any sibling scope
    /// the same write also woke.
    Failed(CoreError),
}

#[derive(Default)]
pub struct Engine {
    scopes: HashMap<ScopeId, Scope>,
}

impl Engine {
    /// Start a new invocation of the composite method at `method_id` with the
    /// given initial arguments bound into the frame under their parameter
    /// names, then run it until it parks or completes.
    pub fn invoke(
        &mut self,
        tree: &mut Tree,
        method_id: Identifier,
        args: Frame,
        deadline: Option<Duration>,
    ) -> CoreResult<(ScopeId, StepOutcome, Vec<(ScopeId, StepOutcome)>)> {
        let path = tree.path_of(method_id);
        let scope_id = ScopeId::new();
        {
            let record = tree.get_mut(method_id)?;
            let NodeKind::Composite(payload) = &mut record.kind else {
                return Err(CoreError::TypeMismatch {
                    path,
                    expected: "composite_method",
                    got: record.kind.name(),
                });
            };
            // pre_invoke sees the arguments in declared-parameter order,
            // same as the return-template lookup `collect_returns` does for
            // the other end of the call.
            let arg_values: Vec<Value> = payload
                .params
                .iter()
                .map(|p| args.get(&p.name).cloned().unwrap_or(Value::Boolean(false)))
                .collect();
            payload.hooks.fire_pre_invoke(&path, &arg_values)?;
            payload.active_scopes.insert(scope_id);
        }
        let scope = Scope {
            scope_id,
            method_id,
            frame: args,
            pc: 0,
            park: None,
            started_at: Instant::now(),
            deadline,
        };
        self.scopes.insert(scope_id, scope);
        let (outcome, resumed) = self.run(tree, scope_id)?;
        Ok((scope_id, outcome, resumed))
    }

    /// Resume every scope parked on `variable`, in response to the write that
    /// just satisfied their wait condition. Called by the protocol manager
    /// strictly after the written variable's own subscription notification
    /// pass completes — `drain_satisfied_waits` is how the caller
    /// decides which scopes are eligible before calling this. Flattens in
    /// any further scopes that a resumed scope's own steps went on to wake,
    /// so one originating write can be seen to resume an arbitrarily deep
    /// chain of waiters without the caller having to loop.
    pub fn resume_waiters(
        &mut self,
        tree: &mut Tree,
        satisfied: Vec<ActiveWait>,
    ) -> CoreResult<Vec<(ScopeId, StepOutcome)>> {
        let mut outcomes = Vec::new();
        for wait in satisfied {
            if !self.scopes.contains_key(&wait.scope_id) {
                continue;
            }
            let (outcome, extra) = self.run(tree, wait.scope_id)?;
            outcomes.push((wait.scope_id, outcome));
            outcomes.extend(extra);
        }
        Ok(outcomes)
    }

    /// Write a variable and carry out the same resume phase a protocol
    /// dispatch would: on any accepted write, every scope waiting on that
    /// variable re-evaluates its predicate. Used both by
    /// the protocol manager for externally dispatched writes and by a
    /// `Write` step so a composite method's own writes wake *other* parked
    /// scopes too, not just variables touched from outside. The writing
    /// scope itself is never in `satisfied` here since a running scope is
    /// never parked, so this can't make a scope advance twice for its own
    /// write — only `Advance::Park` registers a wait, and that only happens
    /// after this call returns.
    pub fn write_and_resume(
        &mut self,
        tree: &mut Tree,
        id: Identifier,
        value: Value,
    ) -> CoreResult<(crate::tree::WriteOutcome, Vec<(ScopeId, StepOutcome)>)> {
        let outcome = tree.write(id, value)?;
        let mut resumed = Vec::new();
        for written_id in &outcome.written {
            let satisfied = tree.drain_satisfied_waits(*written_id)?;
            if satisfied.is_empty() {
                continue;
            }
            resumed.extend(self.resume_waiters(tree, satisfied)?);
        }
        Ok((outcome, resumed))
    }

    pub fn cancel(&mut self, tree: &mut Tree, scope_id: ScopeId) -> CoreResult<()> {
        if let Some(scope) = self.scopes.remove(&scope_id) {
            if let Ok(record) = tree.get_mut(scope.method_id) {
                if let NodeKind::Composite(payload) = &mut record.kind {
                    payload.active_scopes.remove(&scope_id);
                }
            }
        }
        Ok(())
    }

    /// Drive a scope forward from its current program counter until it parks
    /// on a wait, completes, or its deadline has elapsed. Alongside this
    /// scope's own outcome, returns any other scopes that this scope's
    /// `Write` steps happened to resume along the way.
    ///
    /// `written_this_run` is the at-most-one-advance rule's enforcement: the
    /// set of variables this scope itself has written during this single
    /// call to `run`. A `Wait` step targeting one of them is forced to park
    /// even if its predicate already holds — otherwise `[Write(x,1),
    /// Wait(x==1)]` would run straight through the write it just performed
    /// instead of waiting for a *later*, externally-originated write to `x`,
    /// which is what "a scope advances at most once per originating write"
    /// requires. The set is fresh per call to `run`, not per scope: the next
    /// time this scope is re-entered (woken by a subsequent write), it starts
    /// empty again.
    fn run(&mut self, tree: &mut Tree, scope_id: ScopeId) -> CoreResult<(StepOutcome, Vec<(ScopeId, StepOutcome)>)> {
        let method_path = tree.path_of(self.scope(scope_id)?.method_id);
        let span = crate::scope_span!(scope_id, method_path);
        let _enter = span.enter();
        let mut resumed = Vec::new();
        let mut written_this_run: HashSet<Identifier> = HashSet::new();
        loop {
            let deadline_hit = {
                let scope = self.scope(scope_id)?;
                scope
                    .deadline
                    .map(|d| scope.started_at.elapsed() >= d)
                    .unwrap_or(false)
            };
            if deadline_hit {
                self.finish(tree, scope_id)?;
                return Ok((StepOutcome::Failed(CoreError::Cancelled(scope_id)), resumed));
            }

            let method_id = self.scope(scope_id)?.method_id;
            let pc = self.scope(scope_id)?.pc;
            let graph_len = {
                let record = tree.get(method_id)?;
                let NodeKind::Composite(payload) = &record.kind else {
                    return Err(CoreError::Corrupted(format!(
                        "scope {scope_id} method {method_id} is no longer composite"
                    )));
                };
                payload.graph.len()
            };
            if pc >= graph_len {
                let returns = match self.collect_returns(tree, method_id, scope_id) {
                    Ok(r) => r,
                    Err(e) => {
                        self.finish(tree, scope_id)?;
                        return Ok((StepOutcome::Failed(e), resumed));
                    }
                };
                let path = tree.path_of(method_id);
                let hook_result = {
                    let record = tree.get_mut(method_id)?;
                    let NodeKind::Composite(payload) = &mut record.kind else {
                        return Err(CoreError::Corrupted(format!(
                            "scope {scope_id} method {method_id} is no longer composite"
                        )));
                    };
                    payload.hooks.fire_post_invoke(&path, &returns)
                };
                self.finish(tree, scope_id)?;
                return match hook_result {
                    Ok(()) => Ok((StepOutcome::Completed(returns), resumed)),
                    Err(e) => Ok((StepOutcome::Failed(e), resumed)),
                };
            }

            let step = {
                let record = tree.get(method_id)?;
                let NodeKind::Composite(payload) = &record.kind else {
                    unreachable!("checked above");
                };
                payload.graph[pc].clone()
            };

            match self.execute_step(tree, scope_id, &step, &mut resumed, &mut written_this_run) {
                Ok(Advance::Next(next_pc)) => {
                    self.scope_mut(scope_id)?.pc = next_pc;
                }
                Ok(Advance::Park { variable, op, rhs }) => {
                    let scope = self.scope_mut(scope_id)?;
                    scope.park = Some(ParkReason::Waiting { variable });
                    let wait = ActiveWait {
                        method_id,
                        scope_id,
                        op,
                        rhs,
                    };
                    tree.add_active_wait(variable, wait)?;
                    return Ok((StepOutcome::Suspended, resumed));
                }
                Err(e) => {
                    self.finish(tree, scope_id)?;
                    return Ok((StepOutcome::Failed(e), resumed));
                }
            }
        }
    }

    /// Map the scope's frame onto the method's declared return template
    ///,
    /// in template order. A return slot with no matching `store_as`/param
    /// binding and no default is a malformed graph, not a runtime condition.
    fn collect_returns(
        &self,
        tree: &Tree,
        method_id: Identifier,
        scope_id: ScopeId,
    ) -> CoreResult<Vec<Value>> {
        let record = tree.get(method_id)?;
        let NodeKind::Composite(payload) = &record.kind else {
            return Err(CoreError::Corrupted(format!(
                "scope {scope_id} method {method_id} is no longer composite"
            )));
        };
        let frame = &self.scope(scope_id)?.frame;
        payload
            .returns
            .iter()
            .map(|r| {
                frame
                    .get(&r.name)
                    .cloned()
                    .or_else(|| r.default.clone())
                    .ok_or_else(|| {
                        CoreError::MalformedModel(format!(
                            "composite method {} has no binding for return slot {:?}",
                            tree.path_of(method_id),
                            r.name
                        ))
                    })
            })
            .collect()
    }

    fn finish(&mut self, tree: &mut Tree, scope_id: ScopeId) -> CoreResult<()> {
        if let Some(scope) = self.scopes.remove(&scope_id) {
            if let Ok(record) = tree.get_mut(scope.method_id) {
                if let NodeKind::Composite(payload) = &mut record.kind {
                    payload.active_scopes.remove(&scope_id);
                }
            }
        }
        Ok(())
    }

    fn scope(&self, scope_id: ScopeId) -> CoreResult<&Scope> {
        self.scopes
            .get(&scope_id)
            .ok_or_else(|| CoreError::Corrupted(format!("unknown scope {scope_id}")))
    }

    fn scope_mut(&mut self, scope_id: ScopeId) -> CoreResult<&mut Scope> {
        self.scopes
            .get_mut(&scope_id)
            .ok_or_else(|| CoreError::Corrupted(format!("unknown scope {scope_id}")))
    }

    fn execute_step(
        &mut self,
        tree: &mut Tree,
        scope_id: ScopeId,
        step: &Step,
        resumed: &mut Vec<(ScopeId, StepOutcome)>,
        written_this_run: &mut HashSet<Identifier>,
    ) -> CoreResult<Advance> {
        let pc = self.scope(scope_id)?.pc;
        match step {
            Step::Write { target, value } => {
                let resolved = self.eval(scope_id, value)?;
                let var_id = tree.resolve(target)?;
                let (_, extra) = self.write_and_resume(tree, var_id, resolved)?;
                resumed.extend(extra);
                written_this_run.insert(var_id);
                Ok(Advance::Next(pc + 1))
            }
            Step::Read { source, store_as } => {
                let var_id = tree.resolve(source)?;
                let value = tree.read(var_id)?;
                self.scope_mut(scope_id)?.frame.insert(store_as.clone(), value);
                Ok(Advance::Next(pc + 1))
            }
            Step::Wait { source, op, rhs } => {
                let var_id = tree.resolve(source)?;
                let current = tree.read(var_id)?;
                let resolved_rhs = self.eval(scope_id, rhs)?;
                // A wait on a variable this scope itself just wrote must still
                // park: the at-most-one-advance rule defers its wakeup to the
                // next, externally-originated write to that variable.
                if op.evaluate(&current, &resolved_rhs) && !written_this_run.contains(&var_id) {
                    Ok(Advance::Next(pc + 1))
                } else {
                    Ok(Advance::Park {
                        variable: var_id,
                        op: *op,
                        rhs: resolved_rhs,
                    })
                }
            }
            Step::CallAsync {
                method,
                args,
                store_returns_as,
            } => {
                let method_id = tree.resolve(method)?;
                let arg_values: Vec<Value> = args
                    .iter()
                    .map(|e| self.eval(scope_id, e))
                    .collect::<CoreResult<_>>()?;
                let path = tree.path_of(method_id);
                let record = tree.get_mut(method_id)?;
                let NodeKind::AsyncMethod(payload) = &mut record.kind else {
                    return Err(CoreError::TypeMismatch {
                        path,
                        expected: "async_method",
                        got: record.kind.name(),
                    });
                };
                let callback = payload
                    .callback
                    .as_mut()
                    .ok_or_else(|| CoreError::UnboundCallback(path.clone()))?;
                payload.hooks.fire_pre_invoke(&path, &arg_values)?;
                let results = callback(&arg_values)?;
                payload.hooks.fire_post_invoke(&path, &results)?;
                if let Some(name) = store_returns_as {
                    let value = results.into_iter().next().unwrap_or(Value::Boolean(false));
                    self.scope_mut(scope_id)?.frame.insert(name.clone(), value);
                }
                Ok(Advance::Next(pc + 1))
            }
            Step::Branch {
                predicate,
                if_true,
                if_false,
            } => {
                let value = self.eval(scope_id, predicate)?;
                Ok(Advance::Next(if value.is_truthy() { *if_true } else { *if_false }))
            }
        }
    }

    fn eval(&self, scope_id: ScopeId, expr: &Expr) -> CoreResult<Value> {
        let scope = self.scope(scope_id)?;
        expr.eval(&scope.frame)
            .cloned()
            .ok_or_else(|| CoreError::MalformedModel(format!("unbound frame reference in {expr:?}")))
    }
}

enum Advance {
    Next(usize),
    Park {
        variable: Identifier,
        op: crate::steps::CompareOp,
        rhs: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{CompositePayload, NumericPayload, Tree};
    use crate::value::Value;

    #[test]
    fn invoke_parks_on_wait_then_resumes() {
        let mut tree = Tree::new("root");
        let root = tree.root();
        let temp = tree
            .insert(root, "temp", "", NodeKind::Numeric(NumericPayload::new(0.0)))
            .unwrap();
        let graph = vec![Step::Wait {
            source: NodeRef::id(temp),
            op: crate::steps::CompareOp::Ge,
            rhs: Expr::literal(Value::Numeric(100.0)),
        }];
        let method_id = tree
            .insert(
                root,
                "heat_to_target",
                "",
                NodeKind::Composite(CompositePayload::new(Vec::new(), Vec::new(), graph)),
            )
            .unwrap();
        let mut engine = Engine::default();
        let (scope_id, outcome, extra) = engine.invoke(&mut tree, method_id, Frame::new(), None).unwrap();
        assert!(matches!(outcome, StepOutcome::Suspended));
        assert!(extra.is_empty());

        tree.write(temp, Value::Numeric(150.0)).unwrap();
        let satisfied = tree.drain_satisfied_waits(temp).unwrap();
        assert_eq!(satisfied.len(), 1);
        let resumed = engine.resume_waiters(&mut tree, satisfied).unwrap();
        assert_eq!(resumed.len(), 1);
        assert!(matches!(resumed[0].1, StepOutcome::Completed(_)));
        let _ = scope_id;
    }
}
