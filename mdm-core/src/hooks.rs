//! Per-variable and per-method callback hooks.
//!
//! Hooks are synchronous, embedder-supplied closures. A panicking hook is
//! treated as an exception from that closure; every hook invocation is
//! wrapped in `catch_unwind` so one faulty closure can't poison the tree — a
//! caught panic becomes `HOOK_FAILED` and the caller rolls back exactly as it
//! would for an explicit veto.

use crate::errors::CoreError;
use crate::value::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};

pub type PreRead = Box<dyn FnMut() + Send>;
pub type PostRead = Box<dyn FnMut(Value) -> Value + Send>;
pub type PreUpdate = Box<dyn FnMut(&Value) -> bool + Send>;
pub type PostUpdate = Box<dyn FnMut(&Value, &Value) -> bool + Send>;

/// The four hook slots a variable may have bound, one per callback phase.
#[derive(Default)]
pub struct VariableHooks {
    pre_read: Option<PreRead>,
    post_read: Option<PostRead>,
    pre_update: Option<PreUpdate>,
    post_update: Option<PostUpdate>,
}

/// Which phase a `bind_variable_hook` call installs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPhase {
    PreRead,
    PostRead,
    PreUpdate,
    PostUpdate,
}

/// The embedder-facing argument to `bind_variable_hook`: carries the
/// phase and the closure together rather than taking them as separate
/// parameters, since each phase's closure has a distinct signature — a single
/// `phase: HookPhase, fn: Box<dyn Any>` pairing would just move the type
/// error from compile time to `bind_variable_hook`'s first call.
pub enum VariableHook {
    PreRead(PreRead),
    PostRead(PostRead),
    PreUpdate(PreUpdate),
    PostUpdate(PostUpdate),
}

impl VariableHook {
    pub fn phase(&self) -> HookPhase {
        match self {
            VariableHook::PreRead(_) => HookPhase::PreRead,
            VariableHook::PostRead(_) => HookPhase::PostRead,
            VariableHook::PreUpdate(_) => HookPhase::PreUpdate,
            VariableHook::PostUpdate(_) => HookPhase::PostUpdate,
        }
    }
}

impl VariableHooks {
    pub fn bind_pre_read(&mut self, f: PreRead) {
        self.pre_read = Some(f);
    }

    pub fn bind_post_read(&mut self, f: PostRead) {
        self.post_read = Some(f);
    }

    pub fn bind_pre_update(&mut self, f: PreUpdate) {
        self.pre_update = Some(f);
    }

    pub fn bind_post_update(&mut self, f: PostUpdate) {
        self.post_update = Some(f);
    }

    pub fn bind(&mut self, hook: VariableHook) {
        match hook {
            VariableHook::PreRead(f) => self.bind_pre_read(f),
            VariableHook::PostRead(f) => self.bind_post_read(f),
            VariableHook::PreUpdate(f) => self.bind_pre_update(f),
            VariableHook::PostUpdate(f) => self.bind_post_update(f),
        }
    }

    pub fn fire_pre_read(&mut self, path: &str) -> Result<(), CoreError> {
        let Some(hook) = self.pre_read.as_mut() else {
            return Ok(());
        };
        catch_unwind(AssertUnwindSafe(|| hook()))
            .map_err(|_| CoreError::HookFailed(path.to_string(), "pre_read panicked".into()))
    }

    /// Returns the (possibly transformed) value the caller observes.
    pub fn fire_post_read(&mut self, path: &str, sampled: Value) -> Result<Value, CoreError> {
        let Some(hook) = self.post_read.as_mut() else {
            return Ok(sampled);
        };
        catch_unwind(AssertUnwindSafe(|| hook(sampled)))
            .map_err(|_| CoreError::HookFailed(path.to_string(), "post_read panicked".into()))
    }

    /// Returns `false` to veto the write.
    pub fn fire_pre_update(&mut self, path: &str, proposed: &Value) -> Result<bool, CoreError> {
        let Some(hook) = self.pre_update.as_mut() else {
            return Ok(true);
        };
        catch_unwind(AssertUnwindSafe(|| hook(proposed)))
            .map_err(|_| CoreError::HookFailed(path.to_string(), "pre_update panicked".into()))
    }

    /// Returns `false` to revert the just-applied write.
    pub fn fire_post_update(
        &mut self,
        path: &str,
        previous: &Value,
        new: &Value,
    ) -> Result<bool, CoreError> {
        let Some(hook) = self.post_update.as_mut() else {
            return Ok(true);
        };
        catch_unwind(AssertUnwindSafe(|| hook(previous, new)))
            .map_err(|_| CoreError::HookFailed(path.to_string(), "post_update panicked".into()))
    }
}

pub type PreInvoke = Box<dyn FnMut(&[Value]) + Send>;
pub type PostInvoke = Box<dyn FnMut(&[Value]) + Send>;

#[derive(Default)]
pub struct MethodHooks {
    pre_invoke: Option<PreInvoke>,
    post_invoke: Option<PostInvoke>,
}

impl MethodHooks {
    pub fn bind_pre_invoke(&mut self, f: PreInvoke) {
        self.pre_invoke = Some(f);
    }

    pub fn bind_post_invoke(&mut self, f: PostInvoke) {
        self.post_invoke = Some(f);
    }

    pub fn fire_pre_invoke(&mut self, path: &str, args: &[Value]) -> Result<(), CoreError> {
        let Some(hook) = self.pre_invoke.as_mut() else {
            return Ok(());
        };
        catch_unwind(AssertUnwindSafe(|| hook(args)))
            .map_err(|_| CoreError::HookFailed(path.to_string(), "pre_invoke panicked".into()))
    }

    pub fn fire_post_invoke(&mut self, path: &str, result: &[Value]) -> Result<(), CoreError> {
        let Some(hook) = self.post_invoke.as_mut() else {
            return Ok(());
        };
        catch_unwind(AssertUnwindSafe(|| hook(result)))
            .map_err(|_| CoreError::HookFailed(path.to_string(), "post_invoke panicked".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_update_veto() {
        let mut hooks = VariableHooks::default();
        hooks.bind_pre_update(Box::new(|v: &Value| !matches!(v, Value::Numeric(n) if *n > 100.0)));
        assert!(hooks.fire_pre_update("p", &Value::Numeric(5.0)).unwrap());
        assert!(!hooks.fire_pre_update("p", &Value::Numeric(200.0)).unwrap());
    }

    #[test]
    fn post_read_transforms() {
        let mut hooks = VariableHooks::default();
        hooks.bind_post_read(Box::new(|v: Value| match v {
            Value::Numeric(n) => Value::Numeric(n * 2.0),
            other => other,
        }));
        let out = hooks.fire_post_read("p", Value::Numeric(3.0)).unwrap();
        assert_eq!(out, Value::Numeric(6.0));
    }

    #[test]
    fn panicking_hook_becomes_hook_failed() {
        let mut hooks = VariableHooks::default();
        hooks.bind_pre_update(Box::new(|_: &Value| panic!("boom")));
        let err = hooks.fire_pre_update("p", &Value::Boolean(true)).unwrap_err();
        assert_eq!(err.code(), "HOOK_FAILED");
    }
}
