//! In-process typed node tree, composite method engine, and protocol
//! manager for industrial address-space gateways (OPC UA / ISA-95 style).
//!
//! This crate has no network I/O, no persistence, and no authorization of
//! its own — it is embedded inside a gateway or simulator process that owns
//! those concerns. See `protocol::Manager` for the entry point most
//! embedders want: build a `Tree` with `builder::FolderBuilder`, wrap it in
//! a `Manager`, then `handle()` requests and drain `outbound()`.

pub mod addressing;
pub mod builder;
pub mod composite;
pub mod errors;
pub mod hooks;
pub mod ids;
pub mod protocol;
pub mod steps;
pub mod subscription;
pub mod trace;
pub mod tree;
pub mod value;

pub use addressing::NodeRef;
pub use builder::{load_tree, FolderBuilder};
pub use composite::{Engine, StepOutcome};
pub use errors::{CoreError, CoreResult};
pub use hooks::{HookPhase, VariableHook};
pub use ids::{Identifier, ScopeId, SubscriberId, SubscriptionId};
pub use protocol::{Body, CallArgs, HandleOutcome, Manager, Message, MessageKind, Namespace, Operation};
pub use steps::{CompareOp, Expr, Frame, Step};
pub use subscription::{Filter, RangeMode};
pub use tree::{MethodCallback, NodeKind, ParamTemplate, Tree};
pub use value::{Unit, Value, ValueKind};
