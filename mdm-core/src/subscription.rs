//! Per-variable subscriptions and their filters.
//!
//! `SubscriptionList` owns the subscription records for exactly one variable.
//! It knows nothing about the tree, hierarchical propagation, or composite
//! method waits — those are orchestrated one layer up (`tree.rs` walks to the
//! parent ObjectVariable after calling `notify`; the composite engine keeps
//! its own separate list of active waits per variable, re-checked only after
//! this pass finishes, so the ordering between the two is always the same.

use crate::ids::{SubscriberId, SubscriptionId};
use crate::value::Value;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeMode {
    OnEnter,
    OnExit,
    OnBoth,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    All,
    DataChange { deadband: f64 },
    Range { low: f64, high: f64, mode: RangeMode },
}

impl Filter {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Filter::All => Ok(()),
            Filter::DataChange { deadband } if *deadband < 0.0 => {
                Err(format!("deadband must be >= 0, got {deadband}"))
            }
            Filter::DataChange { .. } => Ok(()),
            Filter::Range { low, high, .. } if low > high => {
                Err(format!("range low ({low}) must be <= high ({high})"))
            }
            Filter::Range { .. } => Ok(()),
        }
    }
}

/// Which side of the half-open boundary `[low, high)` a value sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Zone {
    Below,
    Inside,
    Above,
}

fn zone(value: f64, low: f64, high: f64) -> Zone {
    if value < low {
        Zone::Below
    } else if value < high {
        Zone::Inside
    } else {
        Zone::Above
    }
}

pub struct Subscription {
    pub subscription_id: SubscriptionId,
    pub subscriber_id: SubscriberId,
    pub filter: Filter,
    last_reported: Option<Value>,
    last_zone: Option<Zone>,
}

impl Subscription {
    fn should_fire(&mut self, new_value: &Value) -> bool {
        match &self.filter {
            Filter::All => {
                self.last_reported = Some(new_value.clone());
                true
            }
            Filter::DataChange { deadband } => match (new_value, &self.last_reported) {
                (Value::Numeric(new), Some(Value::Numeric(last))) => {
                    // last_reported only moves when the subscription actually
                    // fires, so the deadband is measured against the last
                    // notified value, not the last value merely seen.
                    let fires = (new - last).abs() > *deadband;
                    if fires {
                        self.last_reported = Some(new_value.clone());
                    }
                    fires
                }
                // Strings/booleans: deadband collapses to "fire on every
                // accepted write" regardless of the configured deadband.
                _ => {
                    let fires = self
                        .last_reported
                        .as_ref()
                        .map(|last| last != new_value)
                        .unwrap_or(true);
                    self.last_reported = Some(new_value.clone());
                    fires
                }
            },
            Filter::Range { low, high, mode } => {
                let Some(n) = new_value.as_numeric() else {
                    return false;
                };
                let new_zone = zone(n, *low, *high);
                let fires = match self.last_zone {
                    None => false,
                    Some(old_zone) => {
                        let entered = old_zone != Zone::Inside && new_zone == Zone::Inside;
                        let exited = old_zone == Zone::Inside && new_zone != Zone::Inside;
                        match mode {
                            RangeMode::OnEnter => entered,
                            RangeMode::OnExit => exited,
                            RangeMode::OnBoth => entered || exited,
                        }
                    }
                };
                self.last_zone = Some(new_zone);
                fires
            }
        }
    }
}

/// A single firing, reported back to the caller of `notify` so it can build
/// the outbound Event message.
pub struct Firing {
    pub subscription_id: SubscriptionId,
    pub subscriber_id: SubscriberId,
}

#[derive(Default)]
pub struct SubscriptionList {
    subs: Vec<Subscription>,
}

impl SubscriptionList {
    pub fn add(
        &mut self,
        subscriber_id: SubscriberId,
        filter: Filter,
        current_value: Option<&Value>,
    ) -> Result<SubscriptionId, String> {
        filter.validate()?;
        let last_zone = match (&filter, current_value) {
            (Filter::Range { low, high, .. }, Some(v)) => {
                v.as_numeric().map(|n| zone(n, *low, *high))
            }
            _ => None,
        };
        let subscription_id = SubscriptionId::new();
        self.subs.push(Subscription {
            subscription_id,
            subscriber_id,
            filter,
            last_reported: current_value.cloned(),
            last_zone,
        });
        Ok(subscription_id)
    }

    /// Remove by explicit handle. A no-op if the handle isn't present.
    pub fn remove_by_handle(&mut self, subscription_id: SubscriptionId) {
        self.subs.retain(|s| s.subscription_id != subscription_id);
    }

    /// Remove every subscription belonging to a subscriber identity.
    pub fn remove_by_subscriber(&mut self, subscriber_id: &SubscriberId) {
        self.subs.retain(|s| &s.subscriber_id != subscriber_id);
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Evaluate every subscription against the new value and return the ones
    /// that fire, in subscription order. A subscription added mid-pass by a
    /// callback side effect is snapshotted out up front, so it only takes
    /// effect on the next write; one removed mid-pass by a prior firing's
    /// side effect is skipped immediately because the lookup happens fresh
    /// per entry rather than against a cloned subscription.
    pub fn notify(&mut self, new_value: &Value) -> Vec<Firing> {
        let order: Vec<SubscriptionId> = self.subs.iter().map(|s| s.subscription_id).collect();
        let mut fired = Vec::new();
        for subscription_id in order {
            let Some(idx) = self
                .subs
                .iter()
                .position(|s| s.subscription_id == subscription_id)
            else {
                continue;
            };
            if self.subs[idx].should_fire(new_value) {
                let sub = &self.subs[idx];
                fired.push(Firing {
                    subscription_id: sub.subscription_id,
                    subscriber_id: sub.subscriber_id.clone(),
                });
            }
        }
        fired
    }
}
