//! Planning and execution engine.
//!
//! This module turns a requested target into work and carries that work out.
//! It is split into two focused submodules under `src/engine/`:
//!
//! - `planner.rs`: recursively expands a requested target into a memoised DAG
//!   of jobs, resolving which rule produces each input along the way.
//! - `scheduler.rs`: runs the DAG, dispatching ready jobs to a worker pool
//!   while respecting dependency order.
//!
//! ## How the parts work together
//!
//! ```text
//! rules (registry) ──┐
//!                    │  Planner::plan          (planner.rs)
//! requested target ──┼─ producer search + memoised recursion
//!                    │
//!                    v
//!              Plan { jobs, root }
//!                    │
//!                    v
//!              execute              (scheduler.rs)
//!                - pending-dependency counters
//!                - worker pool dispatch
//!                - failure cleanup + output verification
//! ```
//!
//! Planning is single-threaded and purely read-only with respect to the rule
//! registry; only the executor touches the filesystem through the rules'
//! action callbacks.

#[path = "engine/planner.rs"]
mod planner;
#[path = "engine/scheduler.rs"]
mod scheduler;

pub(crate) use planner::Planner;
pub(crate) use scheduler::execute;
