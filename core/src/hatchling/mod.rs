//! The per-virtual-user task scheduler: a hatchling multiplexes an
//! ordered, a parallel, and a weighted-random task discipline over one
//! cooperative lifecycle (setup → disciplines → shutdown).

mod connection;
mod registry;
mod scheduler;

pub use connection::{build_shared_client, Connection, RequestOptions, RequestOutcome, SharedRuntime};
pub use registry::{HatcheryRegistry, HatchlingFactory};
pub use scheduler::run_lifecycle;

use std::future::Future;
use std::pin::Pin;

use crate::error::SwarmResult;

/// A task's own future, boxed so disciplines of different shapes can be
/// stored side by side. `!Send` because a Colony pins its whole hatchling
/// population to one OS thread (see the colony module).
pub type LocalFuture<T> = Pin<Box<dyn Future<Output = T>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub usize);

/// How a registered task function is scheduled. Attached once at
/// construction time rather than by a method decorator, per the
/// registration-side-table approach.
#[derive(Debug, Clone)]
pub enum Discipline {
    Ordered { index: i64, count: u64 },
    Parallel { count: u64 },
    Random { weight: u64 },
}

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub discipline: Discipline,
}

type SetupFn = Box<dyn Fn() -> LocalFuture<SwarmResult<()>>>;
type OrderedFn = Box<dyn Fn() -> LocalFuture<SwarmResult<()>>>;
type ParallelFn = Box<dyn Fn() -> LocalFuture<SwarmResult<()>>>;
/// A random-discipline task reports whether it wants another turn: the
/// scheduler stops drawing once one of these returns `Ok(false)`, and an
/// `Err` terminates the loop without affecting sibling disciplines.
type RandomFn = Box<dyn Fn() -> LocalFuture<SwarmResult<bool>>>;

/// The four task lists a scheduler consumes, plus optional setup/shutdown
/// hooks. Built once via [`HatchlingTasksBuilder`] and owned by the
/// hatchling instance for the rest of its lifetime.
pub struct HatchlingTasks {
    setup: Option<SetupFn>,
    shutdown: Option<SetupFn>,
    ordered: Vec<(TaskSpec, OrderedFn)>,
    parallel: Vec<(TaskSpec, ParallelFn)>,
    random: Vec<(TaskSpec, RandomFn)>,
}

#[derive(Default)]
pub struct HatchlingTasksBuilder {
    setup: Option<SetupFn>,
    shutdown: Option<SetupFn>,
    ordered: Vec<(TaskSpec, OrderedFn)>,
    parallel: Vec<(TaskSpec, ParallelFn)>,
    random: Vec<(TaskSpec, RandomFn)>,
}

impl HatchlingTasksBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = SwarmResult<()>> + 'static,
    {
        self.setup = Some(Box::new(move || Box::pin(f())));
        self
    }

    pub fn shutdown<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = SwarmResult<()>> + 'static,
    {
        self.shutdown = Some(Box::new(move || Box::pin(f())));
        self
    }

    pub fn ordered<F, Fut>(mut self, name: impl Into<String>, index: i64, count: u64, f: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = SwarmResult<()>> + 'static,
    {
        let spec = TaskSpec { name: name.into(), discipline: Discipline::Ordered { index, count } };
        self.ordered.push((spec, Box::new(move || Box::pin(f()))));
        self
    }

    pub fn parallel<F, Fut>(mut self, name: impl Into<String>, count: u64, f: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = SwarmResult<()>> + 'static,
    {
        let spec = TaskSpec { name: name.into(), discipline: Discipline::Parallel { count } };
        self.parallel.push((spec, Box::new(move || Box::pin(f()))));
        self
    }

    pub fn random<F, Fut>(mut self, name: impl Into<String>, weight: u64, f: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = SwarmResult<bool>> + 'static,
    {
        let spec = TaskSpec { name: name.into(), discipline: Discipline::Random { weight } };
        self.random.push((spec, Box::new(move || Box::pin(f()))));
        self
    }

    /// Sorts the ordered list ascending by index; ties keep source order
    /// because `sort_by_key` is stable.
    pub fn build(mut self) -> HatchlingTasks {
        self.ordered.sort_by_key(|(spec, _)| match spec.discipline {
            Discipline::Ordered { index, .. } => index,
            _ => 0,
        });
        HatchlingTasks {
            setup: self.setup,
            shutdown: self.shutdown,
            ordered: self.ordered,
            parallel: self.parallel,
            random: self.random,
        }
    }
}

/// One simulated client. Implementations construct their own
/// [`HatchlingTasks`] during `new`, typically closing over a shared
/// [`Connection`] for HTTP access and the bus-provided config map.
pub trait Hatchling {
    fn tasks(&self) -> &HatchlingTasks;
}
