use rand::Rng;
use tracing::warn;

use super::{Discipline, HatchlingTasks};
use crate::error::SwarmResult;

/// Runs one hatchling's full lifecycle: setup (fail-fast), then the three
/// disciplines concurrently, then shutdown (fail-fast). Errors inside one
/// discipline are logged and do not abort the others, matching the
/// "exceptions inside one discipline are logged, do not abort the others"
/// rule; setup/shutdown failures propagate directly.
pub async fn run_lifecycle(tasks: &HatchlingTasks) -> SwarmResult<()> {
    if let Some(setup) = &tasks.setup {
        setup().await?;
    }

    let ordered = run_ordered(tasks);
    let parallel = run_parallel(tasks);
    let random = run_random(tasks);
    let _ = tokio::join!(ordered, parallel, random);

    if let Some(shutdown) = &tasks.shutdown {
        shutdown().await?;
    }

    Ok(())
}

/// An error inside the ordered discipline stops the rest of *its* work —
/// remaining iterations and remaining ordered tasks never run — while
/// leaving `run_parallel`/`run_random` to keep going independently.
async fn run_ordered(tasks: &HatchlingTasks) {
    for (spec, task) in &tasks.ordered {
        let count = match spec.discipline {
            Discipline::Ordered { count, .. } => count,
            _ => continue,
        };
        for _ in 0..count {
            if let Err(err) = task().await {
                warn!(task = %spec.name, error = %err, "ordered task failed");
                return;
            }
        }
    }
}

async fn run_parallel(tasks: &HatchlingTasks) {
    let mut handles = Vec::new();
    for (spec, task) in &tasks.parallel {
        let count = match spec.discipline {
            Discipline::Parallel { count } => count,
            _ => continue,
        };
        for _ in 0..count {
            handles.push(async {
                if let Err(err) = task().await {
                    warn!(task = %spec.name, error = %err, "parallel task failed");
                }
            });
        }
    }
    futures::future::join_all(handles).await;
}

async fn run_random(tasks: &HatchlingTasks) {
    if tasks.random.is_empty() {
        return;
    }
    let weights: Vec<u64> = tasks
        .random
        .iter()
        .map(|(spec, _)| match spec.discipline {
            Discipline::Random { weight } => weight,
            _ => 0,
        })
        .collect();
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return;
    }

    loop {
        let draw = rand::thread_rng().gen_range(0..total);
        let index = pick_weighted_index(&weights, draw);
        let (spec, task) = &tasks.random[index];
        match task().await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(err) => {
                warn!(task = %spec.name, error = %err, "random discipline task failed");
                break;
            }
        }
    }
}

/// Picks the task whose cumulative-weight bucket contains `draw`. Buckets
/// are inclusive on their upper edge: task `i` owns the integers in
/// `(sum(weights[..i]), sum(weights[..=i])]`, so the very first bucket also
/// covers `draw == 0`.
pub(crate) fn pick_weighted_index(weights: &[u64], draw: u64) -> usize {
    let mut running = 0u64;
    for (i, w) in weights.iter().enumerate() {
        running += w;
        if draw <= running {
            return i;
        }
    }
    weights.len() - 1
}
