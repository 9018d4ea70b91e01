use std::collections::HashMap;

use super::{Hatchling, SharedRuntime};
use crate::error::{SwarmError, SwarmResult};

/// Builds one hatchling instance from its bus-delivered config and the
/// runtime state it shares with every other hatchling in the Colony. Rust
/// has no portable, safe equivalent of loading an arbitrary user module by
/// file path at runtime, so a hatchery resolves by name against factories
/// registered at process start instead of by dynamically importing
/// `--hatchery_file`.
pub type HatchlingFactory =
    Box<dyn Fn(HashMap<String, String>, SharedRuntime) -> Box<dyn Hatchling>>;

/// Maps a hatchery name (the value passed via `--hatchery_file`) to the
/// factory that builds its hatchling. A binary registers its concrete
/// hatchling types once in `main`, then hands the registry to the Colony.
#[derive(Default)]
pub struct HatcheryRegistry {
    factories: HashMap<String, HatchlingFactory>,
}

impl HatcheryRegistry {
    pub fn new() -> Self {
        HatcheryRegistry { factories: HashMap::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: HatchlingFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn build(
        &self,
        name: &str,
        config: HashMap<String, String>,
        runtime: SharedRuntime,
    ) -> SwarmResult<Box<dyn Hatchling>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SwarmError::Other(anyhow::anyhow!("no hatchery registered under '{name}'")))?;
        Ok(factory(config, runtime))
    }
}
