use std::collections::HashMap;
use std::sync::Arc;

use crate::Step;

/// Step name → implementation.
///
/// Built once at startup, then shared read-only (usually behind an `Arc`).
#[derive(Default, Clone)]
pub struct StepRegistry {
  steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `step` under `name`.
  ///
  /// # Panics
  ///
  /// Panics if `name` is already registered. Duplicate registration is a
  /// wiring bug and must surface at startup.
  pub fn register(&mut self, name: impl Into<String>, step: Arc<dyn Step>) {
    let name = name.into();
    if self.steps.contains_key(&name) {
      panic!("step '{name}' registered twice");
    }
    self.steps.insert(name, step);
  }

  /// Register `step` under its own name.
  pub fn register_step(&mut self, step: impl Step + 'static) {
    let step: Arc<dyn Step> = Arc::new(step);
    self.register(step.name().to_string(), step);
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn Step>> {
    self.steps.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.steps.contains_key(name)
  }

  /// Registered names, sorted.
  pub fn names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }
}

impl std::fmt::Debug for StepRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StepRegistry")
      .field("steps", &self.names())
      .finish()
  }
}
