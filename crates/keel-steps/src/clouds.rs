use std::collections::HashMap;
use std::sync::Arc;

use keel_config::Provider;
use keel_step::{PollPolicy, StepError};

use crate::SimulatedCloud;
use crate::api::{AwsApi, ComputeApi};

/// The SDK clients steps are bound to at registration.
#[derive(Clone)]
pub struct Clouds {
  pub aws: Arc<dyn AwsApi>,
  compute: HashMap<Provider, Arc<dyn ComputeApi>>,
  pub poll: PollPolicy,
}

impl Clouds {
  pub fn new(aws: Arc<dyn AwsApi>) -> Self {
    Self {
      aws,
      compute: HashMap::new(),
      poll: PollPolicy::default(),
    }
  }

  pub fn with_compute(mut self, provider: Provider, api: Arc<dyn ComputeApi>) -> Self {
    self.compute.insert(provider, api);
    self
  }

  pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
    self.poll = poll;
    self
  }

  /// Every provider backed by one shared simulated cloud.
  pub fn simulated(cloud: &SimulatedCloud) -> Self {
    Provider::ALL.into_iter().fold(
      Self::new(Arc::new(cloud.clone())),
      |clouds, provider| clouds.with_compute(provider, Arc::new(cloud.clone())),
    )
  }

  pub fn compute(&self, provider: Provider) -> Result<&dyn ComputeApi, StepError> {
    self
      .compute
      .get(&provider)
      .map(Arc::as_ref)
      .ok_or_else(|| StepError::fatal(format!("no compute client for provider {provider}")))
  }
}
