use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// The closed set of supported IaaS back-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
  #[serde(rename = "aws")]
  Aws,
  #[serde(rename = "digitalocean")]
  DigitalOcean,
  #[serde(rename = "gce")]
  Gce,
  #[serde(rename = "azure")]
  Azure,
  #[serde(rename = "openstack")]
  OpenStack,
  #[serde(rename = "packet")]
  Packet,
}

impl Provider {
  pub const ALL: [Provider; 6] = [
    Provider::Aws,
    Provider::DigitalOcean,
    Provider::Gce,
    Provider::Azure,
    Provider::OpenStack,
    Provider::Packet,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Provider::Aws => "aws",
      Provider::DigitalOcean => "digitalocean",
      Provider::Gce => "gce",
      Provider::Azure => "azure",
      Provider::OpenStack => "openstack",
      Provider::Packet => "packet",
    }
  }
}

impl fmt::Display for Provider {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Provider {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Provider::ALL
      .into_iter()
      .find(|p| p.as_str() == s)
      .ok_or_else(|| ConfigError::UnknownProvider(s.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_round_trip() {
    for provider in Provider::ALL {
      assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
    }
  }

  #[test]
  fn test_unknown_provider() {
    assert_eq!(
      "vultr".parse::<Provider>(),
      Err(ConfigError::UnknownProvider("vultr".to_string()))
    );
    assert!(serde_json::from_str::<Provider>("\"vultr\"").is_err());
  }
}
