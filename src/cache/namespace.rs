//! Names of the versioned cache namespaces.

/// The two namespaces that are current for one deployed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespaces {
  /// Build artifacts, e.g. `todo-app-v1.1.0`
  pub static_assets: String,
  /// API responses and offline records, e.g. `todo-api-v1.1.0`
  pub api: String,
  api_prefix: String,
}

impl Namespaces {
  pub fn for_version(static_prefix: &str, api_prefix: &str, version: &str) -> Self {
    Self {
      static_assets: format!("{}-{}", static_prefix, version),
      api: format!("{}-{}", api_prefix, version),
      api_prefix: format!("{}-", api_prefix),
    }
  }

  /// Whether `name` is one of this version's namespaces.
  pub fn is_current(&self, name: &str) -> bool {
    name == self.static_assets || name == self.api
  }

  /// Whether `name` is an API namespace of some (possibly older) version.
  pub fn is_api_namespace(&self, name: &str) -> bool {
    name.starts_with(&self.api_prefix)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_names_follow_prefix_and_version() {
    let ns = Namespaces::for_version("todo-app", "todo-api", "v1.1.0");
    assert_eq!(ns.static_assets, "todo-app-v1.1.0");
    assert_eq!(ns.api, "todo-api-v1.1.0");
    assert!(ns.is_current("todo-api-v1.1.0"));
    assert!(!ns.is_current("todo-api-v1.0.0"));
    assert!(ns.is_api_namespace("todo-api-v1.0.0"));
    assert!(!ns.is_api_namespace("todo-app-v1.0.0"));
  }
}
