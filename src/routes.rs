//! Mapping of API paths to entity collections.

use serde::Deserialize;
use url::Url;

/// One entity collection exposed by the data API (e.g. the TODO table).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectionRoute {
  /// Short name, also used to name the snapshot record (`offline-<name>`)
  pub name: String,
  /// Collection path, e.g. `/rest/v1/todos`
  pub path: String,
  /// Field holding the entity identifier
  #[serde(default = "default_id_field")]
  pub id_field: String,
  /// Prefix for identifiers synthesized while offline
  #[serde(default = "default_local_id_prefix")]
  pub local_id_prefix: String,
}

fn default_id_field() -> String {
  "id".to_string()
}

fn default_local_id_prefix() -> String {
  "offline_".to_string()
}

impl CollectionRoute {
  pub fn new(name: &str, path: &str) -> Self {
    Self {
      name: name.to_string(),
      path: path.trim_end_matches('/').to_string(),
      id_field: default_id_field(),
      local_id_prefix: default_local_id_prefix(),
    }
  }

  /// Name of the record holding this collection's snapshot.
  pub fn snapshot_record(&self) -> String {
    format!("offline-{}", self.name)
  }
}

/// A request URL resolved against a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a> {
  pub route: &'a CollectionRoute,
  /// Entity targeted by the URL, if any
  pub target_id: Option<String>,
}

/// Configured collection routes, checked in order.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
  routes: Vec<CollectionRoute>,
}

impl RouteTable {
  pub fn new(routes: Vec<CollectionRoute>) -> Self {
    Self { routes }
  }

  pub fn routes(&self) -> &[CollectionRoute] {
    &self.routes
  }

  /// Resolve a URL to a collection.
  ///
  /// The target id comes from the path segment right after the collection
  /// path (`/todos/42`) or from an equality filter on the id field
  /// (`/todos?id=eq.42`).
  pub fn match_url(&self, url: &Url) -> Option<RouteMatch<'_>> {
    let path = url.path().trim_end_matches('/');

    for route in &self.routes {
      let rest = match path.strip_prefix(route.path.trim_end_matches('/')) {
        Some(rest) => rest,
        None => continue,
      };

      let target_id = if rest.is_empty() {
        id_from_query(url, &route.id_field)
      } else if let Some(segment) = rest.strip_prefix('/') {
        if segment.is_empty() || segment.contains('/') {
          continue;
        }
        Some(segment.to_string())
      } else {
        // `/todos_archive` is not `/todos`
        continue;
      };

      return Some(RouteMatch { route, target_id });
    }

    None
  }
}

fn id_from_query(url: &Url, id_field: &str) -> Option<String> {
  url
    .query_pairs()
    .find(|(key, _)| key == id_field)
    .and_then(|(_, value)| value.strip_prefix("eq.").map(String::from))
}
