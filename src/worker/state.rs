use std::fmt;

/// Lifecycle phase of a cache worker.
///
/// ```text
/// Uninstalled -> Installing -> Installed -> Activating -> Active
///                    |                          |           |
///                    +--------> Redundant <-----+-----------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, nothing fetched yet
  Uninstalled,
  /// Precaching the asset manifest
  Installing,
  /// Manifest stored; waiting to take control
  Installed,
  /// Pruning stale cache stores
  Activating,
  /// Controlling fetches
  Active,
  /// Failed to install or replaced by a newer version
  Redundant,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Uninstalled => "uninstalled",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    }
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
