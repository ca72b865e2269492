// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How many leading components of two versions must agree
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VersionLevel {
  Major,
  Minor,
  Patch,
}

impl VersionLevel {
  const fn components(self) -> usize {
    match self {
      VersionLevel::Major => 1,
      VersionLevel::Minor => 2,
      VersionLevel::Patch => 3,
    }
  }
}

/// Compares dotted versions up to `level`, ignoring pre-release and build suffixes
pub fn equal_versions(a: &str, b: &str, level: VersionLevel) -> bool {
  fn components(version: &str) -> Vec<&str> {
    let core = version
      .trim()
      .trim_start_matches('v')
      .split(|c| c == '-' || c == '+')
      .next()
      .unwrap_or_default();
    core.split('.').collect()
  }
  let (a, b) = (components(a), components(b));
  (0..level.components()).all(|i| match (a.get(i), b.get(i)) {
    (Some(x), Some(y)) => x == y,
    (None, None) => true,
    _ => false,
  })
}
