//! A mutable byte buffer plus the lineage metadata strategies attach to it.

use std::fs;
use std::path::Path;

use derive_new::new as New;

use crate::error::Result;

/// One candidate input, either loaded from a seed file or produced by a
/// [`crate::strategy::Strategy`].
#[derive(Debug, Clone, New)]
pub struct TestCase {
    pub data: Vec<u8>,
    #[new(into)]
    pub name: String,
    /// Human-readable log of the mutations applied to reach this case.
    /// Diagnostic only: never consulted for control flow.
    #[new(default)]
    pub mutations: String,
    /// Resume markers a descendant strategy chain may start from instead of
    /// byte 0 / bit 0. Only the sequential bit-flip strategy reads these.
    #[new(default)]
    pub start_byte_pos: Option<usize>,
    #[new(default)]
    pub start_bit_pos: Option<usize>,
}

impl TestCase {
    /// A clone that records one more mutation description and clears any
    /// resume markers that the producing strategy didn't explicitly set.
    pub fn derive(&self, mutation: impl AsRef<str>) -> Self {
        let mut mutations = self.mutations.clone();
        if !mutations.is_empty() {
            mutations.push_str("; ");
        }
        mutations.push_str(mutation.as_ref());
        Self {
            data: self.data.clone(),
            name: self.name.clone(),
            mutations,
            start_byte_pos: None,
            start_bit_pos: None,
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.data)?;
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Ok(Self::new(data, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn derive_deep_copies_data() {
        let seed = TestCase::new(vec![1, 2, 3], "seed");
        let mut child = seed.derive("flip bit 0");
        child.data[0] = 99;
        assert_eq!(seed.data, vec![1, 2, 3]);
        assert_eq!(child.mutations, "flip bit 0");
    }

    #[test]
    fn load_from_names_case_after_basename() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        let case = TestCase::load_from(file.path()).unwrap();
        assert_eq!(case.data, b"hello");
        assert_eq!(case.name, file.path().file_name().unwrap().to_string_lossy());
    }

    #[test]
    fn write_to_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let case = TestCase::new(vec![9, 8, 7], "x");
        case.write_to(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![9, 8, 7]);
    }
}
