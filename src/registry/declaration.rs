//! Suite declaration file format.
//!
//! A suite declaration is the input tree the registry discovers test cases
//! from. It is a TOML file made of spec files, each holding tests and
//! (recursively nested) groups:
//!
//! ```toml
//! [[file]]
//! path = "tests/checkout.spec.ts"
//! tags = ["@checkout"]
//!
//! [[file.test]]
//! title = "shows empty cart"
//!
//! [[file.group]]
//! title = "payment"
//! fixtures = ["logged_in_page"]
//!
//! [[file.group.test]]
//! title = "enters card"
//! tags = ["@smoke"]
//!
//! [[file.group.test]]
//! title = "confirms order"
//! must_follow = "enters card"
//! ```
//!
//! Within a container, direct tests are declared before nested groups.
//! Tags, fixtures and annotations of a file or group apply to everything
//! beneath it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Annotation, DiscoveryError, DiscoveryResult};

/// Root of a suite declaration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SuiteDeclaration {
    /// Spec files in declaration order.
    #[serde(default, rename = "file")]
    pub files: Vec<FileDeclaration>,
}

/// A spec file and its contents.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FileDeclaration {
    /// Path of the spec file; the first segment of every id inside it.
    pub path: String,

    /// Tags applied to every test in the file.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Fixtures required by every test in the file.
    #[serde(default)]
    pub fixtures: Vec<String>,

    /// Tests declared at the top level of the file.
    #[serde(default, rename = "test")]
    pub tests: Vec<TestDeclaration>,

    /// Groups declared at the top level of the file.
    #[serde(default, rename = "group")]
    pub groups: Vec<GroupDeclaration>,
}

/// A named group of tests (a `describe` block).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GroupDeclaration {
    pub title: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub fixtures: Vec<String>,

    /// Annotation inherited by every test in the group.
    pub annotation: Option<Annotation>,

    #[serde(default, rename = "test")]
    pub tests: Vec<TestDeclaration>,

    #[serde(default, rename = "group")]
    pub groups: Vec<GroupDeclaration>,
}

/// A single test declaration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TestDeclaration {
    pub title: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub fixtures: Vec<String>,

    /// `skip` or `fixme`; annotated tests are never executed.
    pub annotation: Option<Annotation>,

    /// Id of the test this one must run after.
    ///
    /// A value without `::` names a sibling declared in the same container.
    pub must_follow: Option<String>,

    /// Command override for the command executor.
    pub command: Option<String>,
}

impl SuiteDeclaration {
    /// Loads a suite declaration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Io`] if the file cannot be read and
    /// [`DiscoveryError::Parse`] if it is not a valid declaration.
    pub fn load(path: &Path) -> DiscoveryResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| DiscoveryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path.to_path_buf())
    }

    /// Parses a suite declaration from a TOML string.
    pub fn from_toml_str(content: &str) -> DiscoveryResult<Self> {
        Self::parse(content, PathBuf::from("<inline>"))
    }

    fn parse(content: &str, path: PathBuf) -> DiscoveryResult<Self> {
        toml::from_str(content).map_err(|e| DiscoveryError::Parse {
            path,
            message: e.to_string(),
        })
    }

    /// Total number of test declarations in the tree.
    pub fn test_count(&self) -> usize {
        fn count_group(group: &GroupDeclaration) -> usize {
            group.tests.len() + group.groups.iter().map(count_group).sum::<usize>()
        }
        self.files
            .iter()
            .map(|f| f.tests.len() + f.groups.iter().map(count_group).sum::<usize>())
            .sum()
    }
}
