//! Test registry: discovery and selection of test cases.
//!
//! The registry flattens a [`SuiteDeclaration`] into an ordered list of
//! [`TestCase`]s. Discovery is deterministic: the same declaration always
//! yields the same ids in the same order, and that declaration order is the
//! tie-break used by every later stage (planning, reporting).
//!
//! # Ids
//!
//! A test id is the spec file path followed by every ancestor group title and
//! the test title, joined with `::`:
//!
//! ```text
//! tests/checkout.spec.ts::payment::enters card
//! ```
//!
//! Two declarations that resolve to the same id make discovery fail with
//! [`DiscoveryError::DuplicateId`]; there is no way to recover from this
//! because every downstream invariant is keyed on unique ids.

pub mod declaration;
pub mod tags;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::history::DurationHistory;

pub use declaration::{FileDeclaration, GroupDeclaration, SuiteDeclaration, TestDeclaration};
pub use tags::TagExpr;

/// Separator between the segments of a test id.
pub const ID_SEPARATOR: &str = "::";

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur while discovering or selecting tests.
///
/// All of these are fatal: the run aborts before planning.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Two declarations resolve to the same id.
    #[error("duplicate test id `{id}`")]
    DuplicateId { id: String },

    /// A test declaration has an empty title.
    #[error("test declared in {file} has an empty title")]
    EmptyTitle { file: String },

    /// A tag expression could not be parsed.
    #[error("invalid tag expression `{expression}`: {reason}")]
    InvalidTagExpression { expression: String, reason: String },

    /// A title filter is not a valid regular expression.
    #[error("invalid title pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// The suite declaration file could not be read.
    #[error("failed to read suite file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The suite declaration file is not valid.
    #[error("failed to parse suite file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

/// Metadata annotation that prevents a test from executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Annotation {
    Skip,
    Fixme,
}

/// Ordering constraint of a test case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingConstraint {
    /// No ordering requirement.
    #[default]
    Independent,
    /// Must execute after the test with this id, on the same shard.
    MustFollow(String),
}

/// A discovered test case.
///
/// Immutable once discovered; the planner, pool and reporters only read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    /// Stable unique id derived from file path, ancestor titles and title.
    pub id: String,

    /// Spec file the test is declared in.
    pub file: String,

    /// Ancestor group titles, outermost first.
    pub ancestors: Vec<String>,

    /// Test title.
    pub title: String,

    /// Tags, including those inherited from the file and groups.
    pub tags: BTreeSet<String>,

    /// Fixtures the test requires, inherited ones first.
    pub fixtures: Vec<String>,

    /// Ordering constraint.
    #[serde(default)]
    pub ordering: OrderingConstraint,

    /// `skip`/`fixme` annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,

    /// Rolling-average duration from history, if the test ran before.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,

    /// Command override for the command executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl TestCase {
    /// Creates an independent test case with no tags or fixtures.
    pub fn new(
        file: impl Into<String>,
        ancestors: Vec<String>,
        title: impl Into<String>,
    ) -> Self {
        let file = file.into();
        let title = title.into();
        Self {
            id: compose_id(&file, &ancestors, &title),
            file,
            ancestors,
            title,
            tags: BTreeSet::new(),
            fixtures: Vec::new(),
            ordering: OrderingConstraint::Independent,
            annotation: None,
            estimated_duration_ms: None,
            command: None,
        }
    }

    /// Adds a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Adds a fixture requirement.
    pub fn with_fixture(mut self, fixture: impl Into<String>) -> Self {
        let fixture = fixture.into();
        if !self.fixtures.contains(&fixture) {
            self.fixtures.push(fixture);
        }
        self
    }

    /// Requires this case to run after the case with the given id.
    pub fn must_follow(mut self, id: impl Into<String>) -> Self {
        self.ordering = OrderingConstraint::MustFollow(id.into());
        self
    }

    /// Sets a `skip`/`fixme` annotation.
    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotation = Some(annotation);
        self
    }

    /// Sets the historical duration estimate.
    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_duration_ms = Some(estimate.as_millis() as u64);
        self
    }

    /// Returns the historical duration estimate.
    pub fn estimated_duration(&self) -> Option<Duration> {
        self.estimated_duration_ms.map(Duration::from_millis)
    }

    /// Returns the id this case must follow, if constrained.
    pub fn predecessor(&self) -> Option<&str> {
        match &self.ordering {
            OrderingConstraint::Independent => None,
            OrderingConstraint::MustFollow(id) => Some(id),
        }
    }

    /// Returns `true` if an annotation prevents execution.
    pub fn is_annotated_skip(&self) -> bool {
        self.annotation.is_some()
    }

    /// Group titles and test title joined for display.
    pub fn full_title(&self) -> String {
        let mut parts: Vec<&str> = self.ancestors.iter().map(String::as_str).collect();
        parts.push(&self.title);
        parts.join(" › ")
    }
}

/// Composes a test id from its file, ancestors and title.
pub fn compose_id(file: &str, ancestors: &[String], title: &str) -> String {
    let mut id = String::from(file);
    for segment in ancestors.iter().map(String::as_str).chain(std::iter::once(title)) {
        id.push_str(ID_SEPARATOR);
        id.push_str(segment);
    }
    id
}

/// Ordered, indexed collection of discovered test cases.
#[derive(Debug, Clone, Default)]
pub struct TestRegistry {
    cases: Vec<TestCase>,
    index: HashMap<String, usize>,
}

/// Values inherited from enclosing files and groups during discovery.
#[derive(Clone)]
struct Inherited<'a> {
    file: &'a str,
    ancestors: Vec<String>,
    tags: BTreeSet<String>,
    fixtures: Vec<String>,
    annotation: Option<Annotation>,
}

impl Inherited<'_> {
    fn enter(&self, group: &GroupDeclaration) -> Self {
        let mut next = self.clone();
        next.ancestors.push(group.title.clone());
        next.tags.extend(group.tags.iter().cloned());
        push_unique(&mut next.fixtures, &group.fixtures);
        next.annotation = group.annotation.or(self.annotation);
        next
    }
}

fn push_unique(target: &mut Vec<String>, values: &[String]) {
    for value in values {
        if !target.contains(value) {
            target.push(value.clone());
        }
    }
}

impl TestRegistry {
    /// Discovers test cases from a suite declaration.
    ///
    /// Duration estimates are attached from `history`; tests that never ran
    /// keep an empty estimate.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::DuplicateId`] if two declarations resolve
    /// to the same id, or [`DiscoveryError::EmptyTitle`] for untitled tests.
    pub fn discover(
        suite: &SuiteDeclaration,
        history: &DurationHistory,
    ) -> DiscoveryResult<Self> {
        let mut cases = Vec::with_capacity(suite.test_count());

        for file in &suite.files {
            let mut inherited = Inherited {
                file: &file.path,
                ancestors: Vec::new(),
                tags: file.tags.iter().cloned().collect(),
                fixtures: Vec::new(),
                annotation: None,
            };
            push_unique(&mut inherited.fixtures, &file.fixtures);
            collect(&inherited, &file.tests, &file.groups, &mut cases)?;
        }

        for case in &mut cases {
            case.estimated_duration_ms = history
                .estimate(&case.id)
                .map(|d| d.as_millis() as u64);
        }

        let registry = Self::from_cases(cases)?;
        debug!("Discovered {} test cases", registry.len());
        Ok(registry)
    }

    /// Builds a registry from already-constructed cases.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::DuplicateId`] on repeated ids.
    pub fn from_cases(cases: Vec<TestCase>) -> DiscoveryResult<Self> {
        let mut index = HashMap::with_capacity(cases.len());
        for (position, case) in cases.iter().enumerate() {
            if index.insert(case.id.clone(), position).is_some() {
                return Err(DiscoveryError::DuplicateId {
                    id: case.id.clone(),
                });
            }
        }
        Ok(Self { cases, index })
    }

    /// All cases in declaration order.
    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    /// Looks up a case by id.
    pub fn get(&self, id: &str) -> Option<&TestCase> {
        self.index.get(id).map(|&i| &self.cases[i])
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Selects cases matching a tag expression.
    ///
    /// Cases that a selected case must follow are kept as well, so the
    /// selection is always plannable.
    pub fn filter(&self, expression: &str) -> DiscoveryResult<Vec<TestCase>> {
        let expr = TagExpr::parse(expression)?;
        Ok(self.select(|case| expr.matches(&case.tags)))
    }

    /// Selects cases whose id matches a regular expression.
    pub fn grep(&self, pattern: &str) -> DiscoveryResult<Vec<TestCase>> {
        let re = Regex::new(pattern)?;
        Ok(self.select(|case| re.is_match(&case.id)))
    }

    /// Applies the optional tag expression and title pattern together.
    pub fn selection(
        &self,
        tags: Option<&str>,
        grep: Option<&str>,
    ) -> DiscoveryResult<Vec<TestCase>> {
        let expr = tags.map(TagExpr::parse).transpose()?;
        let re = grep.map(Regex::new).transpose()?;
        Ok(self.select(|case| {
            expr.as_ref().is_none_or(|e| e.matches(&case.tags))
                && re.as_ref().is_none_or(|r| r.is_match(&case.id))
        }))
    }

    /// Selects cases matching `predicate` plus their predecessors, in
    /// declaration order.
    pub fn select(&self, predicate: impl Fn(&TestCase) -> bool) -> Vec<TestCase> {
        let mut keep: HashSet<usize> = HashSet::new();
        for (position, case) in self.cases.iter().enumerate() {
            if !predicate(case) {
                continue;
            }
            let mut current = Some(position);
            while let Some(p) = current {
                if !keep.insert(p) {
                    break;
                }
                current = self.cases[p]
                    .predecessor()
                    .and_then(|id| self.index.get(id).copied());
            }
        }

        self.cases
            .iter()
            .enumerate()
            .filter(|(position, _)| keep.contains(position))
            .map(|(_, case)| case.clone())
            .collect()
    }
}

fn collect(
    inherited: &Inherited<'_>,
    tests: &[TestDeclaration],
    groups: &[GroupDeclaration],
    out: &mut Vec<TestCase>,
) -> DiscoveryResult<()> {
    for test in tests {
        if test.title.trim().is_empty() {
            return Err(DiscoveryError::EmptyTitle {
                file: inherited.file.to_string(),
            });
        }

        let mut case = TestCase::new(inherited.file, inherited.ancestors.clone(), &test.title);
        case.tags = inherited.tags.clone();
        case.tags.extend(test.tags.iter().cloned());
        case.fixtures = inherited.fixtures.clone();
        push_unique(&mut case.fixtures, &test.fixtures);
        case.annotation = test.annotation.or(inherited.annotation);
        case.command = test.command.clone();

        if let Some(target) = &test.must_follow {
            let id = if target.contains(ID_SEPARATOR) {
                target.clone()
            } else {
                compose_id(inherited.file, &inherited.ancestors, target)
            };
            case.ordering = OrderingConstraint::MustFollow(id);
        }

        out.push(case);
    }

    for group in groups {
        collect(&inherited.enter(group), &group.tests, &group.groups, out)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITE: &str = r#"
        [[file]]
        path = "tests/cart.spec.ts"
        tags = ["@cart"]
        fixtures = ["page"]

        [[file.test]]
        title = "empty cart"
        tags = ["@smoke"]

        [[file.group]]
        title = "checkout"
        fixtures = ["logged_in"]

        [[file.group.test]]
        title = "enter card"

        [[file.group.test]]
        title = "confirm"
        must_follow = "enter card"
        tags = ["@slow"]

        [[file.group.test]]
        title = "legacy"
        annotation = "skip"

        [[file]]
        path = "tests/search.spec.ts"

        [[file.test]]
        title = "finds products"
        tags = ["@smoke"]
    "#;

    fn registry() -> TestRegistry {
        let suite = SuiteDeclaration::from_toml_str(SUITE).unwrap();
        TestRegistry::discover(&suite, &DurationHistory::default()).unwrap()
    }

    #[test]
    fn test_discover_declaration_order_and_ids() {
        let registry = registry();
        let ids: Vec<_> = registry.cases().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "tests/cart.spec.ts::empty cart",
                "tests/cart.spec.ts::checkout::enter card",
                "tests/cart.spec.ts::checkout::confirm",
                "tests/cart.spec.ts::checkout::legacy",
                "tests/search.spec.ts::finds products",
            ]
        );
    }

    #[test]
    fn test_discover_is_deterministic() {
        let a: Vec<_> = registry().cases().to_vec();
        let b: Vec<_> = registry().cases().to_vec();
        assert_eq!(a, b);
    }

    #[test]
    fn test_inheritance() {
        let registry = registry();
        let confirm = registry.get("tests/cart.spec.ts::checkout::confirm").unwrap();
        assert_eq!(confirm.fixtures, vec!["page", "logged_in"]);
        assert!(confirm.tags.contains("@cart"));
        assert!(confirm.tags.contains("@slow"));
        assert_eq!(
            confirm.predecessor(),
            Some("tests/cart.spec.ts::checkout::enter card")
        );
        assert_eq!(confirm.full_title(), "checkout › confirm");

        let legacy = registry.get("tests/cart.spec.ts::checkout::legacy").unwrap();
        assert_eq!(legacy.annotation, Some(Annotation::Skip));
    }

    #[test]
    fn test_duplicate_title_in_same_path_is_fatal() {
        let suite = SuiteDeclaration::from_toml_str(
            r#"
            [[file]]
            path = "a.spec.ts"
            [[file.test]]
            title = "same"
            [[file.test]]
            title = "same"
            "#,
        )
        .unwrap();
        let err = TestRegistry::discover(&suite, &DurationHistory::default()).unwrap_err();
        assert!(matches!(err, DiscoveryError::DuplicateId { id } if id == "a.spec.ts::same"));
    }

    #[test]
    fn test_same_title_under_different_groups_is_fine() {
        let suite = SuiteDeclaration::from_toml_str(
            r#"
            [[file]]
            path = "a.spec.ts"
            [[file.group]]
            title = "one"
            [[file.group.test]]
            title = "same"
            [[file.group]]
            title = "two"
            [[file.group.test]]
            title = "same"
            "#,
        )
        .unwrap();
        let registry = TestRegistry::discover(&suite, &DurationHistory::default()).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_history_estimates_are_attached() {
        let suite = SuiteDeclaration::from_toml_str(SUITE).unwrap();
        let mut history = DurationHistory::default();
        history.record_sample("tests/search.spec.ts::finds products", Duration::from_millis(1500));
        let registry = TestRegistry::discover(&suite, &history).unwrap();

        let finds = registry.get("tests/search.spec.ts::finds products").unwrap();
        assert_eq!(finds.estimated_duration(), Some(Duration::from_millis(1500)));
        let empty = registry.get("tests/cart.spec.ts::empty cart").unwrap();
        assert_eq!(empty.estimated_duration(), None);
    }

    #[test]
    fn test_filter_keeps_predecessors() {
        let registry = registry();
        let selected = registry.filter("@slow").unwrap();
        let ids: Vec<_> = selected.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "tests/cart.spec.ts::checkout::enter card",
                "tests/cart.spec.ts::checkout::confirm",
            ]
        );
    }

    #[test]
    fn test_filter_by_tag_expression() {
        let registry = registry();
        let selected = registry.filter("@smoke and not @cart").unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "tests/search.spec.ts::finds products");
    }

    #[test]
    fn test_grep_and_selection() {
        let registry = registry();
        assert_eq!(registry.grep("search").unwrap().len(), 1);
        assert_eq!(
            registry.selection(Some("@cart"), Some("checkout")).unwrap().len(),
            3
        );
        assert!(matches!(
            registry.grep("(").unwrap_err(),
            DiscoveryError::InvalidPattern(_)
        ));
    }
}
