//! JUnit XML rendering of a run report.
//!
//! The output is compatible with Jenkins, GitLab CI, GitHub Actions and
//! other CI platforms. One `<testsuite>` is written per spec file.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="shardline" tests="3" failures="1" skipped="1" time="4.200">
//!   <testsuite name="tests/cart.spec" tests="3" failures="1" skipped="1" time="4.200">
//!     <testcase classname="tests/cart.spec" name="checkout › pays" time="1.000">
//!       <flakyFailure message="command exited with code 1" type="ExecutionFailed"/>
//!     </testcase>
//!     <testcase classname="tests/cart.spec" name="refunds" time="3.200">
//!       <failure message="attempt exceeded 3000 ms" type="ExecutionTimeout"/>
//!     </testcase>
//!     <testcase classname="tests/cart.spec" name="coupons" time="0.000">
//!       <skipped message="Annotation"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Flaky tests are passing testcases carrying one `<flakyFailure>` per
//! failed attempt, the convention surefire-style consumers understand.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::RunReport;
use crate::record::{Attempt, FinalStatus, TestResult};
use crate::registry::ID_SEPARATOR;

/// Renders `report` and writes it to `path`, creating parent directories.
pub fn write_junit(report: &RunReport, path: &Path) -> Result<()> {
    let xml = render_junit(report)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    std::fs::write(path, xml)
        .with_context(|| format!("Failed to write JUnit XML to {}", path.display()))?;
    Ok(())
}

/// Renders `report` as JUnit XML.
pub fn render_junit(report: &RunReport) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let counts = &report.counts;
    let mut testsuites = BytesStart::new("testsuites");
    testsuites.push_attribute(("name", "shardline"));
    testsuites.push_attribute(("tests", counts.total.to_string().as_str()));
    testsuites.push_attribute(("failures", counts.failed.to_string().as_str()));
    testsuites.push_attribute(("skipped", counts.skipped.to_string().as_str()));
    testsuites.push_attribute(("time", seconds(counts.duration_ms).as_str()));
    writer.write_event(Event::Start(testsuites))?;

    // Results are sorted by id, so each file's cases stay in id order.
    let mut by_file: BTreeMap<&str, Vec<(&str, &TestResult)>> = BTreeMap::new();
    for result in &report.results {
        let (file, name) = split_id(&result.id);
        by_file.entry(file).or_default().push((name, result));
    }

    for (file, cases) in &by_file {
        let count = |status| cases.iter().filter(|(_, r)| r.status == status).count();
        let time: u64 = cases
            .iter()
            .map(|(_, r)| r.total_duration().as_millis() as u64)
            .sum();

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", *file));
        testsuite.push_attribute(("tests", cases.len().to_string().as_str()));
        testsuite.push_attribute(("failures", count(FinalStatus::Failed).to_string().as_str()));
        testsuite.push_attribute(("skipped", count(FinalStatus::Skipped).to_string().as_str()));
        testsuite.push_attribute(("time", seconds(time).as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for (name, result) in cases {
            write_testcase(&mut writer, file, name, result)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    let xml = String::from_utf8(writer.into_inner())?;
    Ok(xml)
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    file: &str,
    name: &str,
    result: &TestResult,
) -> Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", file));
    testcase.push_attribute(("name", name));
    testcase.push_attribute((
        "time",
        seconds(result.total_duration().as_millis() as u64).as_str(),
    ));

    match result.status {
        FinalStatus::Passed => {
            writer.write_event(Event::Empty(testcase))?;
        }
        FinalStatus::Flaky => {
            writer.write_event(Event::Start(testcase))?;
            for attempt in result.attempts.iter().filter(|a| a.outcome.is_failure()) {
                write_attempt_failure(writer, "flakyFailure", attempt)?;
            }
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        FinalStatus::Failed => {
            writer.write_event(Event::Start(testcase))?;
            match result.final_attempt() {
                Some(last) if last.outcome.is_failure() => {
                    write_attempt_failure(writer, "failure", last)?;
                }
                // Skipped at run time after an earlier failure.
                _ => {
                    let mut failure = BytesStart::new("failure");
                    failure.push_attribute(("message", "skipped after a failed attempt"));
                    writer.write_event(Event::Empty(failure))?;
                }
            }
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        FinalStatus::Skipped => {
            writer.write_event(Event::Start(testcase))?;
            let mut skipped = BytesStart::new("skipped");
            if let Some(reason) = result.skip_reason {
                skipped.push_attribute(("message", format!("{:?}", reason).as_str()));
            }
            writer.write_event(Event::Empty(skipped))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
    }

    Ok(())
}

fn write_attempt_failure<W: std::io::Write>(
    writer: &mut Writer<W>,
    element: &str,
    attempt: &Attempt,
) -> Result<()> {
    let mut failure = BytesStart::new(element);
    if let Some(error) = &attempt.error {
        failure.push_attribute(("message", error.message.as_str()));
        failure.push_attribute(("type", format!("{:?}", error.kind).as_str()));
    }

    if attempt.diagnostics.is_empty() {
        writer.write_event(Event::Empty(failure))?;
    } else {
        writer.write_event(Event::Start(failure))?;
        let text = format!(
            "attempt {}: {}",
            attempt.index,
            attempt.diagnostics.join(", ")
        );
        writer.write_event(Event::Text(BytesText::new(&text)))?;
        writer.write_event(Event::End(BytesEnd::new(element)))?;
    }
    Ok(())
}

/// Splits an id into its spec file and the rest of the title path.
fn split_id(id: &str) -> (&str, &str) {
    id.split_once(ID_SEPARATOR).unwrap_or(("", id))
}

fn seconds(ms: u64) -> String {
    format!("{:.3}", ms as f64 / 1000.0)
}
