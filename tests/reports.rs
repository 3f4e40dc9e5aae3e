use std::fs;
use std::path::Path;

use stagehand::error::ReportParseError;
use stagehand::report::{collect_coverage, collect_junit, parse_coverage_str, parse_junit_str};
use tempfile::tempdir;

const PYTEST_JUNIT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<testsuites>
  <testsuite name="pytest" errors="1" failures="1" skipped="1" tests="5" time="0.42">
    <testcase classname="tests.test_math" name="test_add" time="0.001"/>
    <testcase classname="tests.test_math" name="test_sub" time="0.001"></testcase>
    <testcase classname="tests.test_math" name="test_div" time="0.002">
      <failure message="ZeroDivisionError: division by zero">def test_div():
&gt;       assert 1 / 0
E       ZeroDivisionError</failure>
    </testcase>
    <testcase classname="tests.test_io" name="test_read" time="0.003">
      <error message="fixture 'tmp' not found">setup failed</error>
    </testcase>
    <testcase classname="tests.test_io" name="test_skip" time="0.000">
      <skipped type="pytest.skip" message="needs network"/>
    </testcase>
    <!-- <testcase name="commented out"/> -->
  </testsuite>
</testsuites>
"#;

const COBERTURA: &str = r#"<?xml version="1.0" ?>
<!DOCTYPE coverage SYSTEM "http://cobertura.sourceforge.net/xml/coverage-04.dtd">
<coverage version="7.4.0" timestamp="1700000000" lines-valid="200" lines-covered="150" line-rate="0.75" branches-covered="0" branches-valid="0" branch-rate="0.5" complexity="0">
  <sources><source>/work</source></sources>
  <packages/>
</coverage>
"#;

#[test]
fn parses_pytest_junit_output() {
    let summary = parse_junit_str(PYTEST_JUNIT, Path::new("junit.xml")).unwrap();
    assert_eq!(summary.passed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.total(), 5);
    assert!(summary.has_failures());
    assert_eq!(
        summary.failing_cases,
        vec![
            "tests.test_math.test_div".to_string(),
            "tests.test_io.test_read".to_string()
        ]
    );
}

#[test]
fn rejects_malformed_junit() {
    let cases = [
        "<testsuite><testcase name='a'></testsuite>",
        "<testsuite><testcase name='a'>",
        "<report><case/></report>",
        "",
    ];
    for xml in cases {
        let err = parse_junit_str(xml, Path::new("bad.xml")).unwrap_err();
        assert!(
            matches!(err, ReportParseError::Malformed { .. }),
            "{xml:?} gave {err}"
        );
    }
}

#[test]
fn parses_cobertura_summary() {
    let summary = parse_coverage_str(COBERTURA, Path::new("coverage.xml")).unwrap();
    assert!((summary.line_rate - 0.75).abs() < 1e-9);
    assert_eq!(summary.branch_rate, Some(0.5));
    assert_eq!(summary.lines_covered, Some(150));
    assert_eq!(summary.lines_valid, Some(200));
    assert!((summary.line_percent() - 75.0).abs() < 1e-9);
}

#[test]
fn rejects_coverage_without_line_rate() {
    for xml in ["<coverage/>", "<coverage line-rate='1.5'/>", "<report/>"] {
        assert!(parse_coverage_str(xml, Path::new("c.xml")).is_err(), "{xml}");
    }
}

#[test]
fn collect_sums_files_and_skips_bad_ones() {
    let temp = tempdir().unwrap();
    let reports = temp.path().join("reports");
    fs::create_dir_all(&reports).unwrap();
    fs::write(reports.join("a.xml"), PYTEST_JUNIT).unwrap();
    fs::write(
        reports.join("b.xml"),
        "<testsuite><testcase name='x'/><testcase name='y'/></testsuite>",
    )
    .unwrap();
    fs::write(reports.join("broken.xml"), "<testsuite>").unwrap();

    let collected = collect_junit(temp.path(), &["reports/*.xml".to_string()], &[]);
    let summary = collected.summary.unwrap();
    assert_eq!(summary.files, 2);
    assert_eq!(summary.passed, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(collected.errors.len(), 1);
}

#[test]
fn collect_with_no_matches_has_no_summary() {
    let temp = tempdir().unwrap();
    let collected = collect_junit(temp.path(), &["nothing/*.xml".to_string()], &[]);
    assert!(collected.summary.is_none());
    assert!(collected.errors.is_empty());

    let coverage = collect_coverage(temp.path(), &["[".to_string()], &[]);
    assert!(coverage.summary.is_none());
    assert!(matches!(
        coverage.errors[0],
        ReportParseError::InvalidPattern { .. }
    ));
}

#[test]
fn collect_coverage_merges_line_counts() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("one.xml"), COBERTURA).unwrap();
    fs::write(
        temp.path().join("two.xml"),
        r#"<coverage line-rate="1.0" lines-covered="50" lines-valid="50"/>"#,
    )
    .unwrap();

    let collected = collect_coverage(temp.path(), &["*.xml".to_string()], &[]);
    let summary = collected.summary.unwrap();
    assert_eq!(summary.files, 2);
    assert_eq!(summary.lines_valid, Some(250));
    assert!((summary.line_rate - 200.0 / 250.0).abs() < 1e-9);
}
