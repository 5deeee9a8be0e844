//! Step-recording helpers for unit tests.
//!
//! `TestReport` records labelled assertions and, when `TEST_REPORT_DIR`
//! is set, writes one structured report file per test for the report
//! generator tool.

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Mutex;

/// Create a [`TestReport`] named after the calling test function.
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = &name[..name.len() - 3]; // strip "::f"
        let name = name.strip_suffix("::{{closure}}").unwrap_or(name); // async tests
        $crate::test_support::TestReport::new(name, $title)
    }};
}

pub struct TestReport {
    test_path: String,
    title: String,
    steps: Mutex<Vec<(bool, String)>>,
    report_dir: Option<PathBuf>,
}

impl TestReport {
    pub fn new(test_path: &str, title: &str) -> Self {
        Self {
            test_path: test_path.to_string(),
            title: title.to_string(),
            steps: Mutex::new(Vec::new()),
            report_dir: std::env::var("TEST_REPORT_DIR").ok().map(PathBuf::from),
        }
    }

    fn record(&self, pass: bool, message: String) {
        self.steps.lock().unwrap().push((pass, message));
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        self.record(value, format!("{}: {}", label, value));
        assert!(value, "{}", label);
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug,
        E: Debug,
    {
        let pass = actual == expected;
        self.record(pass, format!("{}: {:?} == {:?}", label, actual, expected));
        assert_eq!(actual, expected, "{}", label);
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        let pass = haystack.contains(needle);
        self.record(pass, format!("{}: contains {:?}", label, needle));
        assert!(pass, "{}: {:?} does not contain {:?}", label, haystack, needle);
    }

    fn write_report(&self) {
        let Some(dir) = &self.report_dir else {
            return;
        };

        let result = if std::thread::panicking() {
            "fail"
        } else {
            "pass"
        };

        let steps = self.steps.lock().unwrap();
        let mut lines = Vec::with_capacity(steps.len() + 3);
        lines.push(format!("NAME: {}", self.test_path));
        lines.push(format!("TITLE: {}", self.title));
        for (pass, message) in steps.iter() {
            let tag = if *pass { "ok" } else { "FAILED" };
            lines.push(format!("STEP {}: {}", tag, message));
        }
        lines.push(format!("RESULT: {}", result));
        lines.push(String::new());

        let file = format!("{}.txt", self.test_path.replace("::", "__"));
        let _ = std::fs::create_dir_all(dir);
        let _ = std::fs::write(dir.join(file), lines.join("\n"));
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        self.write_report();
    }
}
