//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees of a run.

use std::fs;
use std::path::{Path, PathBuf};

use fragforge_core::{
    escape::{escape_for_cdata, unwrap_cdata},
    ConversionPipeline, Layer, PageId, RunConfig, RunReport, RunState,
};
use tempfile::TempDir;

const TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>{{TITLE}}</title><style>{{STYLESHEET}}</style></head>
<body data-page-id="{{PAGE_ID}}">
<main>{{CONTENT}}</main>
<nav>{{PREV_LINK}} {{INDEX_LINK}} {{NEXT_LINK}}</nav>
<script>{{SCRIPT}}</script>
</body>
</html>
"#;

struct Workspace {
    _dir: TempDir,
    config: RunConfig,
}

impl Workspace {
    /// Template, assets and one content file per `(id, body)` pair.
    fn new(pages: &[(u32, &str)], last: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("content")).unwrap();
        fs::write(root.join("page.html"), TEMPLATE).unwrap();
        fs::write(root.join("shared.css"), "main { padding: 1rem; }").unwrap();
        fs::write(root.join("shared.js"), "console.log('loaded');").unwrap();
        for (id, body) in pages {
            fs::write(root.join("content").join(format!("{id}.txt")), body).unwrap();
        }

        let mut config = RunConfig::default();
        config.pages.first = 100;
        config.pages.last = last;
        config.pages.index = 100;
        config.paths.content_dir = root.join("content");
        config.paths.template = root.join("page.html");
        config.paths.stylesheet = root.join("shared.css");
        config.paths.script = root.join("shared.js");
        config.paths.output_dir = root.join("fragments");
        Self { _dir: dir, config }
    }

    fn output(&self) -> PathBuf {
        self.config.paths.output_dir.clone()
    }

    fn run(&self) -> (ConversionPipeline, RunReport) {
        let mut pipeline = ConversionPipeline::from_config(self.config.clone()).unwrap();
        let units = pipeline.load_content().unwrap();
        let report = pipeline.run(units).unwrap();
        (pipeline, report)
    }
}

fn published_files(dir: &Path) -> Vec<String> {
    if !dir.exists() {
        return vec![];
    }
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn id(raw: u32) -> PageId {
    PageId::new(raw).unwrap()
}

#[test]
fn invariant_cdata_round_trip() {
    let samples = ["", "plain", "]]>", "a]]>b]]>c", "]]]]>>", "tail]]", "]]>]]>"];
    for text in samples {
        let wrapped = format!("<![CDATA[{}]]>", escape_for_cdata(text));
        assert_eq!(unwrap_cdata(&wrapped).as_deref(), Some(text), "sample {text:?}");
    }
}

#[test]
fn invariant_valid_run_publishes_every_page() {
    let ws = Workspace::new(&[(100, "First."), (101, "Second."), (102, "Third.")], 102);
    let (pipeline, report) = ws.run();

    assert!(report.passed);
    assert_eq!(pipeline.state(), RunState::Published);
    assert_eq!(report.violations().count(), 0);
    assert_eq!(
        published_files(&ws.output()),
        vec!["page-100.xml", "page-101.xml", "page-102.xml"]
    );

    let xml = fs::read_to_string(ws.output().join("page-101.xml")).unwrap();
    assert!(xml.starts_with("<fragment><set-body><![CDATA[<!DOCTYPE html>"));
    assert!(xml.ends_with("]]></set-body></fragment>"));
}

#[test]
fn invariant_generation_is_idempotent() {
    let ws = Workspace::new(&[(100, "One ]]> two"), (101, "Three & four")], 101);
    let (_, first) = ws.run();
    let before: Vec<Vec<u8>> = published_files(&ws.output())
        .iter()
        .map(|f| fs::read(ws.output().join(f)).unwrap())
        .collect();

    let (_, second) = ws.run();
    let after: Vec<Vec<u8>> = published_files(&ws.output())
        .iter()
        .map(|f| fs::read(ws.output().join(f)).unwrap())
        .collect();

    assert!(first.passed && second.passed);
    assert_eq!(before, after);
    assert_eq!(first.digest, second.digest);
    assert_ne!(first.run_id, second.run_id);
}

#[test]
fn invariant_oversized_page_blocks_whole_run() {
    let huge = "word ".repeat(2_000);
    let mut ws = Workspace::new(
        &[(100, "Fine."), (101, &huge), (102, "<img src=x onerror=alert(1)>")],
        102,
    );
    ws.config.limits.max_fragment_bytes = 4_096;
    let (pipeline, report) = ws.run();

    assert!(!report.passed);
    assert_eq!(pipeline.state(), RunState::Aborted);
    assert!(!ws.output().exists());
    assert!(report.published.is_empty());

    let size = report
        .violations()
        .find(|v| v.rule == "fragment_size")
        .expect("size violation reported");
    assert_eq!(size.page, Some(id(101)));
    assert_eq!(size.layer, Layer::Schema);
    assert_eq!(size.expected.as_deref(), Some("<= 4096 bytes"));
    assert!(size.actual.as_deref().unwrap().ends_with(" bytes"));

    // The other page's problem is still in the same report.
    assert!(report
        .violations()
        .any(|v| v.rule == "event_handler" && v.page == Some(id(102))));
}

#[test]
fn invariant_boundary_navigation() {
    let pages: Vec<(u32, &str)> = (100..=104).map(|p| (p, "Body text.")).collect();
    let ws = Workspace::new(&pages, 104);
    let (_, report) = ws.run();
    assert!(report.passed);

    let read = |p: u32| fs::read_to_string(ws.output().join(format!("page-{p}.xml"))).unwrap();

    let first = read(100);
    assert!(first.contains(r#"nav-prev nav-disabled" aria-disabled="true""#));
    assert!(first.contains(r#"href="/page/101""#));

    let last = read(104);
    assert!(last.contains(r#"nav-next nav-disabled" aria-disabled="true""#));
    assert!(last.contains(r#"href="/page/103""#));
    assert!(!last.contains(r#"href="/page/105""#));

    for p in 101..=103 {
        let xml = read(p);
        assert!(xml.contains(&format!(r#"href="/page/{}">Previous"#, p - 1)), "page {p}");
        assert!(xml.contains(&format!(r#"href="/page/{}">Next"#, p + 1)), "page {p}");
        assert!(!xml.contains("nav-disabled"), "page {p}");
    }
}

#[test]
fn invariant_security_gate() {
    let ws = Workspace::new(
        &[(100, "Safe."), (101, "Look: <img src=x onerror=alert(1)>")],
        101,
    );
    let (_, report) = ws.run();

    assert!(!report.passed);
    assert!(published_files(&ws.output()).is_empty());

    let page = report
        .pages
        .iter()
        .find(|p| p.page == Some(id(101)))
        .unwrap();
    let security = page
        .validation
        .as_ref()
        .unwrap()
        .layer(Layer::Security)
        .unwrap();
    assert!(!security.passed);
    assert_eq!(security.violations[0].rule, "event_handler");
    assert!(security.violations[0].message.contains("onerror="));
}

#[test]
fn invariant_cross_page_completeness() {
    let ws = Workspace::new(&[(100, "a"), (101, "b"), (102, "c")], 103);
    let (_, report) = ws.run();

    assert!(!report.passed);
    assert!(published_files(&ws.output()).is_empty());

    let missing: Vec<_> = report
        .run_violations
        .iter()
        .filter(|v| v.rule == "missing_page")
        .collect();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].page, Some(id(103)));
    assert_eq!(missing[0].layer, Layer::Integration);
}

#[test]
fn invariant_two_files_for_one_page_block_publish() {
    let ws = Workspace::new(&[(100, "a"), (101, "b")], 101);
    fs::write(ws.config.paths.content_dir.join("0100.txt"), "again").unwrap();
    let (_, report) = ws.run();

    assert!(!report.passed);
    assert!(!ws.output().exists());
    let duplicate: Vec<_> = report
        .run_violations
        .iter()
        .filter(|v| v.rule == "duplicate_page")
        .collect();
    assert_eq!(duplicate.len(), 1);
    assert_eq!(duplicate[0].page, Some(id(100)));
    assert!(!report.run_violations.iter().any(|v| v.rule == "missing_page"));
}

#[test]
fn invariant_bad_content_is_reported_not_thrown() {
    let ws = Workspace::new(&[(100, "Good."), (101, "   ")], 101);
    fs::write(ws.config.paths.content_dir.join("102.txt"), [0xff, 0xfe, 0x00]).unwrap();
    let (_, report) = ws.run();

    assert!(!report.passed);
    let errors: Vec<_> = report.page_errors().collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().any(|(p, _)| p.page == Some(id(101))));
    assert!(errors.iter().any(|(p, _)| p.page == Some(id(102))));
    // The valid page still went through every layer.
    let good = report.pages.iter().find(|p| p.page == Some(id(100))).unwrap();
    assert_eq!(good.validation.as_ref().unwrap().layers.len(), 4);
    assert!(published_files(&ws.output()).is_empty());
}

#[test]
fn invariant_demo_site_builds() {
    let demo = Path::new(env!("CARGO_MANIFEST_DIR")).join("demo");
    let mut config = RunConfig::from_path(&demo.join("fragforge.toml")).unwrap();
    let out = tempfile::tempdir().unwrap();
    config.paths.output_dir = out.path().join("fragments");

    let mut pipeline = ConversionPipeline::from_config(config).unwrap();
    let units = pipeline.load_content().unwrap();
    let report = pipeline.check(units).unwrap();
    assert!(report.passed, "{:#?}", report.violations().collect::<Vec<_>>());
    assert_eq!(report.pages.len(), 5);
    assert!(!out.path().join("fragments").exists());
}

#[cfg(feature = "test-hooks")]
#[test]
fn invariant_publish_always_validates() {
    use fragforge_core::validation::{get_well_formed_check_count, reset_well_formed_check_count};

    reset_well_formed_check_count();
    let ws = Workspace::new(&[(100, "a"), (101, "b")], 101);
    let (_, report) = ws.run();
    assert!(report.passed);
    assert!(get_well_formed_check_count() >= 2);
}
