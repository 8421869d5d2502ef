mod common;

use common::{MockBrowser, MockFetcher, MockSite, ScriptedPlanner, StalledPlanner, click, custom, done, fill, pdf_bytes};
use om_harvester::capability::{CapabilityFactory, ContextSpec, PageCapability};
use om_harvester::capture::DocumentFetcher;
use om_harvester::detector::{CompletionDetector, StopReason};
use om_harvester::driver::{AgentDriver, DriverOutcome, RunState};
use om_harvester::error::RunError;
use om_harvester::sink::{DownloadSink, DownloadSource};
use om_harvester::types::{CAPTURE_PDF_TAB, DOWNLOAD_PDF};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const URL: &str = "https://www.cegadvisors.com/property/kearny-square/";

struct Harness {
    _tmp: tempfile::TempDir,
    page: Box<dyn PageCapability>,
    sink: DownloadSink,
    detector: CompletionDetector,
}

/// A harvest context already on `URL`, wired to a fresh sink.
async fn harness(browser: &MockBrowser, expected: usize) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let bucket = tmp.path().join("cegadvisors");
    std::fs::create_dir_all(&bucket).unwrap();

    let mut page = browser
        .open(&ContextSpec::harvest("test", bucket.clone()))
        .await
        .unwrap();
    let mut sink = DownloadSink::new(bucket);
    page.subscribe_downloads(sink.subscribe());
    page.navigate(URL).await.unwrap();
    let tabs = page.list_tabs().await.unwrap();
    let detector = CompletionDetector::new(expected, sink.mark(), &tabs);
    Harness {
        _tmp: tmp,
        page,
        sink,
        detector,
    }
}

async fn drive(
    h: &mut Harness,
    planner: ScriptedPlanner,
    fetcher: Arc<dyn DocumentFetcher>,
    cap: usize,
) -> DriverOutcome {
    let mut driver = AgentDriver::new(Box::new(planner), fetcher).with_post_action_wait(Duration::from_millis(2500));
    driver
        .run("download the OM", h.page.as_mut(), &mut h.sink, &mut h.detector, cap)
        .await
}

#[tokio::test(start_paused = true)]
async fn single_download_stops_right_after_the_submit() {
    let browser = MockBrowser::new().site(URL, MockSite::new().download_on("[e5]", "Kearny-Square-OM.pdf"));
    let mut h = harness(&browser, 1).await;
    let planner = ScriptedPlanner::new(vec![
        click("[e0]"),
        fill("[e1]", "John Doe"),
        fill("[e2]", "johndoe@email.com"),
        fill("[e3]", "555-123-4567"),
        fill("[e4]", "Real Estate Investments LLC"),
        click("[e5]"),
        done("downloaded"),
        click("[e5]"),
    ]);
    let calls = planner.calls();

    let out = drive(&mut h, planner, Arc::new(MockFetcher::new()), 12).await;

    assert_eq!(out.state, RunState::Succeeded(StopReason::TargetReached(1)));
    assert_eq!(out.steps_taken(), 6);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert!(out.planner_calls <= out.steps.last().unwrap().index);
    assert_eq!(h.sink.artifact_paths().len(), 1);
    let clicks = browser.log().iter().filter(|l| *l == "click [e5]").count();
    assert_eq!(clicks, 1, "the download button is never clicked twice");
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_without_downloads() {
    let browser = MockBrowser::new();
    let mut h = harness(&browser, 1).await;
    let planner = ScriptedPlanner::repeating(click("[e7]"));
    let calls = planner.calls();

    let out = drive(&mut h, planner, Arc::new(MockFetcher::new()), 4).await;

    assert_eq!(out.state, RunState::BudgetExhausted { cap: 4 });
    assert_eq!(out.steps_taken(), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.sink.events().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn batch_stops_at_the_expected_count() {
    let site = MockSite::new()
        .download_on("[e1]", "a.pdf")
        .download_on("[e2]", "b.pdf")
        .download_on("[e3]", "c.pdf")
        .download_on("[e4]", "d.pdf");
    let browser = MockBrowser::new().site(URL, site);
    let mut h = harness(&browser, 3).await;
    let planner = ScriptedPlanner::new(vec![click("[e1]"), click("[e2]"), click("[e3]"), click("[e4]")]);
    let calls = planner.calls();

    let out = drive(&mut h, planner, Arc::new(MockFetcher::new()), 30).await;

    assert_eq!(out.state, RunState::Succeeded(StopReason::TargetReached(3)));
    assert_eq!(out.steps_taken(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!browser.log().contains(&"click [e4]".to_string()));
}

#[tokio::test(start_paused = true)]
async fn declaration_stops_even_without_artifacts() {
    let browser = MockBrowser::new();
    let mut h = harness(&browser, 1).await;
    let planner = ScriptedPlanner::new(vec![click("[e0]"), done("no download available"), click("[e0]")]);

    let out = drive(&mut h, planner, Arc::new(MockFetcher::new()), 12).await;

    assert_eq!(
        out.state,
        RunState::Succeeded(StopReason::Declared("no download available".into()))
    );
    assert_eq!(out.steps_taken(), 2);
    assert_eq!(out.planner_calls, 2);
}

#[tokio::test(start_paused = true)]
async fn capability_error_halts_without_retry() {
    let browser = MockBrowser::new().site(
        URL,
        MockSite::new().fail_on("[e0]", om_harvester::error::PageError::Timeout("frame detached".into())),
    );
    let mut h = harness(&browser, 1).await;
    let planner = ScriptedPlanner::repeating(click("[e0]"));
    let calls = planner.calls();

    let out = drive(&mut h, planner, Arc::new(MockFetcher::new()), 12).await;

    assert!(matches!(out.state, RunState::Failed(RunError::Capability(_))));
    assert_eq!(out.steps_taken(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn inapplicable_actions_are_reported_back() {
    let browser = MockBrowser::new().site(
        URL,
        MockSite::new().missing("[e9]").download_on("[e0]", "om.pdf"),
    );
    let mut h = harness(&browser, 1).await;
    let planner = ScriptedPlanner::new(vec![click("[e9]"), click("[e0]")]);
    let observations = planner.observations();

    let out = drive(&mut h, planner, Arc::new(MockFetcher::new()), 12).await;

    assert_eq!(out.state, RunState::Succeeded(StopReason::TargetReached(1)));
    assert_eq!(out.steps_taken(), 2);
    let seen = observations.lock().unwrap();
    // Initial page, then the state after the failed click.
    assert_eq!(seen.len(), 2);
    assert!(seen[0].error.is_none());
    assert!(seen[1].error.as_deref().unwrap().contains("[e9]"));
}

#[tokio::test(start_paused = true)]
async fn unknown_custom_action_is_not_fatal() {
    let browser = MockBrowser::new();
    let mut h = harness(&browser, 1).await;
    let planner = ScriptedPlanner::new(vec![custom("solve_captcha", serde_json::Value::Null), done("gave up")]);

    let out = drive(&mut h, planner, Arc::new(MockFetcher::new()), 12).await;

    assert!(matches!(out.state, RunState::Succeeded(StopReason::Declared(_))));
    assert_eq!(out.steps_taken(), 2);
}

#[tokio::test(start_paused = true)]
async fn new_pdf_tab_is_captured_by_direct_fetch() {
    let pdf_url = "https://www.cegadvisors.com/wp-content/uploads/Kearny-Square-OM.pdf";
    let browser = MockBrowser::new().site(URL, MockSite::new().popup_on("[e0]", pdf_url));
    let fetcher = Arc::new(MockFetcher::new().respond(pdf_url, 200, pdf_bytes(4096)));
    let mut h = harness(&browser, 1).await;
    let planner = ScriptedPlanner::new(vec![click("[e0]"), click("[e0]")]);

    let out = drive(&mut h, planner, fetcher.clone(), 12).await;

    assert_eq!(out.state, RunState::Succeeded(StopReason::TargetReached(1)));
    assert_eq!(out.steps_taken(), 1);
    let events = h.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source, DownloadSource::DirectFetch);
    assert_eq!(events[0].source_url.as_deref(), Some(pdf_url));
    assert!(events[0].saved_path.exists());
    assert!(browser.log().iter().any(|l| l.starts_with("switch")));
}

#[tokio::test(start_paused = true)]
async fn blocked_direct_fetch_falls_back_to_the_page_buffer() {
    let pdf_url = "https://www.cegadvisors.com/files/om.pdf";
    let browser = MockBrowser::new()
        .site(URL, MockSite::new().popup_on("[e0]", pdf_url))
        .in_page_body(pdf_url, pdf_bytes(8192));
    let fetcher = Arc::new(MockFetcher::new().respond(pdf_url, 403, b"<html>Just a moment...</html>".to_vec()));
    let mut h = harness(&browser, 1).await;
    let planner = ScriptedPlanner::new(vec![click("[e0]")]);

    let out = drive(&mut h, planner, fetcher, 12).await;

    assert_eq!(out.state, RunState::Succeeded(StopReason::TargetReached(1)));
    assert_eq!(h.sink.events()[0].source, DownloadSource::BufferExtraction);
}

#[tokio::test(start_paused = true)]
async fn tiny_page_buffers_are_not_documents() {
    let pdf_url = "https://www.cegadvisors.com/files/om.pdf";
    let browser = MockBrowser::new()
        .site(URL, MockSite::new().popup_on("[e0]", pdf_url))
        .in_page_body(pdf_url, pdf_bytes(200));
    let mut h = harness(&browser, 1).await;
    let planner = ScriptedPlanner::new(vec![click("[e0]"), done("stuck")]);
    let observations = planner.observations();

    let out = drive(&mut h, planner, Arc::new(MockFetcher::new()), 12).await;

    assert!(matches!(out.state, RunState::Succeeded(StopReason::Declared(_))));
    assert!(h.sink.events().is_empty());
    let seen = observations.lock().unwrap();
    assert!(seen[1].notes.iter().any(|n| n.contains("not a PDF")));
}

#[tokio::test(start_paused = true)]
async fn download_pdf_action_captures_the_given_url() {
    let pdf_url = "https://www.cegadvisors.com/wp-content/uploads/flyer.pdf";
    let browser = MockBrowser::new();
    let fetcher = Arc::new(MockFetcher::new().respond(pdf_url, 200, pdf_bytes(2048)));
    let mut h = harness(&browser, 1).await;
    let planner = ScriptedPlanner::new(vec![custom(DOWNLOAD_PDF, serde_json::json!({ "url": pdf_url }))]);

    let out = drive(&mut h, planner, fetcher, 12).await;

    assert_eq!(out.state, RunState::Succeeded(StopReason::TargetReached(1)));
    assert_eq!(h.sink.events()[0].suggested_name, "flyer.pdf");
}

#[tokio::test(start_paused = true)]
async fn capture_pdf_tab_without_pdf_tab_is_not_applicable() {
    let browser = MockBrowser::new();
    let mut h = harness(&browser, 1).await;
    let planner = ScriptedPlanner::new(vec![custom(CAPTURE_PDF_TAB, serde_json::json!({})), done("none")]);
    let observations = planner.observations();

    let out = drive(&mut h, planner, Arc::new(MockFetcher::new()), 12).await;

    assert_eq!(out.steps_taken(), 2);
    let seen = observations.lock().unwrap();
    assert!(seen[1].error.as_deref().unwrap().contains("no open tab shows a PDF"));
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_a_stalled_planner() {
    let browser = MockBrowser::new();
    let mut h = harness(&browser, 1).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        trigger.cancel();
    });

    let mut driver = AgentDriver::new(Box::new(StalledPlanner), Arc::new(MockFetcher::new())).with_cancel(cancel);
    let out = driver
        .run("download the OM", h.page.as_mut(), &mut h.sink, &mut h.detector, 12)
        .await;

    assert_eq!(out.state, RunState::Failed(RunError::Cancelled));
    assert_eq!(out.steps_taken(), 0);
}

#[tokio::test(start_paused = true)]
async fn batch_of_same_named_documents_reaches_its_target() {
    let a = "https://www.cegadvisors.com/kearny/OM.pdf";
    let b = "https://www.cegadvisors.com/mission/OM.pdf";
    let browser = MockBrowser::new();
    let fetcher = Arc::new(
        MockFetcher::new()
            .respond(a, 200, pdf_bytes(2048))
            .respond(b, 200, pdf_bytes(4096)),
    );
    let mut h = harness(&browser, 2).await;
    let planner = ScriptedPlanner::new(vec![
        custom(DOWNLOAD_PDF, serde_json::json!({ "url": a })),
        custom(DOWNLOAD_PDF, serde_json::json!({ "url": b })),
    ]);

    let out = drive(&mut h, planner, fetcher, 30).await;

    assert_eq!(out.state, RunState::Succeeded(StopReason::TargetReached(2)));
    let events = h.sink.events();
    assert_eq!(events.len(), 2);
    assert_ne!(events[0].saved_path, events[1].saved_path);
    assert_eq!(std::fs::metadata(&events[0].saved_path).unwrap().len(), 2048);
    assert_eq!(std::fs::metadata(&events[1].saved_path).unwrap().len(), 4096);
}
