mod common;

use common::{MockBrowser, MockFetcher, MockSite, ScriptedPlanners, click, done};
use om_harvester::scout::{ScoutEstimate, ScoutEstimator, parse_count};
use om_harvester::usage::PlannerRole;
use std::sync::Arc;
use std::sync::atomic::Ordering;

const URL: &str = "https://www.levyretail.com/listing/bay-plaza";

fn estimator(browser: &Arc<MockBrowser>, planners: &Arc<ScriptedPlanners>) -> ScoutEstimator {
    ScoutEstimator::new(browser.clone(), planners.clone(), Arc::new(MockFetcher::new()), 6)
}

#[test]
fn parser_takes_the_first_number() {
    assert_eq!(parse_count("2"), ScoutEstimate::Count(2));
    assert_eq!(parse_count(" 0 "), ScoutEstimate::Count(0));
    assert_eq!(parse_count("There are 4 OM buttons (2 hidden)"), ScoutEstimate::Count(4));
    assert_eq!(parse_count("two"), ScoutEstimate::Unknown);
    assert_eq!(parse_count("I could not tell"), ScoutEstimate::Unknown);
}

#[tokio::test]
async fn declared_count_is_returned_and_context_released() {
    let browser = Arc::new(MockBrowser::new());
    let planners = Arc::new(ScriptedPlanners::new().scout(vec![done("3")]));

    let report = estimator(&browser, &planners).estimate(URL).await;

    assert_eq!(report.estimate, ScoutEstimate::Count(3));
    assert_eq!(report.steps_taken, 1);
    assert_eq!(planners.created(PlannerRole::Scout), 1);
    let opened = browser.opened();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].download_dir.is_none(), "scout contexts never download");
    assert_eq!(browser.closed(), 1);
}

#[tokio::test]
async fn scout_cannot_click() {
    let browser = Arc::new(MockBrowser::new().site(URL, MockSite::new().download_on("[e0]", "om.pdf")));
    let planners = Arc::new(ScriptedPlanners::new().scout(vec![click("[e0]"), done("1")]));

    let report = estimator(&browser, &planners).estimate(URL).await;

    assert_eq!(report.estimate, ScoutEstimate::Count(1));
    assert!(!browser.log().iter().any(|l| l.starts_with("click")));
}

#[tokio::test]
async fn no_answer_within_budget_is_unknown() {
    let browser = Arc::new(MockBrowser::new());
    let planners = Arc::new(ScriptedPlanners::new().scout(Vec::new()));

    let report = estimator(&browser, &planners).estimate(URL).await;

    // The empty script makes the planner fail on its first call.
    assert_eq!(report.estimate, ScoutEstimate::Unknown);
    assert_eq!(planners.scout_calls.load(Ordering::SeqCst), 1);
    assert_eq!(browser.closed(), 1);
}

#[tokio::test]
async fn context_that_fails_to_open_is_unknown() {
    let browser = Arc::new(MockBrowser::failing());
    let planners = Arc::new(ScriptedPlanners::new().scout(vec![done("5")]));

    let report = estimator(&browser, &planners).estimate(URL).await;

    assert_eq!(report.estimate, ScoutEstimate::Unknown);
    assert_eq!(planners.created(PlannerRole::Scout), 0);
}

#[tokio::test]
async fn usage_is_reported() {
    let browser = Arc::new(MockBrowser::new());
    let planners = Arc::new(ScriptedPlanners::new().scout(vec![click("[e1]"), done("2")]));

    let report = estimator(&browser, &planners).estimate(URL).await;

    assert_eq!(report.usage.input, 2 * common::PER_CALL.input);
    assert_eq!(report.steps_taken, 2);
}
