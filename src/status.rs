//! HTML status pages (spec.md §6 "Published HTML").
//!
//! Grounded on `GerritWorkItem.Write_HTML_Status`/`testresults_as_html`:
//! an overview page listing every in-flight and recently-retired build,
//! and a per-build page with the same table layout the original wrote to
//! disk as `results.html`. Served over HTTP instead of written to a
//! shared artifacts directory, since this crate already carries `axum`
//! for exactly that purpose.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{http::StatusCode, Router};
use indoc::formatdoc;
use log::info;
use tower_http::services::ServeDir;

use crate::orchestrator::Orchestrator;
use crate::work_item::{TestRecord, WorkItemState};

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn test_row_color(test: &TestRecord) -> &'static str {
    if !test.outcome.is_finished() {
        return "";
    }
    if test.outcome.is_failure() {
        "bgcolor=\"pink\""
    } else if test.outcome == crate::work_item::TestOutcome::Skipped {
        "bgcolor=\"yellow\""
    } else {
        "bgcolor=\"lightgreen\""
    }
}

/// Renders one test phase's table (grounded on `testresults_as_html`).
fn render_test_table(tests: &[TestRecord]) -> String {
    let mut sorted: Vec<&TestRecord> = tests.iter().collect();
    sorted.sort_by(|a, b| a.label().cmp(&b.label()));

    let mut out = String::from(
        "<table border=\"1\"><tr><th>Test</th><th>Status/results</th><th>Extra info</th></tr>",
    );
    for test in sorted {
        out.push_str("<tr><td>");
        out.push_str(&escape(&test.label()));
        out.push_str("</td><td ");
        out.push_str(test_row_color(test));
        out.push('>');

        if test.outcome.is_finished() {
            out.push_str(&escape(
                &test.status_message.clone().unwrap_or_else(|| test.outcome.to_string()),
            ));
        } else if test.results_dir.is_some() {
            out.push_str("Running");
        } else {
            out.push_str("Queued");
        }
        if !test.new_warnings.is_empty() {
            out.push_str(&format!(
                "<div style=\"background-color:red;\">{}</div>",
                escape(&test.new_warnings.join(", "))
            ));
        }
        out.push_str("</td><td>");
        if test.outcome.is_failure() {
            if !test.subtests.new_failures.is_empty() {
                out.push_str(&format!(
                    "<div style=\"background-color:red;\">{}</div>",
                    escape(&test.subtests.new_failures.join(" "))
                ));
            }
            if !test.subtests.known_failures.is_empty() {
                let known: Vec<String> = test
                    .subtests
                    .known_failures
                    .iter()
                    .map(|(name, count)| format!("{name} ({count})"))
                    .collect();
                out.push_str(&format!(
                    "<div style=\"background-color:yellow;\">{}</div>",
                    escape(&known.join(" "))
                ));
            }
        } else if !test.subtests.skipped.is_empty() {
            out.push_str(&escape(&test.subtests.skipped.join(" ")));
        }
        out.push_str("</td></tr>");
    }
    out.push_str("</table>");
    out
}

fn phase_heading(label: &str, started: bool, done: bool, error: bool, planned: bool) -> String {
    if !planned {
        return format!("<h3>{label}: Not planned</h3><p>");
    }
    if !started {
        return format!("<h3>{label}: Not started</h3><p>");
    }
    if !done {
        return format!("<h3>{label}: Running</h3><p>");
    }
    if error {
        format!("<h3>{label}: Failure</h3><p>")
    } else {
        format!("<h3>{label}: Success</h3><p>")
    }
}

/// Renders the per-build results page (grounded on `Write_HTML_Status`).
pub fn render_build_page(state: &WorkItemState, base_url: &str) -> String {
    let build_number = state.build_number.unwrap_or(0);
    let change_link = if state.change.branchwide {
        format!(
            "Tip of branch \"{}\" ({})",
            escape(&state.change.branch),
            escape(&state.change.revision)
        )
    } else {
        format!(
            "<a href=\"{}/{}\">change {} rev {}: {}</a>",
            base_url,
            state.change.change_number,
            state.change.change_number,
            escape(&state.change.revision),
            escape(&state.change.subject)
        )
    };

    let aborted_message = if state.flags.aborted {
        "<h1>This build was ABORTED, likely superseded by a newer revision. Results below will not progress further.</h1>"
    } else {
        ""
    };

    let build_status = if !state.flags.build_done {
        "Ongoing"
    } else if state.flags.build_error {
        "Failure"
    } else {
        "Success"
    };

    let mut build_info = String::new();
    for build in &state.distro_builds {
        build_info.push_str(&format!("<tr><td>{}</td><td>", escape(&build.distro)));
        if let Some(message) = &build.message {
            build_info.push_str(&escape(message));
        } else if build.started {
            build_info.push_str("Ongoing");
        } else {
            build_info.push_str("Waiting");
        }
        build_info.push_str("</td></tr>");
    }

    let initial_testing = phase_heading(
        "Initial testing",
        state.flags.initial_testing_started,
        state.flags.initial_testing_done,
        state.flags.initial_testing_error,
        !state.initial_tests.is_empty(),
    ) + &render_test_table(&state.initial_tests);

    let full_testing = phase_heading(
        "Comprehensive testing",
        state.flags.testing_started,
        state.flags.testing_done,
        state.flags.testing_error,
        !state.tests.is_empty(),
    ) + &render_test_table(&state.tests);

    formatdoc! {r#"
        <html>
        <head><title>Results for build #{build_number} {change}</title></head>
        <body>
        {aborted_message}
        <h2>Results for build #{build_number} {change}</h2>
        <h3>Overall build status: {build_status}</h3>
        <p><a href="/outputs/{build_number}/">Raw console logs and crash-analysis artifacts</a></p>
        <table border="1">
        <tr><th>Distro</th><th>details</th></tr>
        {build_info}
        </table>
        {initial_testing}
        {full_testing}
        </body>
        </html>
    "#,
        build_number = build_number,
        change = change_link,
        aborted_message = aborted_message,
        build_status = build_status,
        build_info = build_info,
        initial_testing = initial_testing,
        full_testing = full_testing,
    }
}

/// Renders the top-level overview listing in-flight and recently-retired
/// builds, linking to each one's own results page.
pub fn render_index(in_flight: &[WorkItemState], recent_done: &[WorkItemState]) -> String {
    let row = |state: &WorkItemState| {
        let build_number = state.build_number.unwrap_or(0);
        format!(
            "<tr><td><a href=\"/build/{build_number}\">{build_number}</a></td><td>{}</td><td>{}</td></tr>",
            escape(&state.change.subject),
            escape(&format!("{:?}", state.flags)),
        )
    };
    let in_flight_rows: String = in_flight.iter().map(row).collect();
    let done_rows: String = recent_done.iter().rev().map(row).collect();

    formatdoc! {r#"
        <html>
        <head><title>Build status</title></head>
        <body>
        <h2>In-flight builds</h2>
        <table border="1"><tr><th>Build</th><th>Change</th><th>Flags</th></tr>
        {in_flight_rows}
        </table>
        <h2>Recently retired builds</h2>
        <table border="1"><tr><th>Build</th><th>Change</th><th>Flags</th></tr>
        {done_rows}
        </table>
        </body>
        </html>
    "#}
}

async fn index_handler(State(orch): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let in_flight: Vec<WorkItemState> = orch
        .scheduler
        .in_flight()
        .iter()
        .map(|item| item.state.lock().clone())
        .collect();
    let recent_done = orch.store.recent_done();
    Html(render_index(&in_flight, &recent_done))
}

async fn build_handler(
    State(orch): State<Arc<Orchestrator>>,
    Path(build_number): Path<u64>,
) -> impl IntoResponse {
    if let Some(item) = orch
        .scheduler
        .in_flight()
        .into_iter()
        .find(|i| i.build_number() == Some(build_number))
    {
        let state = item.state.lock().clone();
        return Html(render_build_page(&state, &orch.config.http_base_url)).into_response();
    }
    if let Ok(Some(state)) = orch.store.load_done(build_number, 0) {
        return Html(render_build_page(&state, &orch.config.http_base_url)).into_response();
    }
    (StatusCode::NOT_FOUND, "no such build").into_response()
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let outputs = ServeDir::new(&orchestrator.config.outputs_dir);
    Router::new()
        .route("/", get(index_handler))
        .route("/build/:build_number", get(build_handler))
        .nest_service("/outputs", outputs)
        .with_state(orchestrator)
}

/// Binds and serves the status HTTP server forever (spec.md §6).
pub async fn serve(orchestrator: Arc<Orchestrator>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("status page listening on {addr}");
    axum::serve(listener, router(orchestrator)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_item::{BuildRecord, ChangeRecord, PhaseFlags, TestOutcome};
    use chrono::Utc;

    fn state() -> WorkItemState {
        WorkItemState {
            build_number: Some(7),
            change: ChangeRecord {
                change_number: 100,
                revision: "2".to_string(),
                branch: "master".to_string(),
                ref_spec: "refs/changes/100/100/2".to_string(),
                commit_message: "fix thing".to_string(),
                changed_files: vec![],
                branchwide: false,
                subject: "fix thing".to_string(),
            },
            distro_builds: vec![BuildRecord {
                distro: "centos7".to_string(),
                started: true,
                finished: true,
                failed: false,
                timeout: false,
                message: Some("ok".to_string()),
                stdout: None,
                stderr: None,
                annotations: vec![],
                retry_count: 0,
            }],
            initial_tests: vec![{
                let mut t = TestRecord::new("sanity", "sanity", "ldiskfs", 600);
                t.outcome = TestOutcome::Passed;
                t.results_dir = Some("/tmp/r".into());
                t
            }],
            tests: vec![],
            flags: PhaseFlags {
                build_done: true,
                initial_testing_started: true,
                initial_testing_done: true,
                ..PhaseFlags::default()
            },
            retest_iteration: 0,
            artifacts_dir: None,
            crash_ids_reported: vec![],
            created_at: Utc::now(),
            high_priority: false,
        }
    }

    #[test]
    fn build_page_reports_overall_success() {
        let html = render_build_page(&state(), "http://status");
        assert!(html.contains("Overall build status: Success"));
        assert!(html.contains("Initial testing: Success"));
        assert!(html.contains("sanity@ldiskfs"));
    }

    #[test]
    fn build_page_shows_aborted_banner() {
        let mut st = state();
        st.flags.aborted = true;
        let html = render_build_page(&st, "http://status");
        assert!(html.contains("ABORTED"));
    }

    #[test]
    fn index_lists_build_number_with_link() {
        let html = render_index(&[state()], &[]);
        assert!(html.contains("/build/7"));
    }

    #[test]
    fn failed_test_row_is_pink() {
        let mut st = state();
        st.initial_tests[0].outcome = TestOutcome::Failed;
        st.initial_tests[0].subtests.new_failures = vec!["sanity_1".to_string()];
        let html = render_build_page(&st, "http://status");
        assert!(html.contains("bgcolor=\"pink\""));
        assert!(html.contains("sanity_1"));
    }
}
