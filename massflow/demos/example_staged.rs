//! A four stage frame against a running MASS service.
//!
//! ```text
//! MASS_BASE_URL=http://127.0.0.1:8000/api/ MASS_API_KEY=... \
//! MASS_INSTANCE_URL=http://127.0.0.1:8000/api/analysis_system_instance/<uuid>/ \
//! cargo run --example example_staged
//! ```

use anyhow::Context;
use massflow::prelude::*;
use serde_json::{json, Map};
use std::sync::Arc;

fn tagger(sockets: AsyncSockets) -> impl std::future::Future<Output = StageResult> {
    async move {
        let mut payload = sockets.receive().await?;
        payload.envelope_mut().report_tags(["one", "two"]);
        sockets.send_to(payload, "example_stage_sync").await?;
        Ok(())
    }
}

fn summarize(sockets: &mut SyncSockets) -> StageResult {
    let mut payload = sockets.receive()?;
    let mut report = Map::new();
    report.insert("three".to_string(), json!("four"));
    payload
        .envelope_mut()
        .report_json(&*sockets, report, Some("new_report"), true);
    sockets.send_to(payload, "report")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging(&LogConfig::default())?;

    let client_config = ClientConfig::from_env()?;
    let instance_url =
        std::env::var("MASS_INSTANCE_URL").context("MASS_INSTANCE_URL must name an analysis system instance")?;

    let connections = Arc::new(ConnectionRegistry::new());
    let connection = connections.register("default", &client_config)?;

    let source = Arc::new(HttpRequestFeed::new(connection.clone(), instance_url).into_work_source());
    let sink = Arc::new(HttpReportSink::new(connection));

    let mut frame = AnalysisFrame::new(FrameConfig::from_env()?)?;
    frame
        .add_sync_stage(
            "requests",
            StageOptions::new().with_next_stage("example_stage_async"),
            get_requests(source),
        )?
        .add_async_stage("example_stage_async", StageOptions::new(), tagger)?
        .add_sync_stage("example_stage_sync", StageOptions::new(), summarize)?
        .add_sync_stage("report", StageOptions::new().with_replicas(3), report(sink))?;

    frame.start_all_stages()?;
    Ok(())
}
