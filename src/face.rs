//! Optional local progress page. Harvest events are broadcast by the driver
//! and orchestrator and streamed to the browser over SSE.

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info};

pub type EventSender = broadcast::Sender<AgentEvent>;

/// Progress events of a harvest run.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    WorkItemStarted { index: usize, total: usize, url: String },
    Strategy { url: String, strategy: String },
    Thinking,
    Step { number: usize, description: String },
    StepError { message: String },
    Artifact { name: String, bytes: u64 },
    TaskComplete { summary: String },
    TaskError { message: String },
    BatchFinished { succeeded: usize, total: usize },
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::WorkItemStarted { .. } => "item",
            AgentEvent::Strategy { .. } => "strategy",
            AgentEvent::Thinking => "thinking",
            AgentEvent::Step { .. } => "step",
            AgentEvent::StepError { .. } => "step_error",
            AgentEvent::Artifact { .. } => "artifact",
            AgentEvent::TaskComplete { .. } => "task_complete",
            AgentEvent::TaskError { .. } => "task_error",
            AgentEvent::BatchFinished { .. } => "batch_finished",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            AgentEvent::WorkItemStarted { index, total, url } => {
                json!({"index": index, "total": total, "url": url})
            }
            AgentEvent::Strategy { url, strategy } => json!({"url": url, "strategy": strategy}),
            AgentEvent::Thinking => json!({}),
            AgentEvent::Step { number, description } => json!({"number": number, "description": description}),
            AgentEvent::StepError { message } | AgentEvent::TaskError { message } => {
                json!({"message": message})
            }
            AgentEvent::Artifact { name, bytes } => json!({"name": name, "bytes": bytes}),
            AgentEvent::TaskComplete { summary } => json!({"summary": summary}),
            AgentEvent::BatchFinished { succeeded, total } => json!({"succeeded": succeeded, "total": total}),
        }
    }

    fn to_sse_event(&self) -> Event {
        Event::default().event(self.name()).data(self.payload().to_string())
    }
}

/// Broadcast `event` if anyone is listening.
pub fn emit(events: Option<&EventSender>, event: AgentEvent) {
    if let Some(tx) = events {
        // No subscribers is not an error.
        let _ = tx.send(event);
    }
}

pub fn channel() -> EventSender {
    broadcast::channel::<AgentEvent>(256).0
}

/// Serve the progress page on the first free port in 3000..3010.
pub async fn start_server(event_tx: EventSender) -> Result<u16> {
    let state = Arc::new(event_tx);

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { axum::http::StatusCode::NO_CONTENT }))
        .with_state(state);

    let mut bound = None;
    for p in 3000..3010 {
        if let Ok(l) = tokio::net::TcpListener::bind(("127.0.0.1", p)).await {
            bound = Some((l, p));
            break;
        }
    }
    let (listener, port) = bound.context("no free port in 3000-3009 for the progress page")?;

    info!(url = %format!("http://localhost:{port}"), "progress page running");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "progress page server stopped");
        }
    });

    Ok(port)
}

async fn index_handler() -> Html<&'static str> {
    debug!("GET /");
    Html(INDEX_HTML)
}

async fn sse_handler(
    State(state): State<Arc<EventSender>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result: Result<AgentEvent, _>| match result {
        Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>OM Harvester</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    height: 100vh;
    display: flex;
    flex-direction: column;
  }
  header {
    padding: 24px 32px;
    border-bottom: 1px solid #1a1a2e;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 20px; font-weight: 600; color: #fff; }
  header .dot { width: 8px; height: 8px; border-radius: 50%; background: #f59e0b; }
  header .dot.idle { background: #22c55e; }
  #progress { margin-left: auto; font-size: 14px; color: #888; }
  #log {
    flex: 1;
    overflow-y: auto;
    max-width: 860px;
    width: 100%;
    margin: 0 auto;
    padding: 24px 32px;
    display: flex;
    flex-direction: column;
    gap: 8px;
  }
  .entry { padding: 10px 14px; border-radius: 8px; font-size: 14px; line-height: 1.5; }
  .entry.item { background: #1a1a2e; border-left: 3px solid #6366f1; font-weight: 600; }
  .entry.strategy { background: #111118; border-left: 3px solid #a855f7; }
  .entry.step { background: #111118; border-left: 3px solid #3b82f6; font-family: 'Fira Code', monospace; font-size: 13px; }
  .entry.step .num { color: #6366f1; font-weight: 700; margin-right: 8px; }
  .entry.artifact { background: #0a1a14; border-left: 3px solid #14b8a6; color: #5eead4; }
  .entry.error { background: #1a0a0a; border-left: 3px solid #ef4444; color: #fca5a5; }
  .entry.done { background: #0a1a0a; border-left: 3px solid #22c55e; color: #86efac; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="status-dot"></div>
    <h1>OM Harvester</h1>
    <span id="progress"></span>
  </header>
  <div id="log"></div>
<script>
  const log = document.getElementById('log');
  const dot = document.getElementById('status-dot');
  const progress = document.getElementById('progress');
  const esc = s => String(s).replace(/</g, '&lt;');

  function addEntry(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  }

  const es = new EventSource('/events');
  const on = (name, fn) => es.addEventListener(name, e => fn(JSON.parse(e.data)));

  on('item', d => {
    progress.textContent = d.index + ' / ' + d.total;
    addEntry('item', esc(d.url));
  });
  on('strategy', d => addEntry('strategy', 'Strategy: ' + esc(d.strategy)));
  on('step', d => addEntry('step', '<span class="num">Step ' + d.number + '</span>' + esc(d.description)));
  on('step_error', d => addEntry('error', '<strong>Step error:</strong> ' + esc(d.message)));
  on('artifact', d => addEntry('artifact', 'Saved ' + esc(d.name) + ' (' + Math.round(d.bytes / 1024) + ' KB)'));
  on('task_complete', d => addEntry('done', esc(d.summary)));
  on('task_error', d => addEntry('error', '<strong>Failed:</strong> ' + esc(d.message)));
  on('batch_finished', d => {
    dot.className = 'dot idle';
    addEntry('done', 'Batch finished: ' + d.succeeded + ' of ' + d.total + ' succeeded');
  });
</script>
</body>
</html>
"##;
