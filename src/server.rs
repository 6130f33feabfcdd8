use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::error::AutomationError;
use crate::scheduler::TaskScheduler;
use crate::store::{StatusCounts, TaskLogEntry};
use crate::task::{NewTask, Task, TaskStatus};

/// Events streamed to the dashboard via SSE.
#[derive(Clone, Debug)]
pub enum RunnerEvent {
    Queued { id: Uuid, description: String },
    Started { id: Uuid, description: String },
    Completed { id: Uuid, summary: String },
    Retrying { id: Uuid, attempt: u32, max: u32 },
    Failed { id: Uuid, message: String },
}

impl RunnerEvent {
    fn to_sse_event(&self) -> Event {
        match self {
            RunnerEvent::Queued { id, description } => Event::default().event("queued").data(
                format!(
                    "{{\"id\":\"{}\",\"description\":{}}}",
                    id,
                    serde_json::json!(description)
                ),
            ),
            RunnerEvent::Started { id, description } => Event::default().event("started").data(
                format!(
                    "{{\"id\":\"{}\",\"description\":{}}}",
                    id,
                    serde_json::json!(description)
                ),
            ),
            RunnerEvent::Completed { id, summary } => Event::default().event("completed").data(
                format!(
                    "{{\"id\":\"{}\",\"summary\":{}}}",
                    id,
                    serde_json::json!(summary)
                ),
            ),
            RunnerEvent::Retrying { id, attempt, max } => Event::default().event("retrying").data(
                format!("{{\"id\":\"{}\",\"attempt\":{},\"max\":{}}}", id, attempt, max),
            ),
            RunnerEvent::Failed { id, message } => Event::default().event("failed").data(format!(
                "{{\"id\":\"{}\",\"message\":{}}}",
                id,
                serde_json::json!(message)
            )),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<TaskScheduler>,
    pub event_tx: broadcast::Sender<RunnerEvent>,
}

/// JSON error responses for the task API.
pub struct ApiError(AutomationError);

impl From<AutomationError> for ApiError {
    fn from(err: AutomationError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AutomationError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            AutomationError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AutomationError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/tasks", post(create_task_handler).get(list_tasks_handler))
        .route("/tasks/{id}", get(get_task_handler))
        .route("/tasks/{id}/logs", get(task_logs_handler))
        .route("/tasks/{id}/cancel", post(cancel_task_handler))
        .route("/stats", get(stats_handler))
        .route("/events", get(sse_handler))
        .route(
            "/favicon.ico",
            get(|| async { StatusCode::NO_CONTENT }),
        ) // Silence 404
        .with_state(state)
}

/// Bind the dashboard on the first free port in `port..port + 10` and serve
/// in the background. Returns the port actually bound.
pub async fn start(state: Arc<AppState>, port: u16) -> crate::error::Result<u16> {
    let app = router(state);

    let mut listener = None;
    let mut bound = port;
    for p in port..port.saturating_add(10) {
        match tokio::net::TcpListener::bind(("127.0.0.1", p)).await {
            Ok(l) => {
                listener = Some(l);
                bound = p;
                break;
            }
            Err(_) => continue,
        }
    }
    let listener = listener.ok_or_else(|| {
        AutomationError::Config(format!(
            "could not bind any port in {port}..{}",
            port.saturating_add(10)
        ))
    })?;

    tracing::info!("dashboard running at http://localhost:{bound}");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(%err, "dashboard server exited");
        }
    });

    Ok(bound)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn create_task_handler(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state.scheduler.create_task(new).await?;
    let _ = state.event_tx.send(RunnerEvent::Queued {
        id: task.id,
        description: task.description.clone(),
    });
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<TaskStatus>,
    limit: Option<usize>,
}

async fn list_tasks_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = state
        .scheduler
        .list_tasks(query.status, query.limit.unwrap_or(100))
        .await?;
    Ok(Json(tasks))
}

async fn get_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.scheduler.get_task(id).await?))
}

async fn task_logs_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TaskLogEntry>>, ApiError> {
    Ok(Json(state.scheduler.task_logs(id).await?))
}

async fn cancel_task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.scheduler.cancel_task(id).await?))
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusCounts>, ApiError> {
    Ok(Json(state.scheduler.stats().await?))
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<RunnerEvent, _>| match result {
            Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
            Err(_) => None,
        });
    Sse::new(stream)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>webpilot</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    min-height: 100vh;
    display: flex;
    flex-direction: column;
  }
  header {
    padding: 20px 32px;
    border-bottom: 1px solid #1a1a2e;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 20px; font-weight: 600; color: #fff; }
  header .dot {
    width: 8px; height: 8px;
    border-radius: 50%;
    background: #22c55e;
    animation: pulse 2s infinite;
  }
  header .dot.busy { background: #f59e0b; }
  @keyframes pulse { 0%, 100% { opacity: 1; } 50% { opacity: 0.4; } }
  .main {
    flex: 1;
    max-width: 960px;
    width: 100%;
    margin: 0 auto;
    padding: 24px 32px;
    display: flex;
    flex-direction: column;
    gap: 20px;
  }
  .stats { display: flex; gap: 12px; }
  .stat {
    flex: 1;
    background: #111118;
    border: 1px solid #1a1a2e;
    border-radius: 8px;
    padding: 10px 14px;
    text-align: center;
  }
  .stat .n { font-size: 22px; font-weight: 700; color: #6366f1; }
  .stat .l { font-size: 12px; color: #888; }
  form {
    background: #111118;
    border: 1px solid #1a1a2e;
    border-radius: 8px;
    padding: 16px;
    display: grid;
    grid-template-columns: 1fr 1fr;
    gap: 10px;
  }
  form input, form select, form textarea {
    background: #0a0a0f;
    border: 1px solid #222;
    border-radius: 6px;
    padding: 9px 12px;
    color: #fff;
    font-size: 14px;
    outline: none;
  }
  form input:focus, form textarea:focus { border-color: #6366f1; }
  form textarea { grid-column: span 2; font-family: monospace; min-height: 64px; }
  form button {
    grid-column: span 2;
    background: #6366f1;
    color: #fff;
    border: none;
    border-radius: 6px;
    padding: 10px;
    font-size: 14px;
    font-weight: 600;
    cursor: pointer;
  }
  form button:hover { background: #4f46e5; }
  table { width: 100%; border-collapse: collapse; font-size: 13px; }
  th, td { text-align: left; padding: 8px 10px; border-bottom: 1px solid #1a1a2e; }
  th { color: #888; font-weight: 600; }
  .badge { padding: 2px 8px; border-radius: 10px; font-size: 12px; font-weight: 600; }
  .badge.pending, .badge.scheduled { background: #3a2e05; color: #fcd34d; }
  .badge.running { background: #0a1a2e; color: #93c5fd; }
  .badge.completed { background: #0a1a0a; color: #86efac; }
  .badge.failed { background: #1a0a0a; color: #fca5a5; }
  .badge.cancelled { background: #1a1a1a; color: #999; }
  #log {
    display: flex;
    flex-direction: column;
    gap: 6px;
    max-height: 240px;
    overflow-y: auto;
  }
  .entry {
    padding: 8px 12px;
    border-radius: 6px;
    font-size: 13px;
    background: #111118;
    border-left: 3px solid #3b82f6;
    animation: fadeIn 0.2s ease;
  }
  @keyframes fadeIn { from { opacity: 0; transform: translateY(4px); } to { opacity: 1; } }
  .entry.error { border-left-color: #ef4444; color: #fca5a5; }
  .entry.done { border-left-color: #22c55e; color: #86efac; }
  .entry.retry { border-left-color: #f59e0b; color: #fcd34d; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="status-dot"></div>
    <h1>webpilot</h1>
  </header>
  <div class="main">
    <div class="stats" id="stats"></div>
    <form id="create">
      <input id="url" type="url" placeholder="https://target.example.com" required />
      <select id="priority">
        <option value="low">low</option>
        <option value="medium" selected>medium</option>
        <option value="high">high</option>
        <option value="urgent">urgent</option>
      </select>
      <input id="description" type="text" placeholder="What this task does" required />
      <select id="type">
        <option value="form_fill">form_fill</option>
        <option value="extract" selected>extract</option>
        <option value="click">click</option>
        <option value="upload">upload</option>
      </select>
      <textarea id="payload">{"selectors": ["h1"]}</textarea>
      <button type="submit">Queue task</button>
    </form>
    <div id="log"></div>
    <table>
      <thead><tr><th>Task</th><th>Type</th><th>Priority</th><th>Status</th><th>Retries</th></tr></thead>
      <tbody id="tasks"></tbody>
    </table>
  </div>
<script>
  const log = document.getElementById('log');
  const dot = document.getElementById('status-dot');
  const examples = {
    form_fill: '{"fields": {"email": "a@b.com"}, "submit": true}',
    extract: '{"selectors": ["h1"]}',
    click: '{"selectors": ["#accept"], "wait_between_ms": 1000}',
    upload: '{"files": ["/tmp/report.pdf"]}',
  };

  document.getElementById('type').addEventListener('change', e => {
    document.getElementById('payload').value = examples[e.target.value];
  });

  function addEntry(cls, text) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.textContent = text;
    log.prepend(div);
    while (log.children.length > 50) log.removeChild(log.lastChild);
  }

  async function refresh() {
    const stats = await (await fetch('/stats')).json();
    document.getElementById('stats').innerHTML = Object.entries(stats)
      .map(([k, v]) => '<div class="stat"><div class="n">' + v + '</div><div class="l">' + k + '</div></div>')
      .join('');
    const tasks = await (await fetch('/tasks?limit=25')).json();
    document.getElementById('tasks').innerHTML = tasks.map(t =>
      '<tr><td>' + t.description.replace(/</g, '&lt;') + '</td><td>' + t.payload.type +
      '</td><td>' + t.priority + '</td><td><span class="badge ' + t.status + '">' + t.status +
      '</span></td><td>' + t.retry_count + '/' + t.max_retries + '</td></tr>').join('');
    dot.className = stats.running > 0 ? 'dot busy' : 'dot';
  }

  document.getElementById('create').addEventListener('submit', async e => {
    e.preventDefault();
    let payload;
    try {
      payload = JSON.parse(document.getElementById('payload').value);
    } catch {
      addEntry('error', 'Payload is not valid JSON');
      return;
    }
    payload.type = document.getElementById('type').value;
    const resp = await fetch('/tasks', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({
        url: document.getElementById('url').value,
        description: document.getElementById('description').value,
        priority: document.getElementById('priority').value,
        payload,
      }),
    });
    if (!resp.ok) {
      const body = await resp.json();
      addEntry('error', 'Create failed: ' + body.error);
    }
    refresh();
  });

  const es = new EventSource('/events');
  es.addEventListener('queued', e => {
    addEntry('', 'Queued: ' + JSON.parse(e.data).description);
    refresh();
  });
  es.addEventListener('started', e => {
    addEntry('', 'Running: ' + JSON.parse(e.data).description);
    refresh();
  });
  es.addEventListener('completed', e => {
    addEntry('done', 'Done: ' + JSON.parse(e.data).summary);
    refresh();
  });
  es.addEventListener('retrying', e => {
    const d = JSON.parse(e.data);
    addEntry('retry', 'Retrying (' + d.attempt + '/' + d.max + ')');
    refresh();
  });
  es.addEventListener('failed', e => {
    addEntry('error', 'Failed: ' + JSON.parse(e.data).message);
    refresh();
  });

  refresh();
  setInterval(refresh, 5000);
</script>
</body>
</html>
"##;
