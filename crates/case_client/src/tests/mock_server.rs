//! In-process case server used by transport, session and event tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use shared::{
    domain::{EvidenceId, MessageId, MessageRole, PublicId, SessionRowId, SessionStatus},
    error::{ApiError, ErrorCode},
    protocol::{
        AccusationResult, AccuseRequest, ChatAck, ChatMessage, ChatRequest, Clock, Evidence,
        InvestigateResult, JobAccepted, MoveRequest, MoveResult, QuestionBudget, Session,
    },
};
use tokio::{net::TcpListener, sync::Mutex};

type ApiFailure = (StatusCode, Json<ApiError>);

pub(crate) struct MockGame {
    pub session: Session,
    pub killer: String,
    pub evidence_by_location: HashMap<String, Vec<Evidence>>,
    pub move_cost: u32,
    pub question_cost: u32,
    pub investigate_cost: u32,
    /// Re-reports and re-records evidence that was already found.
    pub sloppy_evidence: bool,
    pub required_token: Option<String>,
    pub job_public_id: PublicId,
    pub create_job_failure: Option<(StatusCode, String)>,
    /// One script per websocket connection; each connection sends its frames
    /// and then closes. Once exhausted, connections stay open silently.
    pub ws_scripts: VecDeque<Vec<String>>,
    pub calls: HashMap<&'static str, u32>,
}

impl MockGame {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            killer: "Butler Kim".into(),
            evidence_by_location: HashMap::new(),
            move_cost: 15,
            question_cost: 5,
            investigate_cost: 10,
            sloppy_evidence: false,
            required_token: None,
            job_public_id: PublicId::new("abc"),
            create_job_failure: None,
            ws_scripts: VecDeque::new(),
            calls: HashMap::new(),
        }
    }

    pub fn with_evidence(mut self, location: &str, items: Vec<Evidence>) -> Self {
        self.evidence_by_location.insert(location.to_string(), items);
        self
    }

    fn record(&mut self, route: &'static str) {
        *self.calls.entry(route).or_default() += 1;
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiFailure> {
        let Some(required) = &self.required_token else {
            return Ok(());
        };
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if presented == Some(format!("Bearer {required}").as_str()) {
            Ok(())
        } else {
            Err(failure(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized, "token expired"))
        }
    }

    fn ensure_active(&self) -> Result<(), ApiFailure> {
        if self.session.status.is_terminal() {
            return Err(failure(
                StatusCode::CONFLICT,
                ErrorCode::Conflict,
                "session is not active",
            ));
        }
        Ok(())
    }

    fn spend(&mut self, minutes: u32) {
        self.session.clock.minutes_used += minutes;
        if self.session.clock.remaining_minutes() == 0 {
            self.session.status = SessionStatus::Closed;
        }
    }

    fn push_message(&mut self, role: MessageRole, content: String) {
        let id = MessageId(self.session.messages.len() as i64 + 1);
        self.session.messages.push(ChatMessage {
            id,
            role,
            content,
            created_at: Utc::now(),
        });
    }
}

#[derive(Clone)]
pub(crate) struct MockServer {
    pub url: String,
    pub game: Arc<Mutex<MockGame>>,
}

impl MockServer {
    pub async fn spawn(game: MockGame) -> Result<Self> {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let game = Arc::new(Mutex::new(game));
        let app = Router::new()
            .route("/sessions", post(create_session))
            .route("/sessions/:public_id", get(fetch_session))
            .route("/sessions/:public_id/chat", post(chat))
            .route("/sessions/:public_id/move", post(move_to))
            .route("/sessions/:public_id/investigate", post(investigate))
            .route("/sessions/:public_id/accuse", post(accuse))
            .route("/sessions/:public_id/events", get(events))
            .fallback(fallback)
            .with_state(Arc::clone(&game));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self {
            url: format!("http://{addr}"),
            game,
        })
    }

    pub async fn calls(&self, route: &str) -> u32 {
        self.game
            .lock()
            .await
            .calls
            .get(route)
            .copied()
            .unwrap_or(0)
    }
}

fn failure(status: StatusCode, code: ErrorCode, message: &str) -> ApiFailure {
    (status, Json(ApiError::new(code, message)))
}

pub(crate) fn sample_session(public_id: &str, minutes_used: u32) -> Session {
    Session {
        id: SessionRowId(41),
        public_id: PublicId::new(public_id),
        title: Some("The Manor".into()),
        status: SessionStatus::Active,
        clock: Clock {
            start_hour: 12,
            end_hour: 18,
            minutes_used,
        },
        question_budget: QuestionBudget { limit: 10, used: 0 },
        current_location: Some("Hall".into()),
        messages: Vec::new(),
        evidence: Vec::new(),
        narrative_payload: json!({
            "suspects": [
                {
                    "name": "Butler Kim",
                    "timeline": [
                        {"time": "12:00", "location": "Library", "action": "dusting"},
                        {"time": "13:00", "location": "Hall", "action": "serving tea"}
                    ]
                },
                {"name": "Gardener Lee", "timeline": []},
                {
                    "name": "Maid Park",
                    "timeline": [{"time": "12:30", "location": "Kitchen", "action": "cooking"}]
                }
            ]
        }),
    }
}

pub(crate) fn evidence(id: &str, title: &str) -> Evidence {
    Evidence {
        id: EvidenceId::new(id),
        title: title.into(),
        detail: format!("{title} found at the scene"),
        discovered_at: Utc::now(),
    }
}

type GameState = State<Arc<Mutex<MockGame>>>;

async fn create_session(
    State(game): GameState,
    headers: HeaderMap,
) -> Result<Json<Session>, ApiFailure> {
    let mut game = game.lock().await;
    game.record("create");
    game.authorize(&headers)?;
    Ok(Json(game.session.clone()))
}

async fn fetch_session(
    State(game): GameState,
    headers: HeaderMap,
    Path(public_id): Path<String>,
) -> Result<Json<Session>, ApiFailure> {
    let mut game = game.lock().await;
    game.record("fetch");
    game.authorize(&headers)?;
    if game.session.public_id.as_str() != public_id {
        return Err(failure(StatusCode::NOT_FOUND, ErrorCode::NotFound, "no such session"));
    }
    Ok(Json(game.session.clone()))
}

async fn chat(
    State(game): GameState,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatAck>, ApiFailure> {
    let mut game = game.lock().await;
    game.record("chat");
    game.authorize(&headers)?;
    game.ensure_active()?;
    if game.session.question_budget.is_exhausted() {
        return Err(failure(
            StatusCode::CONFLICT,
            ErrorCode::Validation,
            "질문 횟수를 모두 사용했습니다.",
        ));
    }
    game.session.question_budget.used += 1;
    let cost = game.question_cost;
    game.spend(cost);
    game.push_message(MessageRole::Player, request.question.clone());
    let reply = format!("{} refuses to comment.", request.suspect_name);
    game.push_message(MessageRole::Suspect, reply.clone());
    Ok(Json(ChatAck { reply: Some(reply) }))
}

async fn move_to(
    State(game): GameState,
    headers: HeaderMap,
    Json(request): Json<MoveRequest>,
) -> Result<Json<MoveResult>, ApiFailure> {
    let mut game = game.lock().await;
    game.record("move");
    game.authorize(&headers)?;
    game.ensure_active()?;
    if request.location.trim().is_empty() {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            ErrorCode::Validation,
            "unknown location",
        ));
    }
    let cost = game.move_cost;
    game.spend(cost);
    game.session.current_location = Some(request.location.clone());
    Ok(Json(MoveResult {
        location: Some(request.location.clone()),
        message: Some(format!("You walk to the {}.", request.location)),
        minutes_spent: Some(cost),
    }))
}

async fn investigate(
    State(game): GameState,
    headers: HeaderMap,
) -> Result<Json<InvestigateResult>, ApiFailure> {
    let mut game = game.lock().await;
    game.record("investigate");
    game.authorize(&headers)?;
    game.ensure_active()?;

    let location = game.session.current_location.clone().unwrap_or_default();
    let candidates = game
        .evidence_by_location
        .get(&location)
        .cloned()
        .unwrap_or_default();
    let found: Vec<Evidence> = if game.sloppy_evidence {
        candidates
    } else {
        candidates
            .into_iter()
            .filter(|item| !game.session.has_evidence(&item.id))
            .collect()
    };
    game.session.evidence.extend(found.iter().cloned());
    let cost = game.investigate_cost;
    game.spend(cost);
    Ok(Json(InvestigateResult {
        evidence_found: found,
        message: None,
    }))
}

async fn accuse(
    State(game): GameState,
    headers: HeaderMap,
    Json(request): Json<AccuseRequest>,
) -> Result<Json<AccusationResult>, ApiFailure> {
    let mut game = game.lock().await;
    game.record("accuse");
    game.authorize(&headers)?;
    game.ensure_active()?;
    let correct = request.suspect_name == game.killer;
    game.session.status = if correct {
        SessionStatus::Won
    } else {
        SessionStatus::Lost
    };
    Ok(Json(AccusationResult {
        correct,
        actual_killer: game.killer.clone(),
        explanation: "The teacup was still warm.".into(),
        key_clues: vec!["warm teacup".into()],
        status: game.session.status,
    }))
}

async fn events(
    State(game): GameState,
    Path(_public_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let script = {
        let mut game = game.lock().await;
        game.record("events");
        game.ws_scripts.pop_front()
    };
    ws.on_upgrade(move |socket| play_script(socket, script))
}

async fn play_script(mut socket: WebSocket, script: Option<Vec<String>>) {
    match script {
        Some(frames) => {
            for frame in frames {
                if socket.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
            let _ = socket.send(Message::Close(None)).await;
        }
        None => while let Some(Ok(_)) = socket.recv().await {},
    }
}

// `POST /sessions:async` is a single path segment, so it is matched here.
async fn fallback(
    State(game): GameState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    _body: Bytes,
) -> Response {
    if method != Method::POST || uri.path() != "/sessions:async" {
        return StatusCode::NOT_FOUND.into_response();
    }
    let mut game = game.lock().await;
    game.record("create_job");
    if let Err(failure) = game.authorize(&headers) {
        return failure.into_response();
    }
    if let Some((status, body)) = game.create_job_failure.clone() {
        return (status, body).into_response();
    }
    Json(JobAccepted {
        public_id: game.job_public_id.clone(),
    })
    .into_response()
}
