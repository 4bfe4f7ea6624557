//! An in-process WinRM service for tests.
//!
//! It understands just enough of the shell resource to exercise a real
//! [`Client`]: shells are counted, command lines are recorded in order and
//! answered by a caller supplied closure.

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use quick_xml::escape::unescape;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::oneshot;

use crate::{
    Client, Endpoint, Parameters,
    envelope::{
        ACTION_COMMAND, ACTION_CREATE, ACTION_DELETE, ACTION_RECEIVE, ACTION_SIGNAL, NS_SHELL,
        NS_SOAP, NS_WSMAN,
    },
    error::OPERATION_TIMEOUT_FAULT,
};

/// What a recorded command answers with.
#[derive(Clone, Debug, Default)]
pub struct Reply {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,

    /// Split output over several Receive responses of at most this many bytes
    /// per stream
    pub chunk_size: Option<usize>,

    /// Finish without an ExitCode element
    pub omit_exit_code: bool,
}

impl Reply {
    pub fn new(stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            chunk_size: None,
            omit_exit_code: false,
        }
    }

    pub fn output(stdout: &str, stderr: &str, exit_code: i32) -> Self {
        Self::new(stdout.as_bytes(), stderr.as_bytes(), exit_code)
    }

    pub fn success() -> Self {
        Self::default()
    }

    pub fn chunked(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    pub fn without_exit_code(mut self) -> Self {
        self.omit_exit_code = true;
        self
    }
}

type Responder = Box<dyn Fn(&str) -> Reply + Send + Sync>;

struct MockState {
    authorization: String,
    responder: Responder,
    commands: Mutex<Vec<String>>,
    pending: Mutex<HashMap<String, Reply>>,
    next_id: AtomicUsize,
    shells_created: AtomicUsize,
    shells_deleted: AtomicUsize,
    receives: AtomicUsize,
    receive_timeouts: AtomicUsize,
    signals: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running mock service. It shuts down when dropped.
pub struct MockServer {
    endpoint: Endpoint,
    state: Arc<MockState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockServer {
    /// Start listening on a random loopback port.
    pub async fn start<F>(username: &str, password: &str, responder: F) -> std::io::Result<Self>
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let state = Arc::new(MockState {
            authorization: format!(
                "Basic {}",
                STANDARD.encode(format!("{username}:{password}"))
            ),
            responder: Box::new(responder),
            commands: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            shells_created: AtomicUsize::new(0),
            shells_deleted: AtomicUsize::new(0),
            receives: AtomicUsize::new(0),
            receive_timeouts: AtomicUsize::new(0),
            signals: AtomicUsize::new(0),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let router = Router::new()
            .route("/wsman", post(handle))
            .with_state(state.clone());

        let (shutdown, signal) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await;
        });

        Ok(Self {
            endpoint: Endpoint::new("127.0.0.1", port),
            state,
            shutdown: Some(shutdown),
        })
    }

    /// Answer the next `count` Receive requests with the operation timeout
    /// fault.
    pub fn with_receive_timeouts(self, count: usize) -> Self {
        self.state.receive_timeouts.store(count, Ordering::SeqCst);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// A client for this service with short timeouts.
    pub fn client(&self, username: &str, password: &str) -> crate::Result<Client> {
        Client::new(
            &self.endpoint,
            username,
            password,
            Parameters {
                timeout: Duration::from_secs(5),
                ..Parameters::default()
            },
        )
    }

    /// Every command line received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state.commands).clone()
    }

    pub fn shells_created(&self) -> usize {
        self.state.shells_created.load(Ordering::SeqCst)
    }

    pub fn shells_deleted(&self) -> usize {
        self.state.shells_deleted.load(Ordering::SeqCst)
    }

    pub fn receives(&self) -> usize {
        self.state.receives.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> usize {
        self.state.signals.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Text content of the first `<tag ...>text</tag>` in a document.
fn tag_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let opening = format!("<{tag}");
    let mut from = 0;
    let open = loop {
        let candidate = from + xml[from..].find(&opening)?;
        match xml[candidate + opening.len()..].chars().next() {
            Some('>') | Some(' ') => break candidate,
            _ => from = candidate + opening.len(),
        }
    };
    let start = open + xml[open..].find('>')? + 1;
    let end = start + xml[start..].find(&format!("</{tag}>"))?;
    Some(&xml[start..end])
}

fn attribute_value<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("{name}=\"");
    let start = xml.find(&marker)? + marker.len();
    let end = start + xml[start..].find('"')?;
    Some(&xml[start..end])
}

fn soap(body: &str) -> Response {
    (
        [(header::CONTENT_TYPE, "application/soap+xml;charset=UTF-8")],
        format!(
            r#"<s:Envelope xmlns:s="{NS_SOAP}" xmlns:w="{NS_WSMAN}" xmlns:rsp="{NS_SHELL}"><s:Header/><s:Body>{body}</s:Body></s:Envelope>"#
        ),
    )
        .into_response()
}

fn timeout_fault() -> Response {
    let body = format!(
        r#"<s:Envelope xmlns:s="{NS_SOAP}"><s:Body><s:Fault><s:Code><s:Value>s:Receiver</s:Value></s:Code><s:Reason><s:Text xml:lang="en-US">The operation timed out.</s:Text></s:Reason><s:Detail><f:WSManFault xmlns:f="http://schemas.microsoft.com/wbem/wsman/1/wsmanfault" Code="{OPERATION_TIMEOUT_FAULT}"><f:Message>timed out</f:Message></f:WSManFault></s:Detail></s:Fault></s:Body></s:Envelope>"#
    );
    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
}

fn take_chunk(buffer: &mut Vec<u8>, size: Option<usize>) -> Vec<u8> {
    let n = size.unwrap_or(usize::MAX).min(buffer.len());
    buffer.drain(..n).collect()
}

async fn handle(State(state): State<Arc<MockState>>, headers: HeaderMap, body: String) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == state.authorization);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let Some(action) = tag_text(&body, "a:Action") else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match action {
        ACTION_CREATE => {
            let id = state.next_id.fetch_add(1, Ordering::SeqCst);
            state.shells_created.fetch_add(1, Ordering::SeqCst);
            soap(&format!(
                "<rsp:Shell><rsp:ShellId>SHELL-{id}</rsp:ShellId></rsp:Shell>"
            ))
        }
        ACTION_COMMAND => {
            let command_line = tag_text(&body, "rsp:Command")
                .and_then(|text| unescape(text).ok())
                .map(|text| text.into_owned())
                .unwrap_or_default();
            let reply = (state.responder)(&command_line);
            lock(&state.commands).push(command_line);

            let id = format!("CMD-{}", state.next_id.fetch_add(1, Ordering::SeqCst));
            lock(&state.pending).insert(id.clone(), reply);
            soap(&format!(
                "<rsp:CommandResponse><rsp:CommandId>{id}</rsp:CommandId></rsp:CommandResponse>"
            ))
        }
        ACTION_RECEIVE => {
            state.receives.fetch_add(1, Ordering::SeqCst);
            let faulted = state
                .receive_timeouts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if faulted {
                return timeout_fault();
            }

            let Some(id) = attribute_value(&body, "CommandId").map(str::to_string) else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            let mut pending = lock(&state.pending);
            let Some(reply) = pending.get_mut(&id) else {
                return StatusCode::BAD_REQUEST.into_response();
            };

            let stdout = take_chunk(&mut reply.stdout, reply.chunk_size);
            let stderr = take_chunk(&mut reply.stderr, reply.chunk_size);
            let done = reply.stdout.is_empty() && reply.stderr.is_empty();

            let mut xml = String::from("<rsp:ReceiveResponse>");
            xml.push_str(&format!(
                r#"<rsp:Stream Name="stdout" CommandId="{id}">{}</rsp:Stream>"#,
                STANDARD.encode(&stdout)
            ));
            xml.push_str(&format!(
                r#"<rsp:Stream Name="stderr" CommandId="{id}">{}</rsp:Stream>"#,
                STANDARD.encode(&stderr)
            ));
            if done && reply.omit_exit_code {
                xml.push_str(&format!(
                    r#"<rsp:CommandState CommandId="{id}" State="{NS_SHELL}/CommandState/Done"/>"#
                ));
                pending.remove(&id);
            } else if done {
                xml.push_str(&format!(
                    r#"<rsp:CommandState CommandId="{id}" State="{NS_SHELL}/CommandState/Done"><rsp:ExitCode>{}</rsp:ExitCode></rsp:CommandState>"#,
                    reply.exit_code
                ));
                pending.remove(&id);
            } else {
                xml.push_str(&format!(
                    r#"<rsp:CommandState CommandId="{id}" State="{NS_SHELL}/CommandState/Running"/>"#
                ));
            }
            xml.push_str("</rsp:ReceiveResponse>");
            soap(&xml)
        }
        ACTION_SIGNAL => {
            state.signals.fetch_add(1, Ordering::SeqCst);
            soap("<rsp:SignalResponse/>")
        }
        ACTION_DELETE => {
            state.shells_deleted.fetch_add(1, Ordering::SeqCst);
            soap("")
        }
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}
