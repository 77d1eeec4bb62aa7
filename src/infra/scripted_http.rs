use crate::app::ports::{HttpClientPort, HttpMethod, HttpRequest, HttpResponse};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

struct Route {
    method: HttpMethod,
    url_contains: String,
    replies: VecDeque<Result<HttpResponse, String>>,
}

/// In-memory HTTP port for development and testing.
///
/// Replies are matched by method and URL substring in registration order.
/// Queued replies are consumed one per request; the last one repeats.
#[derive(Default)]
pub struct ScriptedHttp {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, method: HttpMethod, url_contains: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.push(
            method,
            url_contains,
            Ok(HttpResponse {
                status,
                bytes: body.into(),
                content_type: "application/json".to_string(),
            }),
        );
    }

    /// Like [`get`](Self::get) with an explicit `Content-Type`.
    pub fn get_with_type(&self, url_contains: &str, status: u16, content_type: &str, body: impl Into<Vec<u8>>) {
        self.push(
            HttpMethod::Get,
            url_contains,
            Ok(HttpResponse {
                status,
                bytes: body.into(),
                content_type: content_type.to_string(),
            }),
        );
    }

    pub fn get(&self, url_contains: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.reply(HttpMethod::Get, url_contains, status, body);
    }

    pub fn post(&self, url_contains: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.reply(HttpMethod::Post, url_contains, status, body);
    }

    /// Simulate a transport failure such as a timeout.
    pub fn fail(&self, method: HttpMethod, url_contains: &str, message: &str) {
        self.push(method, url_contains, Err(message.to_string()));
    }

    fn push(&self, method: HttpMethod, url_contains: &str, reply: Result<HttpResponse, String>) {
        let mut routes = self.routes.lock().unwrap();
        if let Some(route) = routes
            .iter_mut()
            .find(|r| r.method == method && r.url_contains == url_contains)
        {
            route.replies.push_back(reply);
            return;
        }
        routes.push(Route {
            method,
            url_contains: url_contains.to_string(),
            replies: VecDeque::from([reply]),
        });
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_matching(&self, url_contains: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.url.contains(url_contains))
            .count()
    }
}

#[async_trait]
impl HttpClientPort for ScriptedHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        self.calls.lock().unwrap().push(request.clone());

        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .iter_mut()
            .find(|r| r.method == request.method && request.url.contains(&r.url_contains));
        match route {
            Some(route) => {
                if route.replies.len() > 1 {
                    route.replies.pop_front().unwrap_or_else(|| Err("exhausted".into()))
                } else {
                    route
                        .replies
                        .front()
                        .cloned()
                        .unwrap_or_else(|| Err("exhausted".into()))
                }
            }
            None => Ok(HttpResponse {
                status: 404,
                bytes: format!("no scripted reply for {}", request.url).into_bytes(),
                content_type: "text/plain".to_string(),
            }),
        }
    }
}
