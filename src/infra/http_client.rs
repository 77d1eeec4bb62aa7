use crate::app::ports::{HttpClientPort, HttpMethod, HttpRequest, HttpResponse};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("migration_stats/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClientPort for ReqwestHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(describe)?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp.bytes().await.map_err(describe)?.to_vec();
        Ok(HttpResponse { status, bytes, content_type })
    }
}

/// Error text without the request URL, which carries API keys in its query.
fn describe(e: reqwest::Error) -> String {
    let timed_out = e.is_timeout();
    let e = e.without_url();
    if timed_out {
        format!("request timed out: {e}")
    } else {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_errors_do_not_echo_the_url() {
        let http = ReqwestHttp::new(Duration::from_secs(5)).unwrap();
        let err = http
            .send(HttpRequest::get("http://127.0.0.1:1/series?api_key=SUPERSECRET"))
            .await
            .unwrap_err();
        assert!(!err.contains("SUPERSECRET"), "{err}");
        assert!(!err.contains("127.0.0.1:1/series"), "{err}");
    }
}
