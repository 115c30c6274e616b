//! Generative backend adapters.
//!
//! A [`Backend`] turns a prompt into raw text. Every failure is reported as a
//! [`GenerationFailed`] value; nothing panics or escapes past this boundary,
//! and there are no internal retries.

use std::env;
use std::fmt;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::config::{BackendConfig, BackendKind};
use crate::io::process::run_command_with_timeout;

/// Bytes of an error body kept in a failure reason.
const ERROR_BODY_LIMIT: usize = 500;

/// One generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// The backend could not produce text for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationFailed {
    pub reason: String,
}

impl GenerationFailed {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for GenerationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "generation failed: {}", self.reason)
    }
}

impl std::error::Error for GenerationFailed {}

/// Abstraction over text generation services.
pub trait Backend {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationFailed>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationFailed> {
        (**self).generate(request)
    }
}

/// Build the backend selected by the config.
pub fn build_backend(config: &BackendConfig, output_limit_bytes: usize) -> Result<Box<dyn Backend>> {
    match config.kind {
        BackendKind::Http => Ok(Box::new(HttpBackend::new(config)?)),
        BackendKind::Command => Ok(Box::new(CommandBackend::new(config, output_limit_bytes)?)),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// OpenAI-compatible chat completions over blocking HTTP.
pub struct HttpBackend {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl HttpBackend {
    /// Resolve the API key from `config.api_key_env` once, at construction.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let api_key = env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        let Some(api_key) = api_key else {
            bail!(
                "backend credentials missing: set {} (or add it to .env)",
                config.api_key_env
            );
        };
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &BackendConfig, api_key: String) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }
}

impl Backend for HttpBackend {
    #[instrument(skip_all, fields(model = %self.model, prompt_bytes = request.prompt.len()))]
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationFailed> {
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: request.prompt,
            }],
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
        };

        info!(endpoint = %self.endpoint, "requesting completion");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| GenerationFailed::new(format!("request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| GenerationFailed::new(format!("read response body: {e}")))?;
        if !status.is_success() {
            warn!(%status, "backend returned an error status");
            return Err(GenerationFailed::new(format!(
                "backend returned {status}: {}",
                clip(&text, ERROR_BODY_LIMIT)
            )));
        }

        let content = parse_completion(&text)?;
        debug!(response_bytes = content.len(), "completion received");
        Ok(content)
    }
}

/// Extract `choices[0].message.content` from a chat completion body.
pub fn parse_completion(body: &str) -> Result<String, GenerationFailed> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| GenerationFailed::new(format!("malformed completion json: {e}")))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| GenerationFailed::new("completion has no message content"))
}

/// Spawns a local command, writes the prompt to stdin and returns stdout.
pub struct CommandBackend {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandBackend {
    pub fn new(config: &BackendConfig, output_limit_bytes: usize) -> Result<Self> {
        if config.command.is_empty() {
            bail!("backend.command must be a non-empty array");
        }
        Ok(Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
            output_limit_bytes,
        })
    }
}

impl Backend for CommandBackend {
    #[instrument(skip_all, fields(program = ?self.command.first(), prompt_bytes = request.prompt.len()))]
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, GenerationFailed> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(GenerationFailed::new("backend command is empty"));
        };
        let mut cmd = Command::new(program);
        cmd.args(args);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .map_err(|e| GenerationFailed::new(format!("{e:#}")))?;

        if output.timed_out {
            return Err(GenerationFailed::new(format!(
                "{program} did not finish within {}s",
                self.timeout.as_secs()
            )));
        }
        if !output.status.success() {
            return Err(GenerationFailed::new(format!(
                "{program} exited with status {:?}: {}",
                output.status.code(),
                clip(output.stderr_lossy().trim(), ERROR_BODY_LIMIT)
            )));
        }
        if output.stdout_truncated > 0 {
            warn!(
                truncated = output.stdout_truncated,
                "backend output truncated"
            );
        }
        Ok(output.stdout_lossy())
    }
}

fn clip(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    fn request(prompt: &str) -> GenerationRequest<'_> {
        GenerationRequest {
            prompt,
            max_output_tokens: 100,
            temperature: 0.1,
        }
    }

    /// Serve exactly one HTTP response and hand back the request body.
    fn serve_once(status: &'static str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read header");
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    break;
                }
                if let Some((name, value)) = trimmed.split_once(':')
                    && name.eq_ignore_ascii_case("content-length")
                {
                    content_length = value.trim().parse().expect("content length");
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).expect("read body");

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .expect("write response");
            String::from_utf8(request_body).expect("utf8 body")
        });
        (format!("http://{addr}/v1/chat/completions"), handle)
    }

    fn config(endpoint: String) -> BackendConfig {
        BackendConfig {
            endpoint,
            model: "test-model".to_string(),
            request_timeout_secs: 10,
            ..BackendConfig::default()
        }
    }

    #[test]
    fn parses_first_choice() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "def parse(p): pass"}}]}"#;
        assert_eq!(parse_completion(body).expect("content"), "def parse(p): pass");
    }

    #[test]
    fn missing_content_is_generation_failure() {
        let err = parse_completion(r#"{"choices": []}"#).unwrap_err();
        assert!(err.reason.contains("no message content"));
        assert!(parse_completion("not json").is_err());
    }

    #[test]
    fn missing_key_fails_at_construction() {
        let mut cfg = BackendConfig::default();
        cfg.api_key_env = "SYNTHLOOP_TEST_KEY_THAT_IS_NEVER_SET".to_string();
        let err = HttpBackend::new(&cfg).err().expect("construction error");
        assert!(err.to_string().contains("SYNTHLOOP_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn http_backend_posts_chat_request() {
        let (endpoint, server) = serve_once(
            "200 OK",
            r#"{"choices": [{"message": {"content": "```python\ndef parse(p): pass\n```"}}]}"#,
        );
        let backend = HttpBackend::with_api_key(&config(endpoint), "key".to_string())
            .expect("backend");

        let text = backend.generate(&request("write a parser")).expect("generate");
        assert!(text.contains("def parse"));

        let sent: serde_json::Value =
            serde_json::from_str(&server.join().expect("server")).expect("json body");
        assert_eq!(sent["model"], "test-model");
        assert_eq!(sent["messages"][0]["content"], "write a parser");
        assert_eq!(sent["max_tokens"], 100);
    }

    #[test]
    fn http_error_status_is_generation_failure() {
        let (endpoint, server) = serve_once(
            "429 Too Many Requests",
            r#"{"error": {"message": "rate limited"}}"#,
        );
        let backend = HttpBackend::with_api_key(&config(endpoint), "key".to_string())
            .expect("backend");

        let err = backend.generate(&request("prompt")).unwrap_err();
        assert!(err.reason.contains("429"));
        assert!(err.reason.contains("rate limited"));
        server.join().expect("server");
    }

    #[cfg(unix)]
    #[test]
    fn command_backend_returns_stdout() {
        let cfg = BackendConfig {
            kind: BackendKind::Command,
            command: vec!["cat".to_string()],
            ..BackendConfig::default()
        };
        let backend = CommandBackend::new(&cfg, 10_000).expect("backend");
        assert_eq!(backend.generate(&request("echo me")).expect("generate"), "echo me");
    }

    #[cfg(unix)]
    #[test]
    fn command_backend_failure_is_reported() {
        let cfg = BackendConfig {
            kind: BackendKind::Command,
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo quota exceeded >&2; exit 3".to_string(),
            ],
            ..BackendConfig::default()
        };
        let backend = CommandBackend::new(&cfg, 10_000).expect("backend");
        let err = backend.generate(&request("prompt")).unwrap_err();
        assert!(err.reason.contains("status Some(3)"));
        assert!(err.reason.contains("quota exceeded"));
    }

    #[test]
    fn command_backend_spawn_error_is_generation_failure() {
        let cfg = BackendConfig {
            kind: BackendKind::Command,
            command: vec!["/definitely/not/a/binary".to_string()],
            ..BackendConfig::default()
        };
        let backend = CommandBackend::new(&cfg, 10_000).expect("backend");
        assert!(backend.generate(&request("prompt")).is_err());
    }
}
