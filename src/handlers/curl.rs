//! HTTP fetch handler (`Curl` handler type).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::handlers::{EventContext, Handler, HandlerOutcome};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Issues a GET for the event's command URL and for every URL argument.
#[derive(Debug, Clone)]
pub struct CurlHandler {
    client: reqwest::Client,
}

impl CurlHandler {
    pub fn new() -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Use a preconfigured client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, url: &str) -> Result<String, HandlerError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok(format!("{} {} bytes", status.as_u16(), body.len()))
    }
}

fn is_url(candidate: &str) -> bool {
    let lower = candidate.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[async_trait]
impl Handler for CurlHandler {
    fn name(&self) -> &str {
        "curl"
    }

    async fn execute(&self, ctx: EventContext<'_>) -> Result<HandlerOutcome, HandlerError> {
        let command = ctx.event.command.as_str();
        let targets: Vec<(String, &str)> = std::iter::once((String::new(), command))
            .chain(ctx.event.command_args.iter().map(|a| (a.clone(), a.as_str())))
            .filter(|(_, url)| is_url(url))
            .collect();

        if targets.is_empty() {
            return Err(HandlerError::InvalidEvent {
                handler_type: ctx.handler.handler_type.to_string(),
                reason: format!("no URL in command '{}'", ctx.event.command),
            });
        }

        let mut outcome = HandlerOutcome::default();
        for (command_arg, url) in targets {
            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(HandlerError::Cancelled),
                result = self.fetch(url.trim()) => result,
            };
            match result {
                Ok(summary) => {
                    tracing::info!(url = %url, result = %summary, "Fetched URL");
                    outcome.records.push(ctx.record(&command_arg, summary));
                }
                Err(e) => {
                    tracing::warn!(url = %url, "Fetch failed: {}", e);
                    outcome.records.push(ctx.record(&command_arg, e.to_string()));
                }
            }
        }
        Ok(outcome)
    }
}
