//! Post → record extraction.
//!
//! Two [`Extractor`] implementations:
//!
//! - **[`FieldExtractor`]**: maps the fields a feed already parsed (token,
//!   amount, addresses, protocol, ...) straight into [`RecordFields`]. Tags
//!   are the post's tag hints plus the token or protocol name.
//! - **[`ChatExtractor`]**: asks an OpenAI-compatible chat completion endpoint
//!   for the hacked protocol and the tokens involved. Network, amount, and tx
//!   hash still come from the post's fields.
//!
//! # Retry Strategy
//!
//! The chat extractor retries transient errors with exponential backoff:
//! - HTTP 429 or 5xx → retry (1s, 2s, 4s, ... capped at 32s)
//! - Other HTTP 4xx → fail immediately
//! - Network error → retry
//!
//! A post whose extraction still fails is not lost; the orchestrator keeps it
//! in the channel's retry queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use hack_timeline_core::models::{Extraction, Post, RecordFields, RecordKind};

use crate::config::{Config, ExtractorConfig};
use crate::traits::Extractor;

/// Extractor for feeds that already carry structured fields.
pub struct FieldExtractor {
    kind: RecordKind,
}

impl FieldExtractor {
    pub fn new(kind: RecordKind) -> Self {
        Self { kind }
    }
}

fn required<'a>(post: &'a Post, name: &str) -> Result<&'a str> {
    post.field(name).with_context(|| {
        format!(
            "post {}#{} is missing field '{}'",
            post.channel, post.message_id, name
        )
    })
}

fn optional(post: &Post, name: &str) -> String {
    post.field(name).unwrap_or_default().to_string()
}

#[async_trait]
impl Extractor for FieldExtractor {
    async fn extract(&self, post: &Post) -> Result<Extraction> {
        let mut tag_names = post.tag_hints.clone();
        let fields = match self.kind {
            RecordKind::Hacking => {
                let protocol = required(post, "protocol")?;
                tag_names.push(protocol.to_string());
                RecordFields::Hacking {
                    protocol: protocol.to_string(),
                    network: optional(post, "network"),
                    amount: optional(post, "amount"),
                    tx_hash: optional(post, "tx_hash"),
                }
            }
            RecordKind::Transfer => {
                let token = required(post, "token")?;
                tag_names.push(token.to_string());
                RecordFields::Transfer {
                    token: token.to_string(),
                    amount: required(post, "amount")?.to_string(),
                    from: required(post, "from")?.to_string(),
                    to: required(post, "to")?.to_string(),
                }
            }
        };
        Ok(Extraction { fields, tag_names })
    }
}

const PROTOCOL_PROMPT: &str = r#"You are a specialized assistant for DeFi security analysis. Extract the name of the hacked DeFi protocol from the text below and give both the original and a cleaned version of the name.

Rules:
1. Identify the primary DeFi protocol that was hacked.
2. The first part is the name exactly as it appears in the text.
3. The second part is the cleaned name: lowercase, without generic suffixes or domain extensions such as .fi, .finance, .protocol, .trade, .exchange, .xyz.
4. Answer with a single line, original and cleaned name separated by a comma without spaces: OriginalName,cleanedname

Examples:
- "Attack on Resupply.fi" -> Resupply.fi,resupply
- "Sonne Finance was exploited" -> Sonne Finance,sonne
- "The Onyx Protocol hack" -> Onyx Protocol,onyx

Text:
"#;

const TOKEN_PROMPT: &str = r#"You are a specialized assistant for crypto token analysis. List the ticker symbols of the tokens directly stolen, manipulated, or used in the hack described below.

Rules:
1. Tickers are short symbols such as ETH, WBTC, CRV, wstETH.
2. Do not include protocol names, currency signs, or unrelated acronyms.
3. Answer with one comma-separated line without spaces, e.g. TICKER1,TICKER2.
4. If no token is involved, answer exactly N/A.

Examples:
- "The attacker manipulated the price oracle for the FTM token on Geist Finance" -> FTM
- "A vulnerability was reported and no funds were lost" -> N/A

Text:
"#;

/// Extractor backed by an OpenAI-compatible chat completion API.
pub struct ChatExtractor {
    config: ExtractorConfig,
    api_key: String,
    client: reqwest::Client,
}

impl ChatExtractor {
    /// Build from config, reading the API key from `config.api_key_env`.
    pub fn from_config(config: &ExtractorConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} not set", config.api_key_env))?;
        Self::new(config.clone(), api_key)
    }

    pub fn new(config: ExtractorConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    /// Send one prompt and return the first choice's text, with retry/backoff.
    async fn complete(&self, prompt: String) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": 0,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_chat_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!("chat API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("chat API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("chat completion failed after retries")))
    }
}

#[async_trait]
impl Extractor for ChatExtractor {
    async fn extract(&self, post: &Post) -> Result<Extraction> {
        let protocol_answer = self
            .complete(format!("{}{}", PROTOCOL_PROMPT, post.text))
            .await?;
        let (protocol, cleaned) = parse_protocol_answer(&protocol_answer)?;

        let token_answer = self.complete(format!("{}{}", TOKEN_PROMPT, post.text)).await?;
        let mut tag_names = parse_token_answer(&token_answer);
        tag_names.push(cleaned);
        tag_names.extend(post.tag_hints.iter().cloned());

        Ok(Extraction {
            fields: RecordFields::Hacking {
                protocol,
                network: optional(post, "network"),
                amount: optional(post, "amount"),
                tx_hash: optional(post, "tx_hash"),
            },
            tag_names,
        })
    }
}

/// Pull `choices[0].message.content` out of a chat completion response.
fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing choices[0].message.content"))
}

/// `"Sonne Finance,sonne"` → `("Sonne Finance", "sonne")`.
///
/// A missing cleaned half falls back to the lowercased original.
fn parse_protocol_answer(answer: &str) -> Result<(String, String)> {
    let line = answer.lines().next().unwrap_or_default().trim();
    let mut parts = line.splitn(2, ',');
    let original = parts.next().unwrap_or_default().trim();
    if original.is_empty() {
        bail!("model returned no protocol name");
    }
    let cleaned = parts
        .next()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| original.to_lowercase());
    Ok((original.to_string(), cleaned))
}

/// `"wstUSR,crvUSD"` → `["wstusr", "crvusd"]`; `"N/A"` → `[]`.
fn parse_token_answer(answer: &str) -> Vec<String> {
    let line = answer.lines().next().unwrap_or_default().trim();
    if line.eq_ignore_ascii_case("n/a") {
        return Vec::new();
    }
    line.split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty() && t != "n/a")
        .collect()
}

/// Pick the extractor for `kind`: the chat extractor for hacking records
/// when `[extractor]` is configured, otherwise the field extractor.
pub fn build_extractor(kind: RecordKind, config: &Config) -> Result<Arc<dyn Extractor>> {
    match (kind, &config.extractor) {
        (RecordKind::Hacking, Some(cfg)) => Ok(Arc::new(ChatExtractor::from_config(cfg)?)),
        _ => Ok(Arc::new(FieldExtractor::new(kind))),
    }
}
