use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ColumnRole, ColumnSuggestion};
use crate::settings::AdvisorySettings;

#[derive(Error, Debug)]
pub enum AdvisoryError {
    #[error("Advisory service unavailable: {0}")]
    Unavailable(String),

    #[error("Advisory request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Advisory HTTP error: {0}")]
    Http(String),

    #[error("Advisory response unusable: {0}")]
    Response(String),
}

/// Optional service that proposes column roles and missing descriptions.
///
/// Every call carries a timeout and may fail; callers fall back to the
/// deterministic path on any error.
pub trait Advisor: Send + Sync {
    fn resolve_columns(
        &self,
        headers: &[String],
        sample: &[Vec<String>],
        timeout: Duration,
    ) -> Result<ColumnSuggestion, AdvisoryError>;

    /// account number -> inferred description
    fn infer_descriptions(
        &self,
        accounts: &[String],
        timeout: Duration,
    ) -> Result<BTreeMap<String, String>, AdvisoryError>;

    fn name(&self) -> &str {
        "advisor"
    }
}

// ---------------------------------------------------------------------------
// HTTP advisor (OpenAI-compatible chat completions)
// ---------------------------------------------------------------------------

const COLUMNS_SYSTEM: &str = "You map trial balance column headers to roles. \
Roles: account_number, description, amount, period, debit_credit, currency, unknown. \
Answer with JSON only: {\"mapping\": {\"<header>\": \"<role>\"}, \"confidence\": <0..1>, \"recommendations\": [\"...\"]}";

const DESCRIPTIONS_SYSTEM: &str = "You name general ledger accounts of a German chart of accounts (SKR03/SKR04). \
Answer with JSON only: {\"descriptions\": {\"<account number>\": \"<short account name>\"}}. \
Omit accounts you do not know.";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: String,
}

pub struct HttpAdvisor {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpAdvisor {
    pub fn new(endpoint: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        }
    }

    /// `None` unless the advisory section is enabled. The API key is read
    /// from the environment variable the settings name.
    pub fn from_settings(settings: &AdvisorySettings) -> Option<Self> {
        if !settings.enabled {
            return None;
        }
        let api_key = std::env::var(&settings.api_key_env).ok().filter(|k| !k.is_empty());
        Some(Self::new(&settings.endpoint, &settings.model, api_key))
    }

    fn complete(&self, system: &str, prompt: String, timeout: Duration) -> Result<String, AdvisoryError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
        };

        let mut request = self.client.post(&self.endpoint).timeout(timeout).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                AdvisoryError::Timeout(timeout)
            } else if e.is_connect() {
                AdvisoryError::Unavailable(self.endpoint.clone())
            } else {
                AdvisoryError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AdvisoryError::Http(format!("{}: {body}", status.as_u16())));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| AdvisoryError::Response(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AdvisoryError::Response("no choices returned".to_string()))
    }
}

impl Advisor for HttpAdvisor {
    fn resolve_columns(
        &self,
        headers: &[String],
        sample: &[Vec<String>],
        timeout: Duration,
    ) -> Result<ColumnSuggestion, AdvisoryError> {
        let reply = self.complete(COLUMNS_SYSTEM, columns_prompt(headers, sample), timeout)?;
        parse_column_reply(&reply)
    }

    fn infer_descriptions(
        &self,
        accounts: &[String],
        timeout: Duration,
    ) -> Result<BTreeMap<String, String>, AdvisoryError> {
        let prompt = format!("Accounts: {}", accounts.join(", "));
        let reply = self.complete(DESCRIPTIONS_SYSTEM, prompt, timeout)?;
        parse_description_reply(&reply)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

fn columns_prompt(headers: &[String], sample: &[Vec<String>]) -> String {
    let mut prompt = format!("Headers: {}\nSample rows:\n", headers.join(" | "));
    for row in sample {
        prompt.push_str(&row.join(" | "));
        prompt.push('\n');
    }
    prompt
}

/// The outermost `{...}` span; models like to wrap JSON in prose.
fn json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

pub fn parse_column_reply(text: &str) -> Result<ColumnSuggestion, AdvisoryError> {
    #[derive(Deserialize)]
    struct Reply {
        mapping: BTreeMap<String, String>,
        #[serde(default)]
        confidence: f64,
        #[serde(default)]
        recommendations: Vec<String>,
    }

    let json = json_object(text).ok_or_else(|| AdvisoryError::Response("no JSON object".to_string()))?;
    let reply: Reply = serde_json::from_str(json).map_err(|e| AdvisoryError::Response(e.to_string()))?;
    let mapping = reply
        .mapping
        .into_iter()
        .filter_map(|(header, role)| ColumnRole::from_key(&role).map(|r| (header, r)))
        .filter(|(_, role)| *role != ColumnRole::Unknown)
        .collect();
    Ok(ColumnSuggestion {
        mapping,
        confidence: reply.confidence.clamp(0.0, 1.0),
        recommendations: reply.recommendations,
    })
}

pub fn parse_description_reply(text: &str) -> Result<BTreeMap<String, String>, AdvisoryError> {
    let json = json_object(text).ok_or_else(|| AdvisoryError::Response("no JSON object".to_string()))?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| AdvisoryError::Response(e.to_string()))?;
    let object = value
        .get("descriptions")
        .and_then(|d| d.as_object())
        .or_else(|| value.as_object())
        .ok_or_else(|| AdvisoryError::Response("expected an object".to_string()))?;
    Ok(object
        .iter()
        .filter_map(|(account, desc)| {
            let desc = desc.as_str()?.trim();
            (!desc.is_empty()).then(|| (account.clone(), desc.to_string()))
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Fixed-answer advisor
// ---------------------------------------------------------------------------

/// Returns canned answers; used offline and as a deterministic stand-in.
#[derive(Debug, Clone, Default)]
pub struct StaticAdvisor {
    pub columns: Option<ColumnSuggestion>,
    pub descriptions: BTreeMap<String, String>,
}

impl Advisor for StaticAdvisor {
    fn resolve_columns(
        &self,
        _headers: &[String],
        _sample: &[Vec<String>],
        _timeout: Duration,
    ) -> Result<ColumnSuggestion, AdvisoryError> {
        self.columns
            .clone()
            .ok_or_else(|| AdvisoryError::Unavailable("no column suggestion configured".to_string()))
    }

    fn infer_descriptions(
        &self,
        accounts: &[String],
        _timeout: Duration,
    ) -> Result<BTreeMap<String, String>, AdvisoryError> {
        Ok(accounts
            .iter()
            .filter_map(|a| self.descriptions.get(a).map(|d| (a.clone(), d.clone())))
            .collect())
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_column_reply_with_prose() {
        let text = r#"Sure! {"mapping": {"Kto": "account_number", "Text": "description", "EUR": "amounts", "X": "unknown"}, "confidence": 0.9, "recommendations": ["check EUR column"]} Hope this helps."#;
        let s = parse_column_reply(text).unwrap();
        assert_eq!(s.mapping.get("Kto"), Some(&ColumnRole::AccountNumber));
        assert_eq!(s.mapping.get("EUR"), Some(&ColumnRole::Amount));
        assert!(!s.mapping.contains_key("X"));
        assert_eq!(s.confidence, 0.9);
        assert_eq!(s.recommendations.len(), 1);
    }

    #[test]
    fn test_parse_column_reply_rejects_garbage() {
        assert!(matches!(parse_column_reply("no idea"), Err(AdvisoryError::Response(_))));
        assert!(parse_column_reply("{\"confidence\": 1}").is_err());
    }

    #[test]
    fn test_parse_description_reply_shapes() {
        let wrapped = parse_description_reply(r#"{"descriptions": {"1000": "Kasse", "1200": ""}}"#).unwrap();
        assert_eq!(wrapped.len(), 1);
        assert_eq!(wrapped["1000"], "Kasse");

        let bare = parse_description_reply(r#"```json {"1600": "Bank"} ```"#).unwrap();
        assert_eq!(bare["1600"], "Bank");
    }

    #[test]
    fn test_static_advisor_answers_known_accounts_only() {
        let advisor = StaticAdvisor {
            columns: None,
            descriptions: BTreeMap::from([("1000".to_string(), "Kasse".to_string())]),
        };
        let got = advisor
            .infer_descriptions(&["1000".to_string(), "9999".to_string()], Duration::from_secs(1))
            .unwrap();
        assert_eq!(got.len(), 1);
        assert!(advisor.resolve_columns(&[], &[], Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_disabled_settings_yield_no_http_advisor() {
        let settings = AdvisorySettings::default();
        assert!(HttpAdvisor::from_settings(&settings).is_none());
    }

    #[test]
    fn test_unreachable_endpoint_fails_fast() {
        // Port 9 (discard) on loopback is closed in test environments.
        let advisor = HttpAdvisor::new("http://127.0.0.1:9/v1/chat/completions", "m", None);
        let err = advisor
            .resolve_columns(&["Konto".to_string()], &[], Duration::from_millis(500))
            .unwrap_err();
        assert!(matches!(
            err,
            AdvisoryError::Unavailable(_) | AdvisoryError::Timeout(_) | AdvisoryError::Http(_)
        ));
    }

    #[test]
    fn test_advisor_is_object_safe() {
        fn _accepts(_a: &dyn Advisor) {}
        _accepts(&StaticAdvisor::default());
    }
}
