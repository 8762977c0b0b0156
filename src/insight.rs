//! Exam insights from a hosted language model.
//!
//! The summarizer never fails a request: transport or API errors come back
//! as a string starting with `Error: `, and an empty answer becomes a fixed
//! fallback message.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;

pub const ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub const NO_INSIGHTS: &str = "Could not generate insights at this time.";

fn build_prompt(syllabus: &str) -> String {
    format!(
        "You are an experienced academic mentor and study expert.\n\
         Analyze the following syllabus text and identify the \"High Probability\" topics \
         that often appear in end-semester exams.\n\
         Provide actionable advice for a student preparing 2 weeks before exams.\n\
         Format the response using Markdown.\n\
         Syllabus Content: {syllabus}"
    )
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Deserialize, Default)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| content.parts.iter().map(|part| part.text.as_str()).collect())
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct ExamInsights {
    client: Client,
    api_key: Option<String>,
    model: String,
}

impl ExamInsights {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            api_key: config.gemini_api_key.clone(),
            model: config.gemini_model.clone(),
        }
    }

    pub async fn summarize(&self, syllabus: &str) -> String {
        match self.generate(syllabus).await {
            Ok(text) if text.trim().is_empty() => NO_INSIGHTS.to_string(),
            Ok(text) => text,
            Err(message) => {
                warn!(error = %message, "insight generation failed");
                format!("Error: {message}")
            }
        }
    }

    async fn generate(&self, syllabus: &str) -> Result<String, String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| "no API key configured".to_string())?;

        let prompt = build_prompt(syllabus);
        let payload = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: &prompt }],
            }],
        };

        let response = self
            .client
            .post(format!("{ENDPOINT}/{}:generateContent", self.model))
            .query(&[("key", api_key)])
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("model request failed with {status}: {body}"));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| e.to_string())?;
        info!(model = %self.model, "insights generated");
        Ok(body.text())
    }
}
