use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SiftError};
use crate::ports::{AnalysisRequest, Analyzer, Finding};

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    #[serde(default)]
    findings: Vec<Finding>,
}

/// Posts each entity's content to an analysis service and reads back
/// `{ "findings": [...] }`.
#[derive(Debug, Clone)]
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalyzer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SiftError::Analyzer(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Vec<Finding>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| SiftError::Analyzer(format!("Analysis request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SiftError::Analyzer(format!(
                "Analysis request for entity {} failed: HTTP {}",
                request.entity_id,
                response.status()
            )));
        }

        let body: AnalysisResponse = response
            .json()
            .await
            .map_err(|e| SiftError::Analyzer(format!("Invalid analysis response: {e}")))?;

        debug!(
            target: "sift::sweep",
            entity = %request.entity_id,
            findings = body.findings.len(),
            "analyzer responded"
        );
        Ok(body.findings)
    }
}
