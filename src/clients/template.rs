use std::{collections::HashMap, time::Duration};

use anyhow::{Error, Result, anyhow};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    models::{
        email::{EmailRequest, RenderedEmail},
        retry::RetryConfig,
        template::Template,
    },
    utils::retry_with_backoff,
};

pub struct TemplateServiceClient {
    http_client: Client,
    base_url: String,
    retry_config: RetryConfig,
}

impl TemplateServiceClient {
    pub fn new(base_url: &str, retry_config: RetryConfig) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        info!(base_url = %base_url, "Template service client initialized");

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_config,
        })
    }

    pub async fn fetch_template(&self, template_id: &str) -> Result<Template, Error> {
        let url = format!("{}/api/v1/templates/{}", self.base_url, template_id);

        debug!(template_id, "Fetching template from service");

        retry_with_backoff(&self.retry_config, || {
            let url = url.clone();
            let client = self.http_client.clone();

            async move {
                let response = client.get(&url).send().await.map_err(|e| e.to_string())?;

                let status = response.status();

                if status.is_success() {
                    let template: Template = response
                        .json()
                        .await
                        .map_err(|e| format!("Failed to parse template JSON: {}", e))?;
                    Ok(template)
                } else {
                    Err(format!("Template Service returned status {}", status))
                }
            }
        })
        .await
        .map_err(|e| anyhow!("Failed to fetch template '{}': {}", template_id, e))
    }
}

/// Variables exposed to a template for `request`.
///
/// Scalar fields of `data` are passed through. An `otp` object
/// `{value, ttl_in_minutes}` becomes `otp_1..otp_n` (one per character) plus
/// `otpTtl`.
pub fn template_variables(request: &EmailRequest) -> HashMap<String, Value> {
    let mut variables = HashMap::new();

    for (key, value) in &request.data {
        match (key.as_str(), value) {
            ("otp", Value::Object(otp)) => {
                if let Some(code) = otp.get("value").and_then(Value::as_str) {
                    for (i, digit) in code.chars().enumerate() {
                        variables.insert(format!("otp_{}", i + 1), Value::String(digit.to_string()));
                    }
                }
                if let Some(ttl) = otp.get("ttl_in_minutes").or_else(|| otp.get("ttlInMinutes")) {
                    variables.insert("otpTtl".to_string(), ttl.clone());
                }
            }
            (_, Value::Object(_)) | (_, Value::Array(_)) => {}
            _ => {
                variables.insert(key.clone(), value.clone());
            }
        }
    }

    variables
}

pub fn render_email(template: &Template, request: &EmailRequest) -> Result<RenderedEmail, Error> {
    let variables = template_variables(request);

    debug!(
        template_id = %template.id,
        variable_count = variables.len(),
        "Rendering template"
    );

    Ok(RenderedEmail {
        from: request.from.clone(),
        to: request.to.clone(),
        subject: replace_variables(&template.subject, &variables)?,
        html_body: replace_variables(&template.body_html, &variables)?,
    })
}

fn replace_variables(template: &str, variables: &HashMap<String, Value>) -> Result<String, Error> {
    let mut result = template.to_string();

    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);

        let replacement = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => String::new(),
            _ => {
                return Err(anyhow!("Unsupported variable type for key '{}'", key));
            }
        };

        result = result.replace(&placeholder, &replacement);
    }

    if let Some(start) = result.find("{{") {
        if let Some(len) = result[start..].find("}}") {
            let missing_var = &result[start..start + len + 2];

            warn!(
                missing_variable = %missing_var,
                "Template contains unreplaced variable"
            );

            return Err(anyhow!("Missing variable in template: {}", missing_var));
        }
    }

    Ok(result)
}
