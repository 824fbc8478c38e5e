use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload of a notification request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRequest {
    #[serde(alias = "templateId")]
    pub template_id: String,
    pub to: String,
    pub from: String,

    #[serde(default)]
    pub data: Map<String, Value>,
}

/// A rendered message ready for the SMTP sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
}
