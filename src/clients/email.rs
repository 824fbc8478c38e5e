use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::header::ContentType, transport::smtp::authentication::Credentials,
};
use tracing::{debug, info};

use crate::{
    clients::template::{TemplateServiceClient, render_email},
    error::MessagingError,
    models::email::{EmailRequest, RenderedEmail},
};

/// Performs the side effect of a notification request.
///
/// An `Err` is treated as retriable by the pipeline until its retry budget
/// is spent.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, request: &EmailRequest) -> Result<(), MessagingError>;
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, email: &RenderedEmail) -> Result<(), Error>;
}

pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSender {
    pub fn new(
        host: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        tls: bool,
    ) -> Result<Self, Error> {
        let builder = if tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| anyhow!("Failed to create SMTP relay: {}", e))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };

        let builder = match (username, password) {
            (Some(username), Some(password)) => {
                builder.credentials(Credentials::new(username, password))
            }
            _ => builder,
        };

        info!(host = %host, port, tls, "SMTP sender initialized");

        Ok(Self {
            transport: builder.port(port).build(),
        })
    }
}

#[async_trait]
impl MailSender for SmtpSender {
    async fn send(&self, email: &RenderedEmail) -> Result<(), Error> {
        let message = Message::builder()
            .from(email.from.parse().map_err(|e| anyhow!("Invalid sender address: {}", e))?)
            .to(email.to.parse().map_err(|e| anyhow!("Invalid recipient address: {}", e))?)
            .subject(email.subject.as_str())
            .header(ContentType::TEXT_HTML)
            .body(email.html_body.clone())
            .map_err(|e| anyhow!("Failed to build email: {}", e))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| anyhow!("SMTP send failed: {}", e))?;

        Ok(())
    }
}

/// Fetches the template, renders it and mails the result.
pub struct EmailNotificationHandler {
    templates: TemplateServiceClient,
    sender: Arc<dyn MailSender>,
}

impl EmailNotificationHandler {
    pub fn new(templates: TemplateServiceClient, sender: Arc<dyn MailSender>) -> Self {
        Self { templates, sender }
    }
}

#[async_trait]
impl NotificationHandler for EmailNotificationHandler {
    async fn handle(&self, request: &EmailRequest) -> Result<(), MessagingError> {
        let template = self
            .templates
            .fetch_template(&request.template_id)
            .await
            .map_err(|e| MessagingError::Handler(e.to_string()))?;

        let email =
            render_email(&template, request).map_err(|e| MessagingError::Handler(e.to_string()))?;

        self.sender
            .send(&email)
            .await
            .map_err(|e| MessagingError::Handler(e.to_string()))?;

        debug!(template_id = %request.template_id, to = %request.to, "Email delivered");

        Ok(())
    }
}
