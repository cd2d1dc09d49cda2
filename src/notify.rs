use itertools::Itertools;
use log::{info, warn};
use serde::Serialize;
use crate::models;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unable to render template: {0}")]
    Template(#[from] tera::Error),
    #[error("Invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("Unable to generate email: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("Unable to setup SMTP: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("{0}")]
    Transport(String),
}

#[rocket::async_trait]
pub trait EmailTransport {
    async fn send(&self, msg: lettre::Message) -> Result<(), Error>;
}

#[rocket::async_trait]
impl EmailTransport for lettre::transport::stub::AsyncStubTransport {
    async fn send(&self, msg: lettre::Message) -> Result<(), Error> {
        match lettre::AsyncTransport::send(self, msg).await {
            Ok(()) => Ok(()),
            Err(err) => Err(Error::Transport(format!("Unable to send email: {}", err)))
        }
    }
}

#[rocket::async_trait]
impl EmailTransport for lettre::transport::file::AsyncFileTransport<lettre::Tokio1Executor> {
    async fn send(&self, msg: lettre::Message) -> Result<(), Error> {
        match lettre::AsyncTransport::send(self, msg).await {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::Transport(format!("Unable to save email to file: {}", err)))
        }
    }
}

#[rocket::async_trait]
impl EmailTransport for lettre::transport::smtp::AsyncSmtpTransport<lettre::Tokio1Executor> {
    async fn send(&self, msg: lettre::Message) -> Result<(), Error> {
        match lettre::AsyncTransport::send(self, msg).await {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::Transport(format!("Unable to send email with SMTP: {}", err)))
        }
    }
}

pub type EmailTransportType = Box<dyn EmailTransport + Send + Sync>;

pub struct Mailer {
    transport: Option<EmailTransportType>,
    templates: tera::Tera,
    from: lettre::message::Mailbox,
    reply_to: Option<lettre::message::Mailbox>,
    external_uri: String,
}

#[derive(Serialize)]
struct SigRequestContext<'a> {
    sender_name: &'a str,
    document_title: &'a str,
    signing_url: &'a str,
}

fn smtp_transport(conf: &crate::SMTPConfig) -> Result<lettre::transport::smtp::AsyncSmtpTransport<lettre::Tokio1Executor>, Error> {
    let mut smtp_transport_builder =
        lettre::transport::smtp::AsyncSmtpTransport::<lettre::Tokio1Executor>::builder_dangerous(&conf.server)
        .port(conf.port);
    if conf.use_tls {
        smtp_transport_builder = smtp_transport_builder.tls(
            lettre::transport::smtp::client::Tls::Required(
                lettre::transport::smtp::client::TlsParameters::new(conf.server.clone())?
            )
        );
    }
    if let Some(auth) = &conf.auth {
        smtp_transport_builder = smtp_transport_builder.credentials(
            lettre::transport::smtp::authentication::Credentials::new(
                auth.username.clone(), auth.password.clone()
            )
        )
    }
    Ok(smtp_transport_builder.build())
}

/// Distinct signer addresses across a document's fields, compared case-insensitively.
pub fn signer_emails(fields: &[models::SignatureField]) -> Vec<String> {
    fields.iter()
        .filter_map(models::SignatureField::signer)
        .unique_by(|e| e.to_lowercase())
        .map(str::to_string)
        .collect()
}

impl Mailer {
    pub fn from_config(config: &crate::Config) -> Result<Self, Error> {
        let transport: Option<EmailTransportType> = if let Some(smtp) = &config.smtp {
            info!("Sending email via SMTP server {}:{}", smtp.server, smtp.port);
            Some(Box::new(smtp_transport(smtp)?))
        } else if let Some(outbox_dir) = &config.email.outbox_dir {
            info!("Writing email to {}", outbox_dir.display());
            Some(Box::new(lettre::transport::file::AsyncFileTransport::<lettre::Tokio1Executor>::new(outbox_dir)))
        } else {
            warn!("No email transport configured, signing links will only be logged");
            None
        };

        Self::new(transport, &config.email.from, config.email.reply_to.as_deref(), &config.external_uri)
    }

    pub fn new(transport: Option<EmailTransportType>, from: &str, reply_to: Option<&str>, external_uri: &str) -> Result<Self, Error> {
        let mut templates = tera::Tera::default();
        templates.add_raw_templates(vec![
            ("sig_request.html.tera", include_str!("../templates_email/sig_request.html.tera")),
            ("sig_request.txt.tera", include_str!("../templates_email/sig_request.txt.tera")),
        ])?;
        templates.autoescape_on(vec!["html.tera"]);

        Ok(Self {
            transport,
            templates,
            from: from.parse()?,
            reply_to: match reply_to {
                Some(r) => Some(r.parse()?),
                None => None
            },
            external_uri: external_uri.trim_end_matches('/').to_string(),
        })
    }

    pub fn signing_url(&self, token: &str) -> String {
        format!("{}/sign/{}", self.external_uri, token)
    }

    fn render_signing_request(&self, sender_name: &str, document_title: &str, signing_url: &str) -> Result<(String, String), Error> {
        let context = tera::Context::from_serialize(SigRequestContext {
            sender_name,
            document_title,
            signing_url,
        })?;
        Ok((
            self.templates.render("sig_request.html.tera", &context)?,
            self.templates.render("sig_request.txt.tera", &context)?,
        ))
    }

    fn signing_request(&self, to: &str, sender_name: &str, document_title: &str, signing_url: &str) -> Result<lettre::Message, Error> {
        let (email_html, email_txt) = self.render_signing_request(sender_name, document_title, signing_url)?;

        let mut m_build = lettre::message::Message::builder()
            .from(self.from.clone())
            .to(lettre::message::Mailbox {
                name: None,
                email: to.parse()?,
            })
            .subject(format!("Signature Request: {}", document_title));
        if let Some(reply_to) = &self.reply_to {
            m_build = m_build.reply_to(reply_to.clone());
        }

        Ok(m_build.multipart(lettre::message::MultiPart::alternative_plain_html(
            email_txt,
            email_html,
        ))?)
    }

    /// Emails every distinct signer a link to the document. Delivery problems
    /// are logged and never fail the caller; returns how many were sent.
    pub async fn send_signing_requests(&self, document: &models::Document, fields: &[models::SignatureField], sender_name: &str) -> usize {
        let signing_url = match document.signing_token.as_deref() {
            Some(t) => self.signing_url(t),
            None => {
                warn!("Document {} has no signing token, not notifying signers", crate::DocumentID::new(document.id));
                return 0;
            }
        };
        let signers = signer_emails(fields);

        let transport = match &self.transport {
            Some(t) => t,
            None => {
                for signer in &signers {
                    info!("Signing link for {}: {}", signer, signing_url);
                }
                return 0;
            }
        };

        let mut sent = 0;
        for signer in &signers {
            let m = match self.signing_request(signer, sender_name, &document.title, &signing_url) {
                Ok(m) => m,
                Err(err) => {
                    warn!("Unable to build signing request for {}: {}", signer, err);
                    continue;
                }
            };
            match transport.send(m).await {
                Ok(()) => sent += 1,
                Err(err) => warn!("Unable to notify {}: {}", signer, err),
            }
        }
        sent
    }
}
