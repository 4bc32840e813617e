//! Subscriber notifications.
//!
//! Subscriber e-mails are encrypted at rest with a key derived from the
//! instance secret (PBKDF2-HMAC-SHA256, per-record salt) and sealed with
//! AES-256-GCM; they are decrypted only at the moment of send. Callback
//! targets are stored as clear URLs. Notification failures are logged
//! against the job and never fail it.

use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{anyhow, Context};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::status::StatusCategory;
use crate::types::{Job, Subscribers};

const SALT_LEN: usize = 16;
const ROUNDS_LEN: usize = 4;
const KEY_LEN: usize = 32;

const DEFAULT_TEMPLATE: &str = include_str!("templates/notification_email.hbs");

/// Subscriber fields of the execute body.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubscriberRequest {
    #[serde(default, rename = "successUri")]
    pub success_uri: Option<String>,
    #[serde(default, rename = "failedUri")]
    pub failed_uri: Option<String>,
    #[serde(default, rename = "inProgressUri")]
    pub in_progress_uri: Option<String>,
    #[serde(default, rename = "successEmail")]
    pub success_email: Option<String>,
    #[serde(default, rename = "failedEmail")]
    pub failed_email: Option<String>,
    #[serde(default, rename = "inProgressEmail")]
    pub in_progress_email: Option<String>,
}

fn derive_key(secret: &str, salt: &[u8], rounds: u32) -> Result<[u8; KEY_LEN]> {
    let rounds = NonZeroU32::new(rounds).ok_or_else(|| {
        Error::JobInvalidParameter("notification encryption rounds must be positive".into())
    })?;
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        rounds,
        salt,
        secret.as_bytes(),
        &mut key,
    );
    Ok(key)
}

fn encryption_secret(settings: &Settings) -> Result<&str> {
    settings.notify.encrypt_secret.as_deref().ok_or_else(|| {
        Error::JobInvalidParameter(
            "cannot register subscriber email, server not configured for notification encryption"
                .into(),
        )
    })
}

/// Seal a payload with a key derived from the secret.
///
/// Token layout: `salt(16) || rounds(4, BE) || nonce(12) || ciphertext+tag`.
/// The same layout protects subscriber e-mails at rest and vault uploads.
pub(crate) fn seal_token(plain: &[u8], secret: &str, rounds: u32) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| Error::JobInvalidParameter("randomness source unavailable".into()))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| Error::JobInvalidParameter("randomness source unavailable".into()))?;

    let key = derive_key(secret, &salt, rounds)?;
    let unbound = UnboundKey::new(&AES_256_GCM, &key)
        .map_err(|_| Error::JobInvalidParameter("payload encryption failed".into()))?;
    let sealing = LessSafeKey::new(unbound);

    let mut in_out = plain.to_vec();
    sealing
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| Error::JobInvalidParameter("payload encryption failed".into()))?;

    let mut token = Vec::with_capacity(SALT_LEN + ROUNDS_LEN + NONCE_LEN + in_out.len());
    token.extend_from_slice(&salt);
    token.extend_from_slice(&rounds.to_be_bytes());
    token.extend_from_slice(&nonce_bytes);
    token.extend_from_slice(&in_out);
    Ok(token)
}

/// Open a token produced by [`seal_token`]; the derivation rounds travel
/// inside the token.
pub(crate) fn open_token(raw: &[u8], secret: &str) -> Result<Vec<u8>> {
    if raw.len() <= SALT_LEN + ROUNDS_LEN + NONCE_LEN {
        return Err(Error::JobInvalidParameter(
            "invalid encrypted payload".into(),
        ));
    }
    let (salt, rest) = raw.split_at(SALT_LEN);
    let (rounds_bytes, rest) = rest.split_at(ROUNDS_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
    let rounds = u32::from_be_bytes(
        rounds_bytes
            .try_into()
            .map_err(|_| Error::JobInvalidParameter("invalid encrypted payload".into()))?,
    );

    let key = derive_key(secret, salt, rounds)?;
    let unbound = UnboundKey::new(&AES_256_GCM, &key)
        .map_err(|_| Error::JobInvalidParameter("payload decryption failed".into()))?;
    let opening = LessSafeKey::new(unbound);

    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| Error::JobInvalidParameter("invalid encrypted payload".into()))?;
    let mut in_out = ciphertext.to_vec();
    let plain = opening
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| Error::JobInvalidParameter("payload decryption failed".into()))?;
    Ok(plain.to_vec())
}

/// Encrypt a subscriber e-mail for storage, URL-safe base64 encoded.
pub fn encrypt_email(email: &str, settings: &Settings) -> Result<String> {
    if email.trim().is_empty() {
        return Err(Error::JobInvalidParameter("invalid empty email".into()));
    }
    let secret = encryption_secret(settings)?;
    let token = seal_token(email.as_bytes(), secret, settings.notify.encrypt_rounds)?;
    Ok(URL_SAFE_NO_PAD.encode(token))
}

/// Decrypt a stored subscriber e-mail.
pub fn decrypt_email(token: &str, settings: &Settings) -> Result<String> {
    let secret = encryption_secret(settings)?;
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| Error::JobInvalidParameter("invalid encrypted email token".into()))?;
    let plain = open_token(&raw, secret)?;
    String::from_utf8(plain)
        .map_err(|_| Error::JobInvalidParameter("notification decryption failed".into()))
}

/// Convert the submitted subscriber definition into the stored mapping,
/// encrypting e-mails. The legacy `notification_email` field doubles as
/// `successEmail` and `failedEmail` when those are absent.
pub fn map_subscribers(
    request: &SubscriberRequest,
    notification_email: Option<&str>,
    settings: &Settings,
) -> Result<Option<Subscribers>> {
    let mut subscribers = Subscribers::default();

    let email_targets = [
        (StatusCategory::Running, request.in_progress_email.as_deref(), None),
        (
            StatusCategory::Failed,
            request.failed_email.as_deref(),
            notification_email,
        ),
        (
            StatusCategory::Success,
            request.success_email.as_deref(),
            notification_email,
        ),
    ];
    for (category, value, fallback) in email_targets {
        if let Some(email) = value.or(fallback) {
            subscribers
                .emails
                .insert(category, encrypt_email(email, settings)?);
        }
    }

    let callback_targets = [
        (StatusCategory::Running, request.in_progress_uri.as_deref()),
        (StatusCategory::Failed, request.failed_uri.as_deref()),
        (StatusCategory::Success, request.success_uri.as_deref()),
    ];
    for (category, value) in callback_targets {
        if let Some(uri) = value {
            subscribers.callbacks.insert(category, uri.to_string());
        }
    }

    Ok((!subscribers.is_empty()).then_some(subscribers))
}

/// Find the e-mail template for this process/status.
///
/// Resolution order: `{dir}/{process}/{status}.hbs`, `{dir}/{process}.hbs`,
/// `{dir}/{default}`, then the embedded default. A configured directory
/// without any matching file is an error rather than a silent fallback.
fn resolve_template(job: &Job, settings: &Settings) -> anyhow::Result<String> {
    let Some(dir) = settings.notify.template_dir.as_ref().filter(|d| d.is_dir()) else {
        return Ok(DEFAULT_TEMPLATE.to_string());
    };
    let candidates = [
        dir.join(&job.process)
            .join(format!("{}.hbs", job.status.as_str())),
        dir.join(format!("{}.hbs", job.process)),
        dir.join(&settings.notify.template_default),
    ];
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(std::fs::read_to_string(candidate)?);
        }
    }
    Err(anyhow!(
        "no email template found under [{}] for process [{}]",
        dir.display(),
        job.process
    ))
}

fn render_email(job: &Job, to: &str, settings: &Settings) -> anyhow::Result<String> {
    let source = resolve_template(job, settings)?;
    let handlebars = handlebars::Handlebars::new();
    let context = json!({
        "to": to,
        "job_id": job.id,
        "process": job.process,
        "status": job.status.as_str(),
        "progress": job.progress,
        "status_url": settings.wps.job_status_url(&job.id),
        "instance": settings.wps.api_url,
    });
    Ok(handlebars.render_template(&source, &context)?.trim().to_string())
}

fn build_transport(settings: &Settings) -> anyhow::Result<SmtpTransport> {
    let smtp = &settings.smtp;
    let host = smtp
        .host
        .as_deref()
        .context("SMTP host is not configured")?;
    let params = TlsParameters::new(host.to_string())?;
    let tls = if smtp.ssl {
        Tls::Wrapper(params)
    } else {
        // STARTTLS when the server offers it
        Tls::Opportunistic(params)
    };
    let mut builder = SmtpTransport::builder_dangerous(host)
        .port(smtp.port)
        .tls(tls)
        .timeout(Some(Duration::from_secs(smtp.timeout_secs)));
    if let (Some(from), Some(password)) = (&smtp.from, &smtp.password) {
        builder = builder.credentials(Credentials::new(from.clone(), password.clone()));
    }
    Ok(builder.build())
}

async fn send_email(job: &Job, token: &str, settings: &Settings) -> anyhow::Result<()> {
    let recipient = decrypt_email(token, settings)?;
    let body = render_email(job, &recipient, settings)?;
    let from = settings
        .smtp
        .from
        .as_deref()
        .context("SMTP sender is not configured")?;
    let message = Message::builder()
        .from(from.parse()?)
        .to(recipient.parse()?)
        .subject(format!("Job {} {}", job.process, job.status))
        .body(body)?;
    let transport = build_transport(settings)?;
    tokio::task::spawn_blocking(move || transport.send(&message))
        .await
        .context("email send task aborted")??;
    Ok(())
}

async fn send_callback(job: &Job, uri: &str, settings: &Settings) -> anyhow::Result<()> {
    // success receives the results document, anything else the job status
    let body = if job.status.category() == StatusCategory::Success {
        crate::results::results_document(job, settings)
    } else {
        job.status_document(&settings.wps.job_status_url(&job.id))
    };
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.worker.request_timeout_secs))
        .build()?;
    let response = client.post(uri).json(&body).send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("callback answered {}", response.status()));
    }
    Ok(())
}

async fn save_notify_log(pool: &PgPool, job: &Job, message: &str, level: &str) {
    if let Err(err) =
        crate::db::jobs::save_log(pool, job.id, level, message, Some(job.progress), Some(job.status))
            .await
    {
        warn!(job = %job.id, error = %err, "failed to persist notification log entry");
    }
}

/// Notify every subscriber configured for the job's final status category.
///
/// All notification errors are caught and logged; none can fail the job.
pub async fn notify_job_subscribers(pool: &PgPool, job: &Job, settings: &Settings) {
    let Some(subscribers) = job.subscribers.as_ref() else {
        return;
    };
    let category = job.status.category();

    if let Some(token) = subscribers.emails.get(&category) {
        match send_email(job, token, settings).await {
            Ok(()) => {
                debug!(job = %job.id, "notification email sent");
                save_notify_log(pool, job, "Notification email sent successfully.", "INFO").await;
            }
            Err(err) => {
                warn!(job = %job.id, error = %err, "could not send notification email");
                save_notify_log(
                    pool,
                    job,
                    &format!("Couldn't send notification email: [{err}]"),
                    "ERROR",
                )
                .await;
            }
        }
    }

    if let Some(uri) = subscribers.callbacks.get(&category) {
        match send_callback(job, uri, settings).await {
            Ok(()) => {
                debug!(job = %job.id, "notification callback sent");
                save_notify_log(pool, job, "Notification callback request sent successfully.", "INFO")
                    .await;
            }
            Err(err) => {
                warn!(job = %job.id, error = %err, "could not send notification callback");
                save_notify_log(
                    pool,
                    job,
                    &format!("Couldn't send notification callback request: [{err}]"),
                    "ERROR",
                )
                .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn test_settings() -> Settings {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        let mut settings = Settings::load(None).unwrap();
        settings.notify.encrypt_secret = Some("instance-secret".to_string());
        settings.notify.encrypt_rounds = 1000;
        settings
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let settings = test_settings();
        let email = "someone@example.com";
        let token = encrypt_email(email, &settings).unwrap();
        assert_ne!(token, email);
        assert!(!token.contains('@'));
        assert_eq!(decrypt_email(&token, &settings).unwrap(), email);
    }

    #[test]
    fn test_encrypt_uses_fresh_salt() {
        let settings = test_settings();
        let a = encrypt_email("a@b.c", &settings).unwrap();
        let b = encrypt_email("a@b.c", &settings).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_rejects_tampering() {
        let settings = test_settings();
        let token = encrypt_email("a@b.c", &settings).unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert!(decrypt_email(&tampered, &settings).is_err());
    }

    #[test]
    fn test_open_token_rejects_truncated_payload() {
        let token = seal_token(b"payload", "secret", 1000).unwrap();
        assert_eq!(open_token(&token, "secret").unwrap(), b"payload");
        assert!(open_token(&token[..SALT_LEN + ROUNDS_LEN], "secret").is_err());
        assert!(open_token(&token, "other-secret").is_err());
    }

    #[test]
    fn test_encrypt_requires_secret() {
        let mut settings = test_settings();
        settings.notify.encrypt_secret = None;
        assert!(encrypt_email("a@b.c", &settings).is_err());
    }

    #[test]
    fn test_map_subscribers_with_back_compat_alias() {
        let settings = test_settings();
        let request = SubscriberRequest {
            in_progress_uri: Some("https://hook.example.com/progress".into()),
            ..Default::default()
        };
        let subscribers = map_subscribers(&request, Some("a@b.c"), &settings)
            .unwrap()
            .unwrap();
        // notification_email doubles as success + failed email
        assert!(subscribers.emails.contains_key(&StatusCategory::Success));
        assert!(subscribers.emails.contains_key(&StatusCategory::Failed));
        assert!(!subscribers.emails.contains_key(&StatusCategory::Running));
        assert_eq!(
            subscribers.callbacks.get(&StatusCategory::Running).unwrap(),
            "https://hook.example.com/progress"
        );
        // stored values are never the plaintext address
        for token in subscribers.emails.values() {
            assert_ne!(token, "a@b.c");
        }
    }

    #[test]
    fn test_map_subscribers_empty() {
        let settings = test_settings();
        let request = SubscriberRequest::default();
        assert!(map_subscribers(&request, None, &settings).unwrap().is_none());
    }

    #[test]
    fn test_default_template_renders() {
        let settings = test_settings();
        let job = crate::db::jobs::tests::sample_job();
        let body = render_email(&job, "a@b.c", &settings).unwrap();
        assert!(body.contains("echo"));
        assert!(body.contains(&job.id.to_string()));
    }
}
