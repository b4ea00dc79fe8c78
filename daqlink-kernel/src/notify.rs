/**
 * NOTIFICATIONS - Alertes d'anomalie best-effort
 *
 * RÔLE : prévenir l'extérieur qu'une machine dépasse son seuil, sans jamais
 * ralentir ni faire échouer le coordinateur.
 *
 * FONCTIONNEMENT :
 * - NotificationSink (possédé par le coordinateur) applique la limite de débit
 *   avec l'horloge injectée puis dépose la notification dans une file bornée
 * - une tâche de fond la livre via un NotifyBackend (log ou webhook JSON)
 * - file pleine, backend en erreur = log debug, rien d'autre
 */

use crate::clock::Clock;
use crate::config::NotificationConf;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::{Duration, PrimitiveDateTime};
use tokio::sync::mpsc;

const QUEUE_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook answered {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub topic: String,
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait NotifyBackend: Send + Sync {
    async fn deliver(&self, note: &Notification) -> Result<(), NotifyError>;
}

/// Backend par défaut : simple trace
pub struct LogBackend;

#[async_trait]
impl NotifyBackend for LogBackend {
    async fn deliver(&self, note: &Notification) -> Result<(), NotifyError> {
        tracing::info!(topic = %note.topic, title = %note.title, body = %note.body, "notification");
        Ok(())
    }
}

pub struct WebhookBackend {
    client: reqwest::Client,
    url: String,
}

impl WebhookBackend {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, url: url.into() }
    }
}

#[async_trait]
impl NotifyBackend for WebhookBackend {
    async fn deliver(&self, note: &Notification) -> Result<(), NotifyError> {
        let resp = self.client.post(&self.url).json(note).send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status()));
        }
        Ok(())
    }
}

pub fn backend_from_config(conf: &NotificationConf) -> Arc<dyn NotifyBackend> {
    match &conf.webhook_url {
        Some(url) => Arc::new(WebhookBackend::new(url.clone())),
        None => Arc::new(LogBackend),
    }
}

pub struct NotificationSink {
    clock: Arc<dyn Clock>,
    min_interval: Duration,
    next_allowed: Option<PrimitiveDateTime>,
    queue: mpsc::Sender<Notification>,
    submitted: u64,
    suppressed: u64,
}

impl NotificationSink {
    /// Démarre la tâche de livraison sur le runtime courant.
    pub fn spawn(backend: Arc<dyn NotifyBackend>, clock: Arc<dyn Clock>, min_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<Notification>(QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(note) = rx.recv().await {
                if let Err(e) = backend.deliver(&note).await {
                    tracing::debug!(error = %e, topic = %note.topic, "notification dropped");
                }
            }
        });
        Self::with_queue(tx, clock, min_interval)
    }

    /// Sink branché sur une file fournie (la livraison est à la charge de l'appelant).
    pub fn with_queue(queue: mpsc::Sender<Notification>, clock: Arc<dyn Clock>, min_interval: Duration) -> Self {
        Self { clock, min_interval, next_allowed: None, queue, submitted: 0, suppressed: 0 }
    }

    /// Soumet une notification. Rend `false` si elle a été écartée (débit, file pleine).
    pub fn notify(&mut self, topic: &str, title: &str, body: &str) -> bool {
        let now = self.clock.now();
        if let Some(next) = self.next_allowed {
            if now < next {
                self.suppressed += 1;
                tracing::debug!(topic, "notification rate limited");
                return false;
            }
        }
        self.next_allowed = Some(now.checked_add(self.min_interval).unwrap_or(PrimitiveDateTime::MAX));

        let note = Notification { topic: topic.into(), title: title.into(), body: body.into() };
        match self.queue.try_send(note) {
            Ok(()) => {
                self.submitted += 1;
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "notification queue unavailable");
                false
            }
        }
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}
