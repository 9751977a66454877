//! Outbound side of the control plane.
//!
//! Workers drop [`Control`] messages on a bounded channel; a single
//! consumer task forwards each one to the control server over HTTP.
//! Transport failures are logged and the message dropped; there is no
//! retry. Closing the channel drains it.

use crate::control::types::{Control, ControlKind, RangeAnnouncement};
use crate::core::{Result, SpanfloodError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

/// Depth of the in-process control channel. A full channel backpressures
/// range issuance on the workers.
pub const CONTROL_CHANNEL_CAPACITY: usize = 100;

/// Client for the control server, owning the channel consumer task.
pub struct ControlClient {
    endpoint: Url,
    tx: mpsc::Sender<Control>,
    rx: Option<mpsc::Receiver<Control>>,
    handle: Option<JoinHandle<()>>,
}

impl ControlClient {
    /// Create a client targeting `endpoint` (the control server base URL).
    pub fn new(endpoint: Url) -> Self {
        let (tx, rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        Self {
            endpoint,
            tx,
            rx: Some(rx),
            handle: None,
        }
    }

    /// A producer handle for workers to announce ranges on.
    pub fn sender(&self) -> mpsc::Sender<Control> {
        self.tx.clone()
    }

    /// Spawn the consumer task.
    pub fn start(&mut self) {
        let Some(rx) = self.rx.take() else {
            return;
        };

        let endpoint = self.endpoint.clone();
        self.handle = Some(tokio::spawn(process_messages(endpoint.clone(), rx)));
        tracing::info!(endpoint = %endpoint, "control client started");
    }

    /// Close the channel and wait for the consumer to drain it.
    pub async fn stop(self) {
        tracing::info!("stopping control client");
        drop(self.tx);
        if let Some(handle) = self.handle {
            if let Err(err) = handle.await {
                tracing::error!(%err, "control client task failed");
            }
        }
        tracing::info!("control client stopped");
    }
}

async fn process_messages(endpoint: Url, mut rx: mpsc::Receiver<Control>) {
    let client = reqwest::Client::new();

    while let Some(control) = rx.recv().await {
        let range = &control.range;
        match post_message_range(&client, &endpoint, control.kind, range).await {
            Ok(()) => {
                tracing::debug!(
                    generator_id = %range.generator_id,
                    start_id = range.start_id,
                    range_len = range.range_len,
                    "posted message range"
                );
            },
            Err(err) => {
                tracing::error!(
                    %err,
                    generator_id = %range.generator_id,
                    start_id = range.start_id,
                    range_len = range.range_len,
                    "failed to post message range"
                );
            },
        }
    }
}

async fn post_message_range(
    client: &reqwest::Client,
    endpoint: &Url,
    kind: ControlKind,
    range: &RangeAnnouncement,
) -> Result<()> {
    let url = endpoint.join("/api/message_range")?;

    let request = match kind {
        ControlKind::New => client.post(url),
        ControlKind::Update => client.put(url),
    };

    let response = request.json(range).send().await?;
    if !response.status().is_success() {
        return Err(SpanfloodError::control(format!(
            "unexpected status code: {}",
            response.status()
        )));
    }

    Ok(())
}
