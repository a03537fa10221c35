//! Inventory reporter.
//!
//! On every tick the agent lists the images present on the node and posts
//! the full inventory to the controller's reporter endpoint as a
//! prost-encoded body over HTTP/2. Transient transport failures retry under
//! exponential backoff within the tick; once the steps are exhausted the
//! error is logged and the next tick starts over. A non-OK response status
//! is a hard error for the tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use lagoon_proto::reporter::{
    ReporterRequest, ReporterResponse, CONTENT_TYPE_PROTO, REPORT_PATH,
};
use lagoon_reconcile::Backoff;
use prost::Message;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::runtime::RuntimeClient;

/// Default reporting interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct Reporter {
    runtime: Arc<RuntimeClient>,
    client: reqwest::Client,
    endpoint: String,
    node_name: String,
    poll_interval: Duration,
    backoff: Backoff,
}

impl Reporter {
    pub fn new(
        runtime: Arc<RuntimeClient>,
        node_name: &str,
        endpoint: &str,
        poll_interval: Duration,
        ca: Option<reqwest::Certificate>,
        insecure_skip_verify: bool,
    ) -> Result<Self> {
        // HTTP/2 prior knowledge: the endpoint may be h2c or TLS.
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .http2_prior_knowledge()
            .danger_accept_invalid_certs(insecure_skip_verify)
            .timeout(Duration::from_secs(10));
        if let Some(ca) = ca {
            builder = builder.add_root_certificate(ca);
        }

        Ok(Self {
            runtime,
            client: builder.build()?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            node_name: node_name.to_string(),
            poll_interval,
            backoff: Backoff::reporter(),
        })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            node = %self.node_name,
            endpoint = %self.endpoint,
            interval_secs = self.poll_interval.as_secs(),
            "starting inventory reporter"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.report().await {
                        error!(error = %err, "failed to report image inventory");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("inventory reporter shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Report the current inventory once, retrying transport failures under
    /// backoff.
    async fn report(&self) -> Result<()> {
        let images = self.runtime.list().await?;
        let request = ReporterRequest {
            node: self.node_name.clone(),
            image: images,
        };
        let body = request.encode_to_vec();

        let mut attempt = 0u32;
        let response = loop {
            match self.send(body.clone()).await {
                Ok(response) => break response,
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.backoff.steps {
                        return Err(err);
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    debug!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "report attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        if !response.is_ok() {
            bail!(
                "reporter rejected inventory: status={} message={}",
                response.status,
                response.message
            );
        }

        debug!(images = request.image.len(), "inventory reported");
        Ok(())
    }

    async fn send(&self, body: Vec<u8>) -> Result<ReporterResponse> {
        let url = format!("{}{}", self.endpoint, REPORT_PATH);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_PROTO)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            bail!("report failed with status: {status}");
        }

        let bytes = response.bytes().await?;
        Ok(ReporterResponse::decode(bytes.as_ref())?)
    }
}
