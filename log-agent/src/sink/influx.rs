use super::line_protocol::encode_batch;
use super::{Precision, RecordSink};
use crate::error::SinkError;
use crate::record::Record;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct InfluxSettings {
    pub address: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub precision: Precision,
    pub request_timeout: Duration,
}

/// InfluxDB 1.x HTTP write client.
///
/// Holds one `reqwest::Client`, whose keep-alive pool is shared by every writer worker that
/// clones the surrounding `Arc`. Connections are reused across batches.
#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: Client,
    write_url: Url,
    username: String,
    password: String,
    precision: Precision,
}

impl InfluxSink {
    pub fn new(settings: &InfluxSettings) -> Result<Self> {
        let mut write_url = Url::parse(&settings.address)
            .with_context(|| format!("invalid sink address {:?}", settings.address))?;
        write_url
            .path_segments_mut()
            .map_err(|_| anyhow!("sink address {:?} cannot carry a path", settings.address))?
            .pop_if_empty()
            .push("write");
        write_url
            .query_pairs_mut()
            .append_pair("db", &settings.database)
            .append_pair("precision", settings.precision.as_str());

        let client = Client::builder()
            .timeout(settings.request_timeout)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .context("failed to build sink http client")?;

        Ok(Self {
            client,
            write_url,
            username: settings.username.clone(),
            password: settings.password.clone(),
            precision: settings.precision,
        })
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

#[async_trait]
impl RecordSink for InfluxSink {
    async fn write_batch(&self, records: &[Record]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }

        let body = encode_batch(records, self.precision);
        let mut request = self.client.post(self.write_url.clone()).body(body);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            debug!(points = records.len(), %status, "wrote batch to sink");
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY)
                .rev()
                .find(|idx| body.is_char_boundary(*idx))
                .unwrap_or(0);
            body.truncate(cut);
        }
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
