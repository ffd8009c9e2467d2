//! Reqwest-backed transport for recorded HTTP effects.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use keel::{HttpClient, HttpRequestRecord, HttpResponseRecord};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(
        &self,
        request: &HttpRequestRecord,
    ) -> anyhow::Result<HttpResponseRecord> {
        let method = reqwest::Method::from_str(&request.method)
            .with_context(|| format!("invalid http method: {}", request.method))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.context("executing http effect")?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await.context("reading http body")?;

        Ok(HttpResponseRecord {
            status,
            headers,
            body,
        })
    }
}
