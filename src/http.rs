use anyhow::Result;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, warn};
use reqwest::{Client, header::{HeaderMap, HeaderName, HeaderValue}};
use std::time::Duration;

use crate::error::FetchError;

/// 下载管理器使用的网络接口，非 2xx 响应视为错误
pub trait Fetcher: Send + Sync {
    fn fetch_text<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchError>>;

    fn fetch_bytes<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes, FetchError>>;
}

/// 构建HTTP客户端，包含自定义请求头
pub fn build_http_client(custom_headers: &[String], timeout: Duration) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "User-Agent",
        HeaderValue::from_static(concat!(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 ",
            "(KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36"
        )),
    );

    for header in custom_headers {
        if let Some((key, value)) = header.split_once(':') {
            let header_name = HeaderName::from_bytes(key.trim().as_bytes())?;
            let header_value = HeaderValue::from_str(value.trim())?;
            headers.insert(header_name, header_value);
        } else {
            warn!("Ignoring malformed header: {}", header);
        }
    }

    debug!("Using HTTP headers: {:?}", headers);

    let client = Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()?;

    Ok(client)
}

/// 基于共享 reqwest 客户端的 `Fetcher`
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let request_error = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch_text<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchError>> {
        async move {
            let response = self.get(url).await?;
            response.text().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })
        }
        .boxed()
    }

    fn fetch_bytes<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes, FetchError>> {
        async move {
            let response = self.get(url).await?;
            response.bytes().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })
        }
        .boxed()
    }
}
